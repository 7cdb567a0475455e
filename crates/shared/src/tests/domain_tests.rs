use super::*;

fn pen(initial_pos: u16, final_pos: u16, duration: f64) -> Motion {
    Motion::Pen(PenMotion {
        initial_pos,
        final_pos,
        duration,
    })
}

fn xy(durations: &[f64]) -> Motion {
    Motion::Xy(XyMotion {
        segments: durations
            .iter()
            .map(|duration| StepSegment {
                duration: *duration,
                steps: [100, -40],
            })
            .collect(),
    })
}

#[test]
fn parses_tagged_motion_list() {
    let raw = br#"{
        "motions": [
            { "type": "pen", "initialPos": 28000, "finalPos": 12000, "duration": 0.25 },
            { "type": "xy", "segments": [ { "duration": 0.5, "steps": [10, -3] } ] }
        ]
    }"#;
    let plan = Plan::from_json(raw).expect("plan");
    assert_eq!(plan.len(), 2);
    assert_eq!(plan.motions()[0], pen(28000, 12000, 0.25));
    assert_eq!(plan.first_pen_motion().map(|p| p.initial_pos), Some(28000));
}

#[test]
fn xy_duration_is_sum_of_segments() {
    let motion = xy(&[0.25, 0.5, 0.25]);
    assert_eq!(motion.duration(), Duration::from_secs(1));
}

#[test]
fn plan_duration_spans_all_motions() {
    let plan = Plan::new(vec![pen(1, 2, 1.0), xy(&[2.0])]).expect("plan");
    assert_eq!(plan.duration(), Duration::from_secs(3));
}

#[test]
fn rejects_unknown_motion_kind() {
    let raw = br#"{ "motions": [ { "type": "teleport" } ] }"#;
    assert!(matches!(Plan::from_json(raw), Err(PlanError::Malformed(_))));
}

#[test]
fn rejects_negative_duration() {
    let err = Plan::new(vec![xy(&[0.1]), pen(1, 2, -1.0)]).expect_err("should fail");
    assert!(matches!(err, PlanError::InvalidDuration { index: 1, .. }));
}

#[test]
fn rejects_xy_motion_without_segments() {
    let err = Plan::new(vec![xy(&[])]).expect_err("should fail");
    assert!(matches!(err, PlanError::EmptyMotion { index: 0 }));
}

#[test]
fn plan_without_pen_motion_has_no_initial_pen() {
    let plan = Plan::new(vec![xy(&[0.1])]).expect("plan");
    assert!(plan.first_pen_motion().is_none());
}

#[test]
fn rejects_motion_longer_than_the_limit() {
    let err = Plan::new(vec![xy(&[0.5]), xy(&[1e20])]).expect_err("should fail");
    assert!(matches!(err, PlanError::TooLong { index: 1, .. }));

    let raw = br#"{ "motions": [ { "type": "pen", "initialPos": 1, "finalPos": 2, "duration": 1e20 } ] }"#;
    assert!(matches!(
        Plan::from_json(raw),
        Err(PlanError::TooLong { index: 0, .. })
    ));
}

#[test]
fn rejects_segments_whose_sum_overflows() {
    let err = Plan::new(vec![xy(&[f64::MAX, f64::MAX])]).expect_err("should fail");
    assert!(matches!(err, PlanError::TooLong { index: 0, .. }));
}

#[test]
fn motion_up_to_the_limit_is_accepted() {
    let limit = MAX_MOTION_DURATION.as_secs_f64();
    let plan = Plan::new(vec![xy(&[limit / 2.0, limit / 2.0])]).expect("plan");
    assert_eq!(plan.duration(), MAX_MOTION_DURATION);
}

#[test]
fn duration_saturates_for_unvalidated_motions() {
    assert_eq!(xy(&[1e20]).duration(), Duration::MAX);
    assert_eq!(pen(1, 2, f64::INFINITY).duration(), Duration::MAX);
    assert_eq!(pen(1, 2, f64::NAN).duration(), Duration::ZERO);
}
