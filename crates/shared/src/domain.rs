use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One servo move of the pen lift between two positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PenMotion {
    pub initial_pos: u16,
    pub final_pos: u16,
    /// Seconds.
    pub duration: f64,
}

/// A timed stepper move; both axes start and stop together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSegment {
    /// Seconds.
    pub duration: f64,
    pub steps: [i32; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XyMotion {
    pub segments: Vec<StepSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Motion {
    Pen(PenMotion),
    Xy(XyMotion),
}

/// Longest single motion a plan may contain.
pub const MAX_MOTION_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

impl Motion {
    /// Saturates instead of panicking on values a validated plan never holds.
    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.seconds().max(0.0)).unwrap_or(Duration::MAX)
    }

    fn seconds(&self) -> f64 {
        match self {
            Motion::Pen(pen) => pen.duration,
            Motion::Xy(xy) => xy.segments.iter().map(|segment| segment.duration).sum(),
        }
    }

    pub fn as_pen(&self) -> Option<&PenMotion> {
        match self {
            Motion::Pen(pen) => Some(pen),
            Motion::Xy(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("motion {index} has an invalid duration {duration}")]
    InvalidDuration { index: usize, duration: f64 },
    #[error("motion {index} has an empty segment list")]
    EmptyMotion { index: usize },
    #[error("motion {index} lasts {duration}s, longer than the {limit:?} limit")]
    TooLong {
        index: usize,
        duration: f64,
        limit: Duration,
    },
}

/// Ordered, immutable list of motions making up one plotting job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    motions: Vec<Motion>,
}

impl Plan {
    pub fn new(motions: Vec<Motion>) -> Result<Self, PlanError> {
        let plan = Self { motions };
        plan.validate()?;
        Ok(plan)
    }

    /// Parses and validates a plan submitted by a client.
    pub fn from_json(raw: &[u8]) -> Result<Self, PlanError> {
        let plan: Plan = serde_json::from_slice(raw)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn motions(&self) -> &[Motion] {
        &self.motions
    }

    pub fn len(&self) -> usize {
        self.motions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.motions.is_empty()
    }

    pub fn first_pen_motion(&self) -> Option<&PenMotion> {
        self.motions.iter().find_map(Motion::as_pen)
    }

    pub fn duration(&self) -> Duration {
        self.motions
            .iter()
            .map(Motion::duration)
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    fn validate(&self) -> Result<(), PlanError> {
        let bad = |duration: f64| !duration.is_finite() || duration < 0.0;
        for (index, motion) in self.motions.iter().enumerate() {
            match motion {
                Motion::Pen(pen) if bad(pen.duration) => {
                    return Err(PlanError::InvalidDuration {
                        index,
                        duration: pen.duration,
                    });
                }
                Motion::Pen(_) => {}
                Motion::Xy(xy) => {
                    if xy.segments.is_empty() {
                        return Err(PlanError::EmptyMotion { index });
                    }
                    if let Some(segment) = xy.segments.iter().find(|s| bad(s.duration)) {
                        return Err(PlanError::InvalidDuration {
                            index,
                            duration: segment.duration,
                        });
                    }
                }
            }
            let duration = motion.seconds();
            if duration > MAX_MOTION_DURATION.as_secs_f64() {
                return Err(PlanError::TooLong {
                    index,
                    duration,
                    limit: MAX_MOTION_DURATION,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
