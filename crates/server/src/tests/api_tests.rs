use std::time::Duration;

use super::*;
use crate::{
    engine::{PlotEngine, PlotSettings},
    hub::{NotificationHub, Subscription},
    supervisor::{DeviceSession, DeviceSupervisor},
    wake_lock::NoWakeLock,
};
use axum::{body, body::Body, http::Request};
use futures::{SinkExt, StreamExt};
use plotter::mock::MockConnector;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tower::ServiceExt;

const PATH: &str = "/dev/ttyACM0";

struct TestApp {
    app: Router,
    hub: NotificationHub,
}

fn build(hub: NotificationHub, device: DeviceSession, max_payload_bytes: usize) -> TestApp {
    let engine = PlotEngine::new(hub.clone(), PlotSettings::default(), Arc::new(NoWakeLock));
    let app = build_router(Arc::new(AppState {
        hub: hub.clone(),
        device,
        engine,
        max_payload_bytes,
    }));
    TestApp { app, hub }
}

/// No plotter attached, so plots are simulated.
fn test_app(max_payload_bytes: usize) -> TestApp {
    let hub = NotificationHub::new(64);
    let device = DeviceSupervisor::new(
        Arc::new(MockConnector::new(None)),
        hub.clone(),
        None,
        Duration::from_secs(5),
    )
    .session();
    build(hub, device, max_payload_bytes)
}

fn plan_json(durations: &[f64]) -> String {
    let motions: Vec<_> = durations
        .iter()
        .map(|duration| {
            serde_json::json!({
                "type": "xy",
                "segments": [{ "duration": duration, "steps": [120, -40] }]
            })
        })
        .collect();
    serde_json::json!({ "motions": motions }).to_string()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Bytes) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, body)
}

async fn post(app: &Router, uri: &str, body: impl Into<Body>) -> (StatusCode, Bytes) {
    let request = Request::post(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .expect("request");
    send(app, request).await
}

async fn get_status(app: &Router) -> StatusResponse {
    let request = Request::get("/status").body(Body::empty()).expect("request");
    let (status, body) = send(app, request).await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_slice(&body).expect("status json")
}

fn error_code(body: &[u8]) -> ErrorCode {
    serde_json::from_slice::<ApiError>(body)
        .expect("api error json")
        .code
}

async fn until_terminal(observer: &mut Subscription) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Some(event) = observer.recv().await {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Serves the router on an ephemeral local port.
async fn serve(test: &TestApp) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = test.app.clone();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn open_socket(addr: SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket handshake");
    socket
}

async fn next_event(socket: &mut Socket) -> ServerEvent {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("event within 5s")
            .expect("socket open")
            .expect("frame");
        if let WsMessage::Text(text) = message {
            return serde_json::from_str(&text).expect("event json");
        }
    }
}

async fn wait_for_observers(hub: &NotificationHub, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while hub.observer_count() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("observer count settles");
}

#[tokio::test]
async fn healthz_reports_ok() {
    let test = test_app(1024);
    let request = Request::get("/healthz").body(Body::empty()).expect("request");
    let (status, body) = send(&test.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn status_reports_device_plot_and_observers() {
    let test = test_app(1024);
    assert_eq!(
        get_status(&test.app).await,
        StatusResponse {
            device: None,
            plotting: false,
            observers: 0,
        }
    );

    let _observer = test.hub.subscribe();
    test.hub.publish_device(Some(PATH.to_string()));
    let status = get_status(&test.app).await;
    assert_eq!(status.device.as_deref(), Some(PATH));
    assert_eq!(status.observers, 1);
}

#[tokio::test]
async fn malformed_plans_are_rejected_before_running() {
    let test = test_app(1024);

    let (status, body) = post(&test.app, "/plot", "{ not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), ErrorCode::Validation);

    let (status, body) = post(&test.app, "/plot", plan_json(&[1.0, -2.0])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), ErrorCode::Validation);

    assert!(!get_status(&test.app).await.plotting);
}

#[tokio::test]
async fn overlong_motion_is_rejected_before_running() {
    let test = test_app(1024);
    let mut observer = test.hub.subscribe();

    let (status, body) = post(&test.app, "/plot", plan_json(&[1e20])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), ErrorCode::Validation);
    assert!(!get_status(&test.app).await.plotting);

    assert_eq!(observer.recv().await, Some(ServerEvent::Dev { path: None }));
    test.hub.broadcast(ServerEvent::Pong);
    assert_eq!(observer.recv().await, Some(ServerEvent::Pong));
}

#[tokio::test]
async fn oversized_plan_is_rejected() {
    let test = test_app(32);
    let (status, body) = post(&test.app, "/plot", plan_json(&[1.0, 1.0, 1.0])).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(error_code(&body), ErrorCode::PayloadTooLarge);
}

#[tokio::test(start_paused = true)]
async fn second_plot_conflicts_while_first_is_running() {
    let test = test_app(1024);

    let (status, _) = post(&test.app, "/plot", plan_json(&[10.0])).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(get_status(&test.app).await.plotting);

    let (status, body) = post(&test.app, "/plot", plan_json(&[1.0])).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&body), ErrorCode::Conflict);

    tokio::time::sleep(Duration::from_secs(11)).await;
    let (status, _) = post(&test.app, "/plot", plan_json(&[1.0])).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test(start_paused = true)]
async fn cancel_route_stops_the_running_plot() {
    let test = test_app(1024);
    let mut observer = test.hub.subscribe();

    let (status, _) = post(&test.app, "/plot", plan_json(&[1.0, 1.0, 1.0])).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (status, _) = post(&test.app, "/cancel", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        until_terminal(&mut observer).await,
        vec![
            ServerEvent::Dev { path: None },
            ServerEvent::Progress { motion_idx: 0 },
            ServerEvent::Cancelled,
        ]
    );
}

#[tokio::test]
async fn cancel_without_a_plot_is_ok() {
    let test = test_app(1024);
    let (status, _) = post(&test.app, "/cancel", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn plot_runs_on_the_connected_plotter() {
    let hub = NotificationHub::new(64);
    let connector = Arc::new(MockConnector::new(Some(PATH)));
    let supervisor = DeviceSupervisor::new(
        connector.clone(),
        hub.clone(),
        None,
        Duration::from_secs(5),
    );
    let mut session = supervisor.session();
    let task = supervisor.spawn();
    session.changed().await.expect("connected");

    let test = build(hub, session, 1024);
    let mut observer = test.hub.subscribe();
    let (status, _) = post(&test.app, "/plot", plan_json(&[0.5, 0.5])).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let events = until_terminal(&mut observer).await;
    assert_eq!(events.last(), Some(&ServerEvent::Finished));
    assert_eq!(connector.opened()[0].executed_motions().len(), 2);

    task.abort();
}

#[tokio::test]
async fn socket_is_greeted_with_the_device_state() {
    let test = test_app(1024);
    test.hub.publish_device(Some(PATH.to_string()));
    let addr = serve(&test).await;

    let mut socket = open_socket(addr).await;
    assert_eq!(
        next_event(&mut socket).await,
        ServerEvent::Dev {
            path: Some(PATH.to_string())
        }
    );
}

#[tokio::test]
async fn ping_is_answered_only_to_the_sender() {
    let test = test_app(1024);
    let addr = serve(&test).await;
    let mut first = open_socket(addr).await;
    let mut second = open_socket(addr).await;
    assert_eq!(next_event(&mut first).await, ServerEvent::Dev { path: None });
    assert_eq!(next_event(&mut second).await, ServerEvent::Dev { path: None });

    first
        .send(WsMessage::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .expect("send ping");
    assert_eq!(next_event(&mut first).await, ServerEvent::Pong);

    test.hub.broadcast(ServerEvent::Progress { motion_idx: 3 });
    assert_eq!(
        next_event(&mut second).await,
        ServerEvent::Progress { motion_idx: 3 }
    );
    assert_eq!(
        next_event(&mut first).await,
        ServerEvent::Progress { motion_idx: 3 }
    );
}

#[tokio::test]
async fn unreadable_command_gets_a_validation_error() {
    let test = test_app(1024);
    let addr = serve(&test).await;
    let mut socket = open_socket(addr).await;
    assert_eq!(next_event(&mut socket).await, ServerEvent::Dev { path: None });

    socket
        .send(WsMessage::Text("{ not a command".to_string()))
        .await
        .expect("send");
    match next_event(&mut socket).await {
        ServerEvent::Error(error) => assert_eq!(error.code, ErrorCode::Validation),
        other => panic!("expected an error event, got {other:?}"),
    }
}

#[tokio::test]
async fn broadcasts_reach_remaining_sockets_after_one_closes() {
    let test = test_app(1024);
    let addr = serve(&test).await;
    let mut leaving = open_socket(addr).await;
    let mut staying = open_socket(addr).await;
    assert_eq!(next_event(&mut leaving).await, ServerEvent::Dev { path: None });
    assert_eq!(next_event(&mut staying).await, ServerEvent::Dev { path: None });
    assert_eq!(test.hub.observer_count(), 2);

    leaving.close(None).await.expect("close");
    drop(leaving);
    wait_for_observers(&test.hub, 1).await;

    test.hub.broadcast(ServerEvent::Finished);
    assert_eq!(next_event(&mut staying).await, ServerEvent::Finished);
}
