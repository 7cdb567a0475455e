//! HTTP and WebSocket surface of the service.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        rejection::BytesRejection,
        ws::{Message, WebSocket},
        DefaultBodyLimit, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use shared::{
    domain::Plan,
    error::{ApiError, ErrorCode},
    protocol::{ServerEvent, StatusResponse},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    app_state::AppState,
    commands::{handle_command, parse_command},
    engine::EngineError,
    supervisor::DeviceHandle,
};

const REPLY_BUFFER: usize = 16;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_payload_bytes);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/plot", post(submit_plot).layer(body_limit))
        .route("/cancel", post(cancel))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        device: state.hub.device_path(),
        plotting: state.engine.is_plotting(),
        observers: state.hub.observer_count(),
    })
}

async fn submit_plot(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> ApiResult<StatusCode> {
    let body = body.map_err(|rejection| {
        let status = rejection.status();
        let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
            ErrorCode::PayloadTooLarge
        } else {
            ErrorCode::Validation
        };
        (status, Json(ApiError::new(code, rejection.body_text())))
    })?;

    let plan = Plan::from_json(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, Json(ApiError::from(e))))?;

    let device = state.device.current();
    info!(
        motions = plan.len(),
        device = ?device.as_ref().map(DeviceHandle::path),
        "plot submitted"
    );
    state.engine.start(plan, device).map_err(|e| match e {
        EngineError::Busy => (
            StatusCode::CONFLICT,
            Json(ApiError::new(ErrorCode::Conflict, e.to_string())),
        ),
        EngineError::Device(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::DeviceFailure, e.to_string())),
        ),
    })?;

    Ok(StatusCode::ACCEPTED)
}

async fn cancel(State(state): State<Arc<AppState>>) -> StatusCode {
    state.engine.cancel();
    StatusCode::OK
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events = state.hub.subscribe();
    let (replies_tx, mut replies_rx) = mpsc::channel::<ServerEvent>(REPLY_BUFFER);
    debug!(observers = state.hub.observer_count(), "observer connected");

    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(event) = events.recv() => event,
                Some(reply) = replies_rx.recv() => reply,
                else => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(error) => {
                    warn!(%error, "failed to encode event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                debug!("observer socket closed");
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let reply = match parse_command(&text) {
            Ok(command) => handle_command(state.device.current(), command).await,
            Err(reply) => Some(reply),
        };
        if let Some(reply) = reply {
            if replies_tx.send(reply).await.is_err() {
                break;
            }
        }
    }

    send_task.abort();
    debug!("observer disconnected");
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
