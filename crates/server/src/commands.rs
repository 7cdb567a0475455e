//! Commands an observer sends over its socket that go straight to the device.

use shared::{
    error::{ApiError, ErrorCode},
    protocol::{ClientCommand, ServerEvent},
};
use tracing::{debug, info, warn};

use crate::supervisor::DeviceHandle;

/// Runs one command and returns the reply meant for the sender alone, if any.
pub async fn handle_command(
    device: Option<DeviceHandle>,
    command: ClientCommand,
) -> Option<ServerEvent> {
    let (device, result) = match (command, device) {
        (ClientCommand::Ping, _) => return Some(ServerEvent::Pong),
        (command, None) => {
            info!(?command, "no plotter attached; ignoring command");
            return Some(ServerEvent::Error(ApiError::new(
                ErrorCode::DeviceUnavailable,
                "no plotter attached",
            )));
        }
        (ClientCommand::Limp, Some(device)) => {
            debug!(path = device.path(), "disabling motors");
            let result = device.plotter().disable_motors().await;
            (device, result)
        }
        (ClientCommand::SetPenHeight { height, rate }, Some(device)) => {
            debug!(path = device.path(), height, rate, "moving pen");
            let result = device.plotter().set_pen_height(height, rate).await;
            (device, result)
        }
    };

    match result {
        Ok(()) => None,
        Err(error) => {
            warn!(path = device.path(), %error, "device command failed");
            Some(ServerEvent::Error(ApiError::new(
                ErrorCode::DeviceFailure,
                error.to_string(),
            )))
        }
    }
}

/// Parses one inbound text frame; the error reply goes back to the sender only.
pub fn parse_command(text: &str) -> Result<ClientCommand, ServerEvent> {
    serde_json::from_str(text).map_err(|error| {
        debug!(%error, "unparseable command");
        ServerEvent::Error(ApiError::new(
            ErrorCode::Validation,
            format!("invalid command: {error}"),
        ))
    })
}
