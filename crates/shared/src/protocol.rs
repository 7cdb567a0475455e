use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Commands an observer may send over its socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    Ping,
    Limp,
    SetPenHeight { height: u16, rate: u16 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Current device connection; `path` is `None` while no device is attached.
    Dev { path: Option<String> },
    Progress { motion_idx: usize },
    Finished,
    Cancelled,
    Failed { error: String },
    Pong,
    Error(ApiError),
}

impl ServerEvent {
    /// Whether this event ends a plot.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerEvent::Finished | ServerEvent::Cancelled | ServerEvent::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub device: Option<String>,
    pub plotting: bool,
    pub observers: usize,
}
