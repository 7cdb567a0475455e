//! Device side of the plotter service: the capability trait every plotter
//! session implements, the EiBotBoard serial driver, port discovery and a
//! scripted mock used by tests.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::domain::Motion;
use thiserror::Error;

pub mod discovery;
pub mod ebb;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use discovery::{find_plotter, list_ports, PortInfo, SerialConnector};
pub use ebb::{EbbPlotter, SerialSettings};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to enumerate serial ports: {0}")]
    Discovery(String),
    #[error("failed to open {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("device disconnected")]
    Disconnected,
    #[error("device i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no reply to `{command}` within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("device rejected `{command}`: {response}")]
    Rejected { command: String, response: String },
}

/// One live session with a plotter. Every call after the link has closed
/// fails with [`DeviceError::Disconnected`].
#[async_trait]
pub trait Plotter: Send + Sync {
    async fn enable_motors(&self, microstepping_mode: u8) -> Result<(), DeviceError>;

    async fn disable_motors(&self) -> Result<(), DeviceError>;

    async fn set_pen_height(&self, height: u16, rate: u16) -> Result<(), DeviceError>;

    async fn execute_motion(&self, motion: &Motion) -> Result<(), DeviceError>;

    async fn wait_until_motors_idle(&self) -> Result<(), DeviceError>;

    /// Resolves once the underlying link has closed or errored.
    async fn closed(&self);
}

/// Finds and opens plotter sessions for the connection supervisor.
#[async_trait]
pub trait PlotterConnector: Send + Sync {
    /// Returns the path of a candidate device, if any is attached.
    async fn discover(&self) -> Result<Option<String>, DeviceError>;

    async fn open(&self, path: &str) -> Result<Arc<dyn Plotter>, DeviceError>;
}
