//! Keeps one plotter session alive across unplugs, failed opens and absent
//! hardware, and publishes every edge to the hub.

use std::{fmt, sync::Arc, time::Duration};

use plotter::{Plotter, PlotterConnector};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::hub::NotificationHub;

/// A live plotter session. Cloning shares the same underlying link.
#[derive(Clone)]
pub struct DeviceHandle {
    path: String,
    plotter: Arc<dyn Plotter>,
}

impl DeviceHandle {
    pub fn new(path: impl Into<String>, plotter: Arc<dyn Plotter>) -> Self {
        Self {
            path: path.into(),
            plotter,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn plotter(&self) -> &dyn Plotter {
        self.plotter.as_ref()
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub enum ConnectionState {
    #[default]
    Absent,
    Connected(DeviceHandle),
}

impl ConnectionState {
    pub fn handle(&self) -> Option<&DeviceHandle> {
        match self {
            ConnectionState::Absent => None,
            ConnectionState::Connected(handle) => Some(handle),
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.handle().map(DeviceHandle::path)
    }
}

/// Read side of the supervisor's connection state.
#[derive(Clone)]
pub struct DeviceSession {
    state: watch::Receiver<ConnectionState>,
}

impl DeviceSession {
    pub fn current(&self) -> Option<DeviceHandle> {
        self.state.borrow().handle().cloned()
    }

    /// Waits for the next transition and returns the new state.
    pub async fn changed(&mut self) -> Option<ConnectionState> {
        self.state.changed().await.ok()?;
        Some(self.state.borrow_and_update().clone())
    }
}

pub struct DeviceSupervisor {
    connector: Arc<dyn PlotterConnector>,
    hub: NotificationHub,
    fixed_path: Option<String>,
    backoff: Duration,
    state: watch::Sender<ConnectionState>,
}

impl DeviceSupervisor {
    /// With a `fixed_path` discovery is skipped and that path is opened on
    /// every attempt.
    pub fn new(
        connector: Arc<dyn PlotterConnector>,
        hub: NotificationHub,
        fixed_path: Option<String>,
        backoff: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Absent);
        Self {
            connector,
            hub,
            fixed_path,
            backoff,
            state,
        }
    }

    pub fn session(&self) -> DeviceSession {
        DeviceSession {
            state: self.state.subscribe(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs forever; device errors are logged and retried, never returned.
    pub async fn run(self) {
        loop {
            let Some(path) = self.candidate().await else {
                tokio::time::sleep(self.backoff).await;
                continue;
            };

            let plotter = match self.connector.open(&path).await {
                Ok(plotter) => plotter,
                Err(error) => {
                    warn!(%path, %error, backoff = ?self.backoff, "failed to open plotter; retrying");
                    tokio::time::sleep(self.backoff).await;
                    continue;
                }
            };

            let handle = DeviceHandle::new(path, plotter);
            self.transition(ConnectionState::Connected(handle.clone()));
            handle.plotter().closed().await;
            self.transition(ConnectionState::Absent);
        }
    }

    async fn candidate(&self) -> Option<String> {
        if let Some(path) = &self.fixed_path {
            return Some(path.clone());
        }
        match self.connector.discover().await {
            Ok(Some(path)) => Some(path),
            Ok(None) => {
                debug!("no plotter attached");
                None
            }
            Err(error) => {
                warn!(%error, "plotter discovery failed");
                None
            }
        }
    }

    fn transition(&self, state: ConnectionState) {
        let path = state.path().map(str::to_string);
        match &path {
            Some(path) => info!(%path, "plotter connected"),
            None => info!("plotter disconnected"),
        }
        self.state.send_replace(state);
        self.hub.publish_device(path);
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
