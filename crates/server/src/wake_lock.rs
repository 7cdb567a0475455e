//! Keeps the host from sleeping while a plot runs.

use std::{any::Any, io};

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WakeLockError {
    #[error("keeping the host awake is not supported on {0}")]
    Unsupported(&'static str),
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Held for as long as the host must stay awake; dropping it releases the lock.
pub struct WakeGuard {
    _resource: Option<Box<dyn Any + Send>>,
}

impl WakeGuard {
    pub fn holding(resource: impl Any + Send) -> Self {
        Self {
            _resource: Some(Box::new(resource)),
        }
    }

    pub fn empty() -> Self {
        Self { _resource: None }
    }
}

pub trait WakeLock: Send + Sync {
    fn acquire(&self, reason: &str) -> Result<WakeGuard, WakeLockError>;
}

/// Used when the wake lock is turned off in the settings.
pub struct NoWakeLock;

impl WakeLock for NoWakeLock {
    fn acquire(&self, _reason: &str) -> Result<WakeGuard, WakeLockError> {
        Ok(WakeGuard::empty())
    }
}

/// Holds the platform's sleep inhibitor (`systemd-inhibit` on Linux,
/// `caffeinate` on macOS) as a child process killed when the guard drops.
#[derive(Debug, Default)]
pub struct SystemWakeLock;

impl WakeLock for SystemWakeLock {
    fn acquire(&self, reason: &str) -> Result<WakeGuard, WakeLockError> {
        let (program, mut command) = inhibitor_command(reason)?;
        let child = command
            .kill_on_drop(true)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|source| WakeLockError::Spawn { program, source })?;
        debug!(program, pid = ?child.id(), "holding wake lock");
        Ok(WakeGuard::holding(child))
    }
}

#[cfg(target_os = "linux")]
fn inhibitor_command(reason: &str) -> Result<(&'static str, Command), WakeLockError> {
    let program = "systemd-inhibit";
    let mut command = Command::new(program);
    command.args([
        "--what=idle:sleep",
        "--who=plotterd",
        &format!("--why={reason}"),
        "--mode=block",
        "sleep",
        "infinity",
    ]);
    Ok((program, command))
}

#[cfg(target_os = "macos")]
fn inhibitor_command(_reason: &str) -> Result<(&'static str, Command), WakeLockError> {
    let program = "caffeinate";
    let mut command = Command::new(program);
    command.arg("-i");
    Ok((program, command))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn inhibitor_command(_reason: &str) -> Result<(&'static str, Command), WakeLockError> {
    Err(WakeLockError::Unsupported(std::env::consts::OS))
}
