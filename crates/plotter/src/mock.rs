//! Scripted plotter and connector for exercising the service without hardware.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use shared::domain::Motion;
use tokio::sync::watch;

use crate::{DeviceError, Plotter, PlotterConnector};

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    EnableMotors(u8),
    DisableMotors,
    SetPenHeight { height: u16, rate: u16 },
    ExecuteMotion(Motion),
    WaitUntilMotorsIdle,
}

/// Operation that should fail instead of succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    EnableMotors,
    SetPenHeight,
    /// Zero-based count of `execute_motion` calls.
    Motion(usize),
    WaitUntilMotorsIdle,
    DisableMotors,
}

/// Records every call; motions take their planned duration on the tokio clock.
pub struct MockPlotter {
    path: String,
    calls: Mutex<Vec<DeviceCall>>,
    motions: AtomicUsize,
    fail_at: Mutex<Option<FailPoint>>,
    closed: watch::Sender<bool>,
}

impl MockPlotter {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            calls: Mutex::new(Vec::new()),
            motions: AtomicUsize::new(0),
            fail_at: Mutex::new(None),
            closed: watch::channel(false).0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn failing_at(self, point: FailPoint) -> Self {
        self.set_fail_at(Some(point));
        self
    }

    pub fn set_fail_at(&self, point: Option<FailPoint>) {
        *self.fail_at.lock().unwrap_or_else(|e| e.into_inner()) = point;
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn executed_motions(&self) -> Vec<Motion> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DeviceCall::ExecuteMotion(motion) => Some(motion),
                _ => None,
            })
            .collect()
    }

    /// Simulates the cable being pulled.
    pub fn disconnect(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_disconnected(&self) -> bool {
        *self.closed.borrow()
    }

    fn record(&self, call: DeviceCall, point: FailPoint) -> Result<(), DeviceError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
        if self.is_disconnected() {
            return Err(DeviceError::Disconnected);
        }
        let fail_at = *self.fail_at.lock().unwrap_or_else(|e| e.into_inner());
        if fail_at == Some(point) {
            return Err(DeviceError::Rejected {
                command: format!("{point:?}"),
                response: "!0 injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Plotter for MockPlotter {
    async fn enable_motors(&self, microstepping_mode: u8) -> Result<(), DeviceError> {
        self.record(
            DeviceCall::EnableMotors(microstepping_mode),
            FailPoint::EnableMotors,
        )
    }

    async fn disable_motors(&self) -> Result<(), DeviceError> {
        self.record(DeviceCall::DisableMotors, FailPoint::DisableMotors)
    }

    async fn set_pen_height(&self, height: u16, rate: u16) -> Result<(), DeviceError> {
        self.record(
            DeviceCall::SetPenHeight { height, rate },
            FailPoint::SetPenHeight,
        )
    }

    async fn execute_motion(&self, motion: &Motion) -> Result<(), DeviceError> {
        let nth = self.motions.fetch_add(1, Ordering::SeqCst);
        self.record(DeviceCall::ExecuteMotion(motion.clone()), FailPoint::Motion(nth))?;
        tokio::time::sleep(motion.duration()).await;
        Ok(())
    }

    async fn wait_until_motors_idle(&self) -> Result<(), DeviceError> {
        self.record(
            DeviceCall::WaitUntilMotorsIdle,
            FailPoint::WaitUntilMotorsIdle,
        )
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Connector whose discovery results and open failures are scripted.
pub struct MockConnector {
    discoveries: Mutex<VecDeque<Option<String>>>,
    fallback: Option<String>,
    failing_opens: AtomicUsize,
    open_attempts: AtomicUsize,
    opened: Mutex<Vec<Arc<MockPlotter>>>,
}

impl MockConnector {
    /// Every discovery reports `path` unless scripted otherwise.
    pub fn new(path: Option<&str>) -> Self {
        Self {
            discoveries: Mutex::new(VecDeque::new()),
            fallback: path.map(str::to_string),
            failing_opens: AtomicUsize::new(0),
            open_attempts: AtomicUsize::new(0),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Results returned by the next discoveries, in order, before the fallback.
    pub fn with_discoveries(self, discoveries: Vec<Option<&str>>) -> Self {
        *self.discoveries.lock().unwrap_or_else(|e| e.into_inner()) = discoveries
            .into_iter()
            .map(|path| path.map(str::to_string))
            .collect();
        self
    }

    /// The next `count` opens fail.
    pub fn with_failing_opens(self, count: usize) -> Self {
        self.failing_opens.store(count, Ordering::SeqCst);
        self
    }

    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    /// Sessions handed out so far, oldest first.
    pub fn opened(&self) -> Vec<Arc<MockPlotter>> {
        self.opened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl PlotterConnector for MockConnector {
    async fn discover(&self) -> Result<Option<String>, DeviceError> {
        let scripted = self
            .discoveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Ok(scripted.unwrap_or_else(|| self.fallback.clone()))
    }

    async fn open(&self, path: &str) -> Result<Arc<dyn Plotter>, DeviceError> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DeviceError::Open {
                path: path.to_string(),
                reason: "Permission denied".to_string(),
            });
        }
        let plotter = Arc::new(MockPlotter::new(path));
        self.opened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&plotter));
        Ok(plotter)
    }
}
