//! Drives a plan motion by motion against the connected plotter, or against
//! the clock when none is attached.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};

use plotter::{DeviceError, Plotter};
use shared::{
    domain::{Motion, Plan},
    protocol::ServerEvent,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{hub::NotificationHub, supervisor::DeviceHandle, wake_lock::WakeLock};

#[derive(Debug, Clone, PartialEq)]
pub struct PlotSettings {
    /// Rate used for every pen move the engine issues on its own.
    pub pen_rate: u16,
    /// Servo position of a fully raised pen.
    pub pen_raise_position: u16,
    pub microstepping_mode: u8,
}

impl Default for PlotSettings {
    fn default() -> Self {
        Self {
            pen_rate: 1000,
            pen_raise_position: 28000,
            microstepping_mode: 1,
        }
    }
}

/// Cooperative stop request for one plot; checked after every motion.
#[derive(Debug, Default)]
pub struct CancelSignal(AtomicBool);

impl CancelSignal {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Returns whether a stop was requested and resets the flag.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlotOutcome {
    Finished,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a plot is already running")]
    Busy,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Clone)]
pub struct PlotEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    hub: NotificationHub,
    settings: PlotSettings,
    wake_lock: Arc<dyn WakeLock>,
    active: Mutex<Option<Arc<CancelSignal>>>,
}

impl EngineInner {
    fn active(&self) -> MutexGuard<'_, Option<Arc<CancelSignal>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Occupies the engine's single plot slot until dropped.
struct ActivePlot {
    inner: Arc<EngineInner>,
    signal: Arc<CancelSignal>,
}

impl Drop for ActivePlot {
    fn drop(&mut self) {
        let mut active = self.inner.active();
        if active
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &self.signal))
        {
            *active = None;
        }
    }
}

enum Executor<'a> {
    Device(&'a dyn Plotter),
    Simulation,
}

impl Executor<'_> {
    async fn execute(&self, motion: &Motion) -> Result<(), DeviceError> {
        match self {
            Executor::Device(plotter) => plotter.execute_motion(motion).await,
            Executor::Simulation => {
                tokio::time::sleep(motion.duration()).await;
                Ok(())
            }
        }
    }
}

impl PlotEngine {
    pub fn new(hub: NotificationHub, settings: PlotSettings, wake_lock: Arc<dyn WakeLock>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                hub,
                settings,
                wake_lock,
                active: Mutex::new(None),
            }),
        }
    }

    /// Starts `plan` in the background. The outcome is reported through the hub.
    pub fn start(&self, plan: Plan, device: Option<DeviceHandle>) -> Result<(), EngineError> {
        let active = self.claim()?;
        let engine = self.clone();
        tokio::spawn(async move {
            let _ = engine.execute(active, &plan, device).await;
        });
        Ok(())
    }

    /// Runs `plan` to completion on the current task.
    pub async fn run(
        &self,
        plan: &Plan,
        device: Option<DeviceHandle>,
    ) -> Result<PlotOutcome, EngineError> {
        let active = self.claim()?;
        self.execute(active, plan, device).await
    }

    /// Asks the running plot to stop after its current motion.
    pub fn cancel(&self) {
        match self.inner.active().as_ref() {
            Some(signal) => {
                signal.request();
                info!("plot cancellation requested");
            }
            None => debug!("cancel requested with no plot running"),
        }
    }

    pub fn is_plotting(&self) -> bool {
        self.inner.active().is_some()
    }

    fn claim(&self) -> Result<ActivePlot, EngineError> {
        let mut active = self.inner.active();
        if active.is_some() {
            return Err(EngineError::Busy);
        }
        let signal = Arc::new(CancelSignal::default());
        *active = Some(Arc::clone(&signal));
        Ok(ActivePlot {
            inner: Arc::clone(&self.inner),
            signal,
        })
    }

    async fn execute(
        &self,
        active: ActivePlot,
        plan: &Plan,
        device: Option<DeviceHandle>,
    ) -> Result<PlotOutcome, EngineError> {
        let _wake = match self.inner.wake_lock.acquire("plotting") {
            Ok(guard) => Some(guard),
            Err(error) => {
                warn!(%error, "could not keep the host awake; plotting anyway");
                None
            }
        };

        let result = match &device {
            Some(device) => {
                info!(path = device.path(), motions = plan.len(), "starting plot");
                let result = self.do_plot(plan, device.plotter(), &active.signal).await;
                self.report(&result);
                release_motors(device.plotter()).await;
                result
            }
            None => {
                info!(motions = plan.len(), "no plotter attached; simulating plot");
                let result = self.simulate_plot(plan, &active.signal).await;
                self.report(&result);
                result
            }
        };
        drop(active);
        result.map_err(EngineError::from)
    }

    async fn do_plot(
        &self,
        plan: &Plan,
        plotter: &dyn Plotter,
        cancel: &CancelSignal,
    ) -> Result<PlotOutcome, DeviceError> {
        let settings = &self.inner.settings;
        plotter.enable_motors(settings.microstepping_mode).await?;
        if let Some(pen) = plan.first_pen_motion() {
            plotter
                .set_pen_height(pen.initial_pos, settings.pen_rate)
                .await?;
        }

        let outcome = self
            .run_motions(plan, cancel, Executor::Device(plotter))
            .await?;
        if outcome == PlotOutcome::Cancelled {
            plotter
                .set_pen_height(settings.pen_raise_position, settings.pen_rate)
                .await?;
        }
        Ok(outcome)
    }

    async fn simulate_plot(
        &self,
        plan: &Plan,
        cancel: &CancelSignal,
    ) -> Result<PlotOutcome, DeviceError> {
        self.run_motions(plan, cancel, Executor::Simulation).await
    }

    async fn run_motions(
        &self,
        plan: &Plan,
        cancel: &CancelSignal,
        executor: Executor<'_>,
    ) -> Result<PlotOutcome, DeviceError> {
        cancel.clear();
        for (motion_idx, motion) in plan.motions().iter().enumerate() {
            self.inner.hub.broadcast(ServerEvent::Progress { motion_idx });
            executor.execute(motion).await?;
            if cancel.take() {
                info!(motion_idx, "plot cancelled");
                return Ok(PlotOutcome::Cancelled);
            }
        }
        Ok(PlotOutcome::Finished)
    }

    fn report(&self, result: &Result<PlotOutcome, DeviceError>) {
        let event = match result {
            Ok(PlotOutcome::Finished) => {
                info!("plot finished");
                ServerEvent::Finished
            }
            Ok(PlotOutcome::Cancelled) => ServerEvent::Cancelled,
            Err(err) => {
                error!(error = %err, "plot failed");
                ServerEvent::Failed {
                    error: err.to_string(),
                }
            }
        };
        self.inner.hub.broadcast(event);
    }
}

/// Both steps are attempted whatever the other one returns.
async fn release_motors(plotter: &dyn Plotter) {
    if let Err(error) = plotter.wait_until_motors_idle().await {
        warn!(%error, "failed waiting for motors to go idle");
    }
    if let Err(error) = plotter.disable_motors().await {
        warn!(%error, "failed to disable motors");
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
