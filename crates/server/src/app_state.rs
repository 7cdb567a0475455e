use crate::{engine::PlotEngine, hub::NotificationHub, supervisor::DeviceSession};

#[derive(Clone)]
pub struct AppState {
    pub hub: NotificationHub,
    pub device: DeviceSession,
    pub engine: PlotEngine,
    pub max_payload_bytes: usize,
}
