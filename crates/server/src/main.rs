use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use clap::Parser;
use plotter::SerialConnector;
use plotterd::{
    api::build_router,
    app_state::AppState,
    config::{load_settings, Cli},
    engine::PlotEngine,
    hub::NotificationHub,
    supervisor::DeviceSupervisor,
    wake_lock::{NoWakeLock, SystemWakeLock, WakeLock},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How many events a slow observer may fall behind before it loses some.
const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    let hub = NotificationHub::new(EVENT_BUFFER);
    let supervisor = DeviceSupervisor::new(
        Arc::new(SerialConnector::new(settings.serial())),
        hub.clone(),
        settings.device.clone(),
        settings.reconnect_backoff(),
    );
    let device = supervisor.session();
    supervisor.spawn();

    let wake_lock: Arc<dyn WakeLock> = if settings.wake_lock {
        Arc::new(SystemWakeLock)
    } else {
        Arc::new(NoWakeLock)
    };
    let engine = PlotEngine::new(hub.clone(), settings.plot(), wake_lock);

    let state = AppState {
        hub,
        device,
        engine,
        max_payload_bytes: settings.max_payload_bytes,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address '{}'", settings.bind_addr))?;
    info!(%addr, "plotterd listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
