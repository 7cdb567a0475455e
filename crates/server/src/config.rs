use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use config::{Config, Environment, File};
use plotter::SerialSettings;
use serde::Deserialize;

use crate::engine::PlotSettings;

pub const DEFAULT_CONFIG_FILE: &str = "plotterd.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    /// Serial path to open instead of discovering one.
    pub device: Option<String>,
    pub reconnect_backoff_secs: u64,
    pub max_payload_bytes: usize,
    pub pen_rate: u16,
    pub pen_raise_position: u16,
    pub microstepping_mode: u8,
    pub wake_lock: bool,
    pub serial_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9080".into(),
            device: None,
            reconnect_backoff_secs: 5,
            max_payload_bytes: 200 * 1024 * 1024,
            pen_rate: 1000,
            pen_raise_position: 28000,
            microstepping_mode: 1,
            wake_lock: true,
            serial_timeout_ms: 2000,
        }
    }
}

impl Settings {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn serial(&self) -> SerialSettings {
        SerialSettings {
            timeout: Duration::from_millis(self.serial_timeout_ms),
            ..SerialSettings::default()
        }
    }

    pub fn plot(&self) -> PlotSettings {
        PlotSettings {
            pen_rate: self.pen_rate,
            pen_raise_position: self.pen_raise_position,
            microstepping_mode: self.microstepping_mode,
        }
    }
}

#[derive(Debug, Default, Parser)]
#[command(name = "plotterd", version, about = "Pen plotter control service")]
pub struct Cli {
    /// Settings file; defaults to ./plotterd.toml when present.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub bind_addr: Option<String>,
    /// Serial port of the plotter, e.g. /dev/ttyACM0.
    #[arg(long)]
    pub device: Option<String>,
    #[arg(long)]
    pub max_payload_bytes: Option<usize>,
    #[arg(long)]
    pub no_wake_lock: bool,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(v) = &self.bind_addr {
            settings.bind_addr = v.clone();
        }
        if let Some(v) = &self.device {
            settings.device = Some(v.clone());
        }
        if let Some(v) = self.max_payload_bytes {
            settings.max_payload_bytes = v;
        }
        if self.no_wake_lock {
            settings.wake_lock = false;
        }
    }
}

/// Defaults, then the settings file, then `APP__*` variables, then flags.
pub fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let file = match &cli.config {
        Some(path) => File::from(path.as_path()).required(true),
        None => File::from(Path::new(DEFAULT_CONFIG_FILE)).required(false),
    };

    let mut settings: Settings = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(Config::try_deserialize)
        .context("failed to load settings")?;

    cli.apply(&mut settings);
    anyhow::ensure!(
        settings.reconnect_backoff_secs > 0,
        "reconnect_backoff_secs must be at least 1"
    );
    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
