//! Serial port enumeration and the connector the supervisor uses in production.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_serial::{SerialPortInfo, SerialPortType};

use crate::{
    ebb::{EbbPlotter, SerialSettings},
    DeviceError, Plotter, PlotterConnector,
};

/// Microchip vendor id used by the EiBotBoard.
pub const EBB_VENDOR_ID: u16 = 0x04D8;
pub const EBB_PRODUCT_ID: u16 = 0xFD92;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub path: String,
    pub description: String,
    pub is_plotter: bool,
}

/// Lists every serial port the OS reports, flagging likely plotters.
pub fn list_ports() -> Result<Vec<PortInfo>, DeviceError> {
    let ports = tokio_serial::available_ports().map_err(|e| {
        tracing::warn!("failed to enumerate serial ports: {e}");
        DeviceError::Discovery(e.to_string())
    })?;
    Ok(ports
        .iter()
        .map(|port| PortInfo {
            path: port.port_name.clone(),
            description: describe(port),
            is_plotter: is_ebb(port),
        })
        .collect())
}

/// Path of the first attached EiBotBoard, if any.
pub fn find_plotter() -> Result<Option<String>, DeviceError> {
    Ok(list_ports()?
        .into_iter()
        .find(|port| port.is_plotter)
        .map(|port| port.path))
}

fn is_ebb(port: &SerialPortInfo) -> bool {
    match &port.port_type {
        SerialPortType::UsbPort(usb) => {
            (usb.vid == EBB_VENDOR_ID && usb.pid == EBB_PRODUCT_ID)
                || usb
                    .manufacturer
                    .as_deref()
                    .is_some_and(|m| m.contains("SchmalzHaus"))
        }
        _ => false,
    }
}

fn describe(port: &SerialPortInfo) -> String {
    match &port.port_type {
        SerialPortType::UsbPort(usb) => format!(
            "USB {:04x}:{:04x} {} {}",
            usb.vid,
            usb.pid,
            usb.manufacturer.as_deref().unwrap_or("Device"),
            usb.product.as_deref().unwrap_or("Serial Port")
        ),
        SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Discovers EiBotBoards over USB serial and opens them with [`EbbPlotter`].
#[derive(Debug, Clone, Default)]
pub struct SerialConnector {
    settings: SerialSettings,
}

impl SerialConnector {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl PlotterConnector for SerialConnector {
    async fn discover(&self) -> Result<Option<String>, DeviceError> {
        tokio::task::spawn_blocking(find_plotter)
            .await
            .map_err(|e| DeviceError::Discovery(e.to_string()))?
    }

    async fn open(&self, path: &str) -> Result<Arc<dyn Plotter>, DeviceError> {
        let plotter = EbbPlotter::open(path, &self.settings)?;
        Ok(Arc::new(plotter))
    }
}
