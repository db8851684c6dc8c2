use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio_serial::{
    DataBits, ErrorKind, FlowControl, Parity, SerialPortBuilderExt, SerialPortType, StopBits,
};
use tracing::{debug, info, warn};

use crate::{LinkError, LinkIo, SerialConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Unknown,
    Denied,
    Granted,
}

/// One discovered serial interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: String,
    pub permission: Permission,
    pub description: Option<String>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>, permission: Permission) -> Self {
        Self { id: id.into(), permission, description: None }
    }
}

/// Source of serial devices for a session.
pub trait DeviceProvider: Send + Sync {
    /// Eligible devices, best candidate first.
    fn scan(&self) -> Result<Vec<DeviceHandle>>;

    /// Ask for access out of band. The answer arrives as an operator grant/deny.
    fn request_permission(&self, device: &DeviceHandle);

    /// Open the device with the configured line parameters.
    fn open(&self, device: &DeviceHandle) -> Result<Box<dyn LinkIo>, LinkError>;
}

pub fn default_candidate_devs() -> Vec<String> {
    vec![
        "/dev/ttyUSB0".into(),
        "/dev/ttyUSB1".into(),
        "/dev/ttyACM0".into(),
        "/dev/ttyACM1".into(),
    ]
}

/// Devices found through the OS serial enumeration plus the candidate list.
pub struct SystemDevices {
    cfg: SerialConfig,
}

impl SystemDevices {
    pub fn new(cfg: SerialConfig) -> Self {
        Self { cfg }
    }

    fn probe(&self, path: &str) -> Option<Permission> {
        // quick open/close; the port is reopened for real once the session owns it
        match tokio_serial::new(path, self.cfg.baud())
            .timeout(Duration::from_millis(50))
            .open()
        {
            Ok(_) => Some(Permission::Granted),
            Err(e) => match e.kind {
                ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => Some(Permission::Denied),
                ErrorKind::NoDevice => None,
                ErrorKind::Io(std::io::ErrorKind::NotFound) => None,
                _ => {
                    debug!("serial probe {} inconclusive: {}", path, e);
                    Some(Permission::Unknown)
                }
            },
        }
    }
}

impl DeviceProvider for SystemDevices {
    fn scan(&self) -> Result<Vec<DeviceHandle>> {
        if let Some(dev) = &self.cfg.device {
            return Ok(self
                .probe(dev)
                .map(|p| vec![DeviceHandle::new(dev.clone(), p)])
                .unwrap_or_default());
        }

        let mut found: Vec<DeviceHandle> = Vec::new();

        let ports = tokio_serial::available_ports().context("enumerate serial ports")?;
        for port in ports {
            let SerialPortType::UsbPort(usb) = &port.port_type else { continue };
            let Some(permission) = self.probe(&port.port_name) else { continue };
            let mut handle = DeviceHandle::new(port.port_name.clone(), permission);
            handle.description = Some(format!(
                "{:04x}:{:04x} {}",
                usb.vid,
                usb.pid,
                usb.product.clone().unwrap_or_default()
            ));
            found.push(handle);
        }

        let candidates = self.cfg.candidate_devs.clone().unwrap_or_else(default_candidate_devs);
        for dev in candidates {
            if found.iter().any(|d| d.id == dev) || !Path::new(&dev).exists() {
                continue;
            }
            if let Some(permission) = self.probe(&dev) {
                found.push(DeviceHandle::new(dev, permission));
            }
        }

        info!("serial scan: {} eligible device(s)", found.len());
        Ok(found)
    }

    fn request_permission(&self, device: &DeviceHandle) {
        warn!(
            "serial: no access to {}; grant read/write access (e.g. join the `dialout` group) and confirm with `grant`",
            device.id
        );
    }

    fn open(&self, device: &DeviceHandle) -> Result<Box<dyn LinkIo>, LinkError> {
        let port = tokio_serial::new(&device.id, self.cfg.baud())
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(self.cfg.link().read_timeout)
            .open_native_async()
            .map_err(|e| match e.kind {
                ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    LinkError::PermissionDenied(device.id.clone())
                }
                _ => LinkError::Open { path: device.id.clone(), source: e },
            })?;

        info!("serial: opened {} @ {} 8N1", device.id, self.cfg.baud());
        Ok(Box::new(port))
    }
}
