pub mod bridge;
pub mod discovery;
pub mod network;

use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

pub use bridge::{Bridge, BridgeStats, RunError, Side};
pub use discovery::{DeviceHandle, DeviceProvider, Permission, SystemDevices};
pub use network::NetworkEndpoint;

pub const DEFAULT_BAUD: u32 = 57600;
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Any duplex byte stream a bridge worker can own.
pub trait LinkIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> LinkIo for T {}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("open serial device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },

    #[error("permission denied for {0}")]
    PermissionDenied(String),

    #[error("bind tcp port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("accept on tcp port {port}: {source}")]
    Accept {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SerialConfig {
    /// Pin the bridge to one device path instead of scanning.
    pub device: Option<String>,

    /// Extra device paths checked after the USB scan. Example:
    /// ["/dev/ttyUSB0","/dev/ttyACM0"]
    pub candidate_devs: Option<Vec<String>>,

    /// Line rate; data bits / stop bits / parity are fixed at 8N1.
    pub baud: Option<u32>,

    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,

    /// Read and write buffer size for both bridge endpoints.
    pub buffer_size: Option<usize>,
}

impl SerialConfig {
    pub fn baud(&self) -> u32 {
        self.baud.unwrap_or(DEFAULT_BAUD)
    }

    pub fn link(&self) -> LinkConfig {
        let buffer = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE).max(1);
        LinkConfig {
            read_buffer_size: buffer,
            write_buffer_size: buffer,
            read_timeout: Duration::from_millis(self.read_timeout_ms.unwrap_or(DEFAULT_IO_TIMEOUT_MS)),
            write_timeout: Duration::from_millis(self.write_timeout_ms.unwrap_or(DEFAULT_IO_TIMEOUT_MS)),
        }
    }
}

/// Per-endpoint I/O parameters applied by the bridge workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        SerialConfig::default().link()
    }
}
