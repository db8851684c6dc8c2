pub mod decode;
pub mod mav;

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use tether_proto::{Feed, GeoPoint, MissionItem, TelemetryValue};

pub use mav::{MavlinkConnector, MavlinkSystem};

/// Failure codes reported by the vehicle or by the endpoint itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorCode {
    Denied,
    TemporarilyRejected,
    Unsupported,
    Failed,
    Cancelled,
    Timeout,
    ConnectionError,
    InvalidSequence,
    TooManyItems,
    InvalidArgument,
    Unknown,
}

impl fmt::Display for RemoteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteErrorCode::Denied => "COMMAND_DENIED",
            RemoteErrorCode::TemporarilyRejected => "TEMPORARILY_REJECTED",
            RemoteErrorCode::Unsupported => "UNSUPPORTED",
            RemoteErrorCode::Failed => "FAILED",
            RemoteErrorCode::Cancelled => "CANCELLED",
            RemoteErrorCode::Timeout => "TIMEOUT",
            RemoteErrorCode::ConnectionError => "CONNECTION_ERROR",
            RemoteErrorCode::InvalidSequence => "INVALID_SEQUENCE",
            RemoteErrorCode::TooManyItems => "TOO_MANY_MISSION_ITEMS",
            RemoteErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            RemoteErrorCode::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}")]
pub struct RemoteError {
    pub code: RemoteErrorCode,
}

impl RemoteError {
    pub fn new(code: RemoteErrorCode) -> Self {
        Self { code }
    }
}

impl From<RemoteErrorCode> for RemoteError {
    fn from(code: RemoteErrorCode) -> Self {
        Self { code }
    }
}

/// Request/response surface of the vehicle endpoint. Every request resolves
/// to exactly one `Ok(())` or `Err(RemoteError)`.
#[async_trait]
pub trait RemoteSystem: Send + Sync {
    async fn arm(&self) -> Result<(), RemoteError>;
    async fn takeoff(&self, alt_m: f32) -> Result<(), RemoteError>;
    async fn kill(&self) -> Result<(), RemoteError>;
    async fn land(&self) -> Result<(), RemoteError>;
    async fn return_to_launch(&self) -> Result<(), RemoteError>;

    async fn upload_mission(&self, items: Vec<MissionItem>) -> Result<(), RemoteError>;
    async fn start_mission(&self) -> Result<(), RemoteError>;
    async fn pause_mission(&self) -> Result<(), RemoteError>;
    async fn clear_mission(&self) -> Result<(), RemoteError>;

    async fn take_photo(&self) -> Result<(), RemoteError>;

    /// Replace the fence with one inclusion polygon.
    async fn upload_geofence(&self, polygon: Vec<GeoPoint>) -> Result<(), RemoteError>;

    /// Endpoints without a native clear overwrite the fence with a
    /// two-vertex polygon.
    async fn clear_geofence(&self) -> Result<(), RemoteError> {
        self.upload_geofence(tether_mission::clear_polygon()).await
    }

    /// Raw telemetry feed. Every call is a separate subscription.
    fn subscribe(&self, feed: Feed) -> broadcast::Receiver<TelemetryValue>;

    /// Release the connection. Pending requests fail with `ConnectionError`.
    async fn close(&self);
}

/// Builds a vehicle endpoint against the bridge's local address (`tcp://:<port>`).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn RemoteSystem>, RemoteError>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FcConfig {
    /// MAVLink ids we use (console side). 245/190 is the usual GCS identity.
    pub sys_id: Option<u8>,
    pub comp_id: Option<u8>,

    /// target system/component (FC side). 1/1 is common for PX4 and ArduPilot.
    /// The system id is replaced by the one seen in the vehicle's heartbeat.
    pub target_sys: Option<u8>,
    pub target_comp: Option<u8>,

    /// Component that receives camera commands (MAV_COMP_ID_CAMERA).
    pub camera_comp: Option<u8>,

    /// GCS heartbeat send rate. Default 1 Hz.
    pub send_heartbeat_hz: Option<f32>,

    /// Vehicle heartbeat silence after which the link counts as lost.
    pub heartbeat_timeout_ms: Option<u64>,

    /// Per-attempt wait for COMMAND_ACK / mission protocol replies.
    pub ack_timeout_ms: Option<u64>,
    pub retries: Option<u32>,
}

/// `FcConfig` with defaults applied.
#[derive(Debug, Clone, Copy)]
pub struct FcSettings {
    pub sys_id: u8,
    pub comp_id: u8,
    pub target_sys: u8,
    pub target_comp: u8,
    pub camera_comp: u8,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub ack_timeout: Duration,
    pub retries: u32,
}

impl FcConfig {
    pub fn settings(&self) -> FcSettings {
        let hz = self.send_heartbeat_hz.unwrap_or(1.0).max(0.2);
        FcSettings {
            sys_id: self.sys_id.unwrap_or(245),
            comp_id: self.comp_id.unwrap_or(190),
            target_sys: self.target_sys.unwrap_or(1),
            target_comp: self.target_comp.unwrap_or(1),
            camera_comp: self.camera_comp.unwrap_or(100),
            heartbeat_interval: Duration::from_secs_f32(1.0 / hz),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms.unwrap_or(3000)),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms.unwrap_or(1000)),
            retries: self.retries.unwrap_or(3).max(1),
        }
    }
}

impl Default for FcSettings {
    fn default() -> Self {
        FcConfig::default().settings()
    }
}
