pub mod gateway;
pub mod session;
pub mod telemetry;

pub use gateway::{Action, CommandGateway, GatewayError, Outcome, OutcomeMailbox};
pub use session::{
    spawn, BridgeConfig, LiveLink, SessionConfig, SessionHandle, SessionState, SessionStatus,
};
pub use telemetry::{Shaping, TelemetryCache, TelemetryConfig, TelemetryStream};
