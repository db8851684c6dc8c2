pub mod geo;
pub mod mission;
pub mod telemetry;

pub use geo::GeoPoint;
pub use mission::{Command, Frame, MissionItem, MissionType};
pub use telemetry::{Feed, TelemetryChannel, TelemetryValue};
