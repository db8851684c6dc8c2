use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub abs_alt_m: f32,
    pub rel_alt_m: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityNed {
    pub north_m_s: f32,
    pub east_m_s: f32,
    pub down_m_s: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Speed {
    pub horizontal_m_s: f32,
    pub vertical_m_s: f32,
}

impl From<VelocityNed> for Speed {
    fn from(v: VelocityNed) -> Self {
        Self {
            horizontal_m_s: v.north_m_s.hypot(v.east_m_s),
            vertical_m_s: v.down_m_s.abs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Battery {
    pub voltage_v: Option<f32>,   // Volts
    pub current_a: Option<f32>,   // Amps
    pub remaining_pct: Option<u8>, // Percent 0-100
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EulerAngle {
    pub roll_deg: f32,
    pub pitch_deg: f32,
    pub yaw_deg: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RcStatus {
    pub was_available_once: bool,
    pub is_available: bool,
    /// 0-100, `None` when the receiver does not report RSSI.
    pub signal_strength_pct: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlightMode {
    Unknown,
    Ready,
    Takeoff,
    Hold,
    Mission,
    ReturnToLaunch,
    Land,
    Offboard,
    FollowMe,
    Manual,
    Altctl,
    Posctl,
    Acro,
    Stabilized,
    Rattitude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpsFix {
    NoGps,
    NoFix,
    Fix2d,
    Fix3d,
    FixDgps,
    RtkFloat,
    RtkFixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpsInfo {
    pub num_satellites: u8,
    pub fix: GpsFix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionProgress {
    pub current: i32,
    pub total: i32,
}

/// A single sample delivered by the vehicle endpoint or a telemetry pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TelemetryValue {
    Position(Position),
    VelocityNed(VelocityNed),
    Speed(Speed),
    Battery(Battery),
    Attitude(EulerAngle),
    RcStatus(RcStatus),
    FlightMode(FlightMode),
    ConnectionState(bool),
    GpsInfo(GpsInfo),
    MissionProgress(MissionProgress),
}

impl TelemetryValue {
    pub fn feed(&self) -> Option<Feed> {
        Some(match self {
            TelemetryValue::Position(_) => Feed::Position,
            TelemetryValue::VelocityNed(_) => Feed::VelocityNed,
            TelemetryValue::Battery(_) => Feed::Battery,
            TelemetryValue::Attitude(_) => Feed::Attitude,
            TelemetryValue::RcStatus(_) => Feed::RcStatus,
            TelemetryValue::FlightMode(_) => Feed::FlightMode,
            TelemetryValue::ConnectionState(_) => Feed::ConnectionState,
            TelemetryValue::GpsInfo(_) => Feed::GpsInfo,
            TelemetryValue::MissionProgress(_) => Feed::MissionProgress,
            TelemetryValue::Speed(_) => return None,
        })
    }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryValue::Position(p) => write!(
                f,
                "lat={:.7} lon={:.7} alt={:.1}m rel={:.1}m",
                p.lat_deg, p.lon_deg, p.abs_alt_m, p.rel_alt_m
            ),
            TelemetryValue::VelocityNed(v) => write!(
                f,
                "n={:.2} e={:.2} d={:.2} m/s",
                v.north_m_s, v.east_m_s, v.down_m_s
            ),
            TelemetryValue::Speed(s) => write!(
                f,
                "h={:.2} m/s v={:.2} m/s",
                s.horizontal_m_s, s.vertical_m_s
            ),
            TelemetryValue::Battery(b) => write!(
                f,
                "{:?}% :: {:?}V :: {:?}A",
                b.remaining_pct, b.voltage_v, b.current_a
            ),
            TelemetryValue::Attitude(a) => write!(
                f,
                "roll={:.1} pitch={:.1} yaw={:.1}",
                a.roll_deg, a.pitch_deg, a.yaw_deg
            ),
            TelemetryValue::RcStatus(r) => write!(
                f,
                "available={} once={} signal={:?}",
                r.is_available, r.was_available_once, r.signal_strength_pct
            ),
            TelemetryValue::FlightMode(m) => write!(f, "{:?}", m),
            TelemetryValue::ConnectionState(c) => write!(f, "connected={}", c),
            TelemetryValue::GpsInfo(g) => write!(f, "sats={} fix={:?}", g.num_satellites, g.fix),
            TelemetryValue::MissionProgress(m) => write!(f, "{}/{}", m.current, m.total),
        }
    }
}

/// Raw telemetry feeds published by the vehicle endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feed {
    Position,
    VelocityNed,
    Battery,
    Attitude,
    RcStatus,
    FlightMode,
    ConnectionState,
    GpsInfo,
    MissionProgress,
}

impl Feed {
    pub const ALL: [Feed; 9] = [
        Feed::Position,
        Feed::VelocityNed,
        Feed::Battery,
        Feed::Attitude,
        Feed::RcStatus,
        Feed::FlightMode,
        Feed::ConnectionState,
        Feed::GpsInfo,
        Feed::MissionProgress,
    ];
}

/// Channels consumers ask for. Each is backed by exactly one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TelemetryChannel {
    Position,
    Battery,
    Attitude,
    RcStatus,
    FlightMode,
    ConnectionState,
    Speed,
    GpsInfo,
    MissionProgress,
}

impl TelemetryChannel {
    pub const ALL: [TelemetryChannel; 9] = [
        TelemetryChannel::Position,
        TelemetryChannel::Battery,
        TelemetryChannel::Attitude,
        TelemetryChannel::RcStatus,
        TelemetryChannel::FlightMode,
        TelemetryChannel::ConnectionState,
        TelemetryChannel::Speed,
        TelemetryChannel::GpsInfo,
        TelemetryChannel::MissionProgress,
    ];

    pub fn feed(self) -> Feed {
        match self {
            TelemetryChannel::Position => Feed::Position,
            TelemetryChannel::Battery => Feed::Battery,
            TelemetryChannel::Attitude => Feed::Attitude,
            TelemetryChannel::RcStatus => Feed::RcStatus,
            TelemetryChannel::FlightMode => Feed::FlightMode,
            TelemetryChannel::ConnectionState => Feed::ConnectionState,
            TelemetryChannel::Speed => Feed::VelocityNed,
            TelemetryChannel::GpsInfo => Feed::GpsInfo,
            TelemetryChannel::MissionProgress => Feed::MissionProgress,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TelemetryChannel::Position => "position",
            TelemetryChannel::Battery => "battery",
            TelemetryChannel::Attitude => "attitude",
            TelemetryChannel::RcStatus => "rc",
            TelemetryChannel::FlightMode => "mode",
            TelemetryChannel::ConnectionState => "connection",
            TelemetryChannel::Speed => "speed",
            TelemetryChannel::GpsInfo => "gps",
            TelemetryChannel::MissionProgress => "progress",
        }
    }
}

impl fmt::Display for TelemetryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown telemetry channel `{0}`")]
pub struct UnknownChannel(String);

impl FromStr for TelemetryChannel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TelemetryChannel::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownChannel(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_from_velocity_uses_norm_and_abs() {
        let s = Speed::from(VelocityNed { north_m_s: 3.0, east_m_s: -4.0, down_m_s: -1.5 });
        assert_eq!(s.horizontal_m_s, 5.0);
        assert_eq!(s.vertical_m_s, 1.5);
    }

    #[test]
    fn channel_names_parse_back() {
        for c in TelemetryChannel::ALL {
            assert_eq!(c.name().parse::<TelemetryChannel>().unwrap(), c);
        }
        assert!("altitude".parse::<TelemetryChannel>().is_err());
    }

    #[test]
    fn speed_channel_is_backed_by_velocity_feed() {
        assert_eq!(TelemetryChannel::Speed.feed(), Feed::VelocityNed);
        assert_eq!(TelemetryValue::ConnectionState(true).feed(), Some(Feed::ConnectionState));
    }
}
