//! MAVLink -> telemetry values.

use mavlink::common::{
    GpsFixType, MavAutopilot, MavMessage, MavType, GLOBAL_POSITION_INT_DATA, GPS_RAW_INT_DATA,
    HEARTBEAT_DATA, RC_CHANNELS_DATA, SYS_STATUS_DATA,
};
use mavlink::MavHeader;
use std::time::{Duration, Instant};

use tether_proto::telemetry::{
    Battery, EulerAngle, FlightMode, GpsFix, GpsInfo, MissionProgress, Position, RcStatus,
    VelocityNed,
};
use tether_proto::TelemetryValue;

/// What the endpoint has learned about the vehicle so far.
#[derive(Debug, Clone, Default)]
pub struct VehicleState {
    pub connected: bool,
    pub last_heartbeat: Option<Instant>,
    pub system_id: Option<u8>,
    pub rc_seen: bool,
    pub mission_total: i32,
    pub battery: Battery,
    pub position: Option<Position>,
}

impl VehicleState {
    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    /// Fold one message into the state and return the samples it produced.
    pub fn update(&mut self, hdr: &MavHeader, msg: &MavMessage) -> Vec<TelemetryValue> {
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                if !is_vehicle(hb) {
                    return Vec::new();
                }
                self.connected = true;
                self.last_heartbeat = Some(Instant::now());
                self.system_id = Some(hdr.system_id);
                vec![
                    TelemetryValue::ConnectionState(true),
                    TelemetryValue::FlightMode(px4_flight_mode(hb.custom_mode)),
                ]
            }
            MavMessage::GLOBAL_POSITION_INT(p) => {
                let (pos, vel) = position(p);
                self.position = Some(pos);
                vec![TelemetryValue::Position(pos), TelemetryValue::VelocityNed(vel)]
            }
            MavMessage::SYS_STATUS(s) => {
                self.update_battery(s);
                vec![TelemetryValue::Battery(self.battery)]
            }
            MavMessage::ATTITUDE(a) => vec![TelemetryValue::Attitude(EulerAngle {
                roll_deg: a.roll.to_degrees(),
                pitch_deg: a.pitch.to_degrees(),
                yaw_deg: a.yaw.to_degrees(),
            })],
            MavMessage::RC_CHANNELS(rc) => vec![TelemetryValue::RcStatus(self.rc_status(rc))],
            MavMessage::GPS_RAW_INT(g) => vec![TelemetryValue::GpsInfo(gps_info(g))],
            MavMessage::MISSION_CURRENT(m) => vec![TelemetryValue::MissionProgress(MissionProgress {
                current: m.seq as i32,
                total: self.mission_total,
            })],
            _ => Vec::new(),
        }
    }

    /// Report the link lost once the vehicle heartbeat has been silent too long.
    pub fn check_timeout(&mut self, timeout: Duration) -> Option<TelemetryValue> {
        let stale = self.hb_age().map_or(false, |age| age > timeout);
        if self.connected && stale {
            self.connected = false;
            return Some(TelemetryValue::ConnectionState(false));
        }
        None
    }

    fn update_battery(&mut self, status: &SYS_STATUS_DATA) {
        // voltage_battery is in millivolts, convert to volts
        if status.voltage_battery != u16::MAX {
            self.battery.voltage_v = Some(status.voltage_battery as f32 / 1000.0);
        }
        // current_battery is in centiamps (0.01A), -1 means invalid
        if status.current_battery != -1 {
            self.battery.current_a = Some(status.current_battery as f32 / 100.0);
        }
        // battery_remaining is percentage 0-100, -1 means invalid
        if (0..=100).contains(&status.battery_remaining) {
            self.battery.remaining_pct = Some(status.battery_remaining as u8);
        }
    }

    fn rc_status(&mut self, rc: &RC_CHANNELS_DATA) -> RcStatus {
        let is_available = rc.chancount > 0;
        self.rc_seen |= is_available;
        RcStatus {
            was_available_once: self.rc_seen,
            is_available,
            // 255 = unknown
            signal_strength_pct: (rc.rssi != u8::MAX).then(|| rc.rssi as f32 * 100.0 / 254.0),
        }
    }
}

/// Heartbeats from GCSs and peripherals carry no vehicle state.
fn is_vehicle(hb: &HEARTBEAT_DATA) -> bool {
    hb.mavtype != MavType::MAV_TYPE_GCS && hb.autopilot != MavAutopilot::MAV_AUTOPILOT_INVALID
}

fn position(p: &GLOBAL_POSITION_INT_DATA) -> (Position, VelocityNed) {
    (
        Position {
            lat_deg: tether_proto::geo::decode_deg(p.lat),
            lon_deg: tether_proto::geo::decode_deg(p.lon),
            abs_alt_m: p.alt as f32 / 1000.0,
            rel_alt_m: p.relative_alt as f32 / 1000.0,
        },
        VelocityNed {
            north_m_s: p.vx as f32 / 100.0,
            east_m_s: p.vy as f32 / 100.0,
            down_m_s: p.vz as f32 / 100.0,
        },
    )
}

fn gps_info(g: &GPS_RAW_INT_DATA) -> GpsInfo {
    let fix = match g.fix_type {
        GpsFixType::GPS_FIX_TYPE_NO_GPS => GpsFix::NoGps,
        GpsFixType::GPS_FIX_TYPE_2D_FIX => GpsFix::Fix2d,
        GpsFixType::GPS_FIX_TYPE_3D_FIX => GpsFix::Fix3d,
        GpsFixType::GPS_FIX_TYPE_DGPS => GpsFix::FixDgps,
        GpsFixType::GPS_FIX_TYPE_RTK_FLOAT => GpsFix::RtkFloat,
        GpsFixType::GPS_FIX_TYPE_RTK_FIXED => GpsFix::RtkFixed,
        _ => GpsFix::NoFix,
    };
    GpsInfo { num_satellites: g.satellites_visible, fix }
}

/// PX4 packs main mode in bits 16..24 and sub mode in bits 24..32 of custom_mode.
pub fn px4_flight_mode(custom_mode: u32) -> FlightMode {
    let main = (custom_mode >> 16) & 0xff;
    let sub = (custom_mode >> 24) & 0xff;
    match main {
        1 => FlightMode::Manual,
        2 => FlightMode::Altctl,
        3 => FlightMode::Posctl,
        4 => match sub {
            1 => FlightMode::Ready,
            2 => FlightMode::Takeoff,
            3 => FlightMode::Hold,
            4 => FlightMode::Mission,
            5 => FlightMode::ReturnToLaunch,
            6 | 9 => FlightMode::Land,
            8 => FlightMode::FollowMe,
            _ => FlightMode::Unknown,
        },
        5 => FlightMode::Acro,
        6 => FlightMode::Offboard,
        7 => FlightMode::Stabilized,
        8 => FlightMode::Rattitude,
        _ => FlightMode::Unknown,
    }
}
