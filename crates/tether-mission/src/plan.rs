use tether_proto::{Command, Frame, GeoPoint, MissionItem, MissionType};
use tracing::debug;

use crate::PlanConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("mission plan needs at least one waypoint")]
    Empty,
    #[error("mission plan too long: {0} items")]
    TooLong(usize),
}

/// Speed type for MAV_CMD_DO_CHANGE_SPEED param1: ground speed.
const SPEED_TYPE_GROUND: f32 = 1.0;
/// "No change" marker for the throttle parameter.
const THROTTLE_UNCHANGED: f32 = -1.0;

/// Encode the operator's points into a raw mission.
///
/// Layout: speed change, take-off at `points[0]`, one waypoint per remaining
/// point, return-to-launch. Sequence numbers run 0..N-1 in that order.
/// Points are not validated; the first point is usually the vehicle's current
/// position, prepended by the caller.
pub fn encode_plan(points: &[GeoPoint], cfg: &PlanConfig) -> Result<Vec<MissionItem>, PlanError> {
    let (origin, rest) = points.split_first().ok_or(PlanError::Empty)?;

    // speed + takeoff + waypoints + rtl
    let total = rest.len() + 3;
    if total > u16::MAX as usize {
        return Err(PlanError::TooLong(total));
    }

    let mut items = Vec::with_capacity(total);
    let mut seq: u16 = 0;
    let mut push = |item: MissionItem| {
        items.push(MissionItem { seq, ..item });
        seq += 1;
    };

    push(MissionItem {
        seq: 0,
        frame: Frame::Mission,
        command: Command::DoChangeSpeed,
        current: false,
        autocontinue: true,
        param1: SPEED_TYPE_GROUND,
        param2: cfg.speed_m_s,
        param3: THROTTLE_UNCHANGED,
        param4: 0.0,
        x: 0,
        y: 0,
        z: f32::NAN,
        mission_type: MissionType::Mission,
    });

    push(positional(Command::NavTakeoff, origin, cfg.height_m, true));

    for p in rest {
        push(positional(Command::NavWaypoint, p, cfg.height_m, false));
    }

    push(MissionItem {
        seq: 0,
        frame: Frame::Mission,
        command: Command::NavReturnToLaunch,
        current: false,
        autocontinue: true,
        param1: f32::NAN,
        param2: f32::NAN,
        param3: f32::NAN,
        param4: f32::NAN,
        x: 0,
        y: 0,
        z: 0.0,
        mission_type: MissionType::Mission,
    });

    debug!("mission: encoded {} points into {} items", points.len(), items.len());
    Ok(items)
}

// NaN params = "no preference" (hold time, acceptance radius, pass radius, yaw).
fn positional(command: Command, p: &GeoPoint, height_m: f32, current: bool) -> MissionItem {
    MissionItem {
        seq: 0,
        frame: Frame::GlobalRelativeAlt,
        command,
        current,
        autocontinue: true,
        param1: f32::NAN,
        param2: f32::NAN,
        param3: f32::NAN,
        param4: f32::NAN,
        x: p.lat_e7(),
        y: p.lon_e7(),
        z: height_m,
        mission_type: MissionType::Mission,
    }
}
