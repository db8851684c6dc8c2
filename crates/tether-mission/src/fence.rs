use tether_proto::{Command, Frame, GeoPoint, MissionItem, MissionType};

use crate::PlanError;

/// Polygon uploaded in place of a native "clear fence" primitive. Two vertices
/// is not a valid inclusion area, so the vehicle ends up with no usable fence.
pub fn clear_polygon() -> Vec<GeoPoint> {
    vec![GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 1.0)]
}

/// One inclusion polygon as fence-type mission items, vertex order preserved.
pub fn fence_items(polygon: &[GeoPoint]) -> Result<Vec<MissionItem>, PlanError> {
    if polygon.is_empty() {
        return Err(PlanError::Empty);
    }
    if polygon.len() > u16::MAX as usize {
        return Err(PlanError::TooLong(polygon.len()));
    }
    let vertices = polygon.len() as f32;

    Ok(polygon
        .iter()
        .enumerate()
        .map(|(i, p)| MissionItem {
            seq: i as u16,
            frame: Frame::Global,
            command: Command::NavFencePolygonVertexInclusion,
            current: false,
            autocontinue: false,
            param1: vertices,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            x: p.lat_e7(),
            y: p.lon_e7(),
            z: 0.0,
            mission_type: MissionType::Fence,
        })
        .collect())
}
