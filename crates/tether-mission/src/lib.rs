pub mod fence;
pub mod plan;

use serde::Deserialize;

pub use fence::{clear_polygon, fence_items};
pub use plan::{encode_plan, PlanError};

pub const DEFAULT_HEIGHT_M: f32 = 5.0;
pub const DEFAULT_SPEED_M_S: f32 = 1.0;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MissionConfig {
    /// Relative altitude for take-off and every waypoint.
    pub height_m: Option<f32>,

    /// Cruise ground speed written into the leading speed-change item.
    pub speed_m_s: Option<f32>,

    /// Default take-off altitude for the `takeoff` action when none is given.
    pub takeoff_alt_m: Option<f32>,
}

impl MissionConfig {
    pub fn plan(&self) -> PlanConfig {
        PlanConfig {
            height_m: self.height_m.unwrap_or(DEFAULT_HEIGHT_M),
            speed_m_s: self.speed_m_s.unwrap_or(DEFAULT_SPEED_M_S),
        }
    }

    pub fn takeoff_alt_m(&self) -> f32 {
        self.takeoff_alt_m.unwrap_or(3.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanConfig {
    pub height_m: f32,
    pub speed_m_s: f32,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self { height_m: DEFAULT_HEIGHT_M, speed_m_s: DEFAULT_SPEED_M_S }
    }
}
