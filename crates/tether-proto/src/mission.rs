use serde::{Deserialize, Serialize};

/// Coordinate frame of a mission item (MAV_FRAME numeric codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Frame {
    Global = 0,
    Mission = 2,
    GlobalRelativeAlt = 3,
}

impl Frame {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Positional frames carry lat/lon as 1e7 fixed-point in x/y.
    pub fn is_positional(self) -> bool {
        !matches!(self, Frame::Mission)
    }
}

/// Mission command (MAV_CMD numeric codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Command {
    NavWaypoint = 16,
    NavReturnToLaunch = 20,
    NavTakeoff = 22,
    DoChangeSpeed = 178,
    NavFencePolygonVertexInclusion = 5001,
}

impl Command {
    pub fn code(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MissionType {
    Mission = 0,
    Fence = 1,
}

impl MissionType {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One wire-protocol mission instruction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MissionItem {
    pub seq: u16,
    pub frame: Frame,
    pub command: Command,
    pub current: bool,
    pub autocontinue: bool,
    pub param1: f32,
    pub param2: f32,
    pub param3: f32,
    pub param4: f32,
    pub x: i32,
    pub y: i32,
    pub z: f32,
    pub mission_type: MissionType,
}

impl MissionItem {
    /// Field-wise equality that treats NaN parameters as equal.
    pub fn same_as(&self, other: &MissionItem) -> bool {
        fn eq(a: f32, b: f32) -> bool {
            (a.is_nan() && b.is_nan()) || a == b
        }
        self.seq == other.seq
            && self.frame == other.frame
            && self.command == other.command
            && self.current == other.current
            && self.autocontinue == other.autocontinue
            && eq(self.param1, other.param1)
            && eq(self.param2, other.param2)
            && eq(self.param3, other.param3)
            && eq(self.param4, other.param4)
            && self.x == other.x
            && self.y == other.y
            && eq(self.z, other.z)
            && self.mission_type == other.mission_type
    }
}
