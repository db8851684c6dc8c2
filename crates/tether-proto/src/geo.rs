use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Scale between degrees and the fixed-point integers carried in mission items.
pub const DEG_E7: f64 = 1e7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn lat_e7(&self) -> i32 {
        encode_deg(self.lat)
    }

    pub fn lon_e7(&self) -> i32 {
        encode_deg(self.lon)
    }
}

/// Degrees -> fixed-point 1e-7 degrees, rounded to the nearest unit.
pub fn encode_deg(deg: f64) -> i32 {
    (deg * DEG_E7).round() as i32
}

pub fn decode_deg(e7: i32) -> f64 {
    e7 as f64 / DEG_E7
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.7},{:.7}", self.lat, self.lon)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("expected `lat,lon`, got `{0}`")]
pub struct ParsePointError(String);

impl FromStr for GeoPoint {
    type Err = ParsePointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lat, lon) = s.split_once(',').ok_or_else(|| ParsePointError(s.into()))?;
        let lat: f64 = lat.trim().parse().map_err(|_| ParsePointError(s.into()))?;
        let lon: f64 = lon.trim().parse().map_err(|_| ParsePointError(s.into()))?;
        if !lat.is_finite() || !lon.is_finite() {
            return Err(ParsePointError(s.into()));
        }
        Ok(Self { lat, lon })
    }
}
