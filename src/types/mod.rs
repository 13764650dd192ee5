//! Measurement records shared by the fusion, arbitration and recording layers.

pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// Raw barometer reading.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PressureSample {
    /// Monotonic sensor clock, nanoseconds
    pub nanos: i64,
    /// Wall clock, milliseconds since epoch
    pub millis: i64,
    /// Pressure in hPa (millibars)
    pub pressure_hpa: f64,
}

impl PressureSample {
    pub fn new(nanos: i64, millis: i64, pressure_hpa: f64) -> Self {
        Self {
            nanos,
            millis,
            pressure_hpa,
        }
    }
}

/// A single resolved position/velocity measurement from a location source.
///
/// Unknown values are `NaN` (floats) or `-1` (satellite count).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub millis: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// GPS altitude, meters MSL
    pub altitude_gps: f64,
    /// North velocity, m/s
    pub v_north: f64,
    /// East velocity, m/s
    pub v_east: f64,
    pub pdop: f64,
    pub hdop: f64,
    pub vdop: f64,
    pub satellites_used: i32,
}

impl LocationFix {
    /// Fix with every optional field unset.
    pub fn empty(millis: i64) -> Self {
        Self {
            millis,
            latitude: f64::NAN,
            longitude: f64::NAN,
            altitude_gps: f64::NAN,
            v_north: f64::NAN,
            v_east: f64::NAN,
            pdop: f64::NAN,
            hdop: f64::NAN,
            vdop: f64::NAN,
            satellites_used: -1,
        }
    }

    pub fn ground_speed(&self) -> f64 {
        self.v_north.hypot(self.v_east)
    }

    /// Bearing in degrees clockwise from true north, 0..360
    pub fn bearing(&self) -> f64 {
        self.v_east.atan2(self.v_north).to_degrees().rem_euclid(360.0)
    }

    pub fn has_position(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

/// Authoritative altitude published by the fusion engine.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusedAltitude {
    pub millis: i64,
    pub nanos: i64,
    /// Meters AMSL
    pub altitude: f64,
    /// Rate of climb, m/s
    pub climb: f64,
    /// Raw pressure behind this estimate, hPa (NaN in GPS-only mode)
    pub pressure_hpa: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Accelerometer,
    Gyroscope,
    Magnetometer,
    Gravity,
    Rotation,
}

impl SensorKind {
    /// Short tag written to the `sensor` column of a session file
    pub fn tag(&self) -> &'static str {
        match self {
            SensorKind::Accelerometer => "acc",
            SensorKind::Gyroscope => "gyr",
            SensorKind::Magnetometer => "mag",
            SensorKind::Gravity => "grv",
            SensorKind::Rotation => "rot",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "acc" => Some(SensorKind::Accelerometer),
            "gyr" => Some(SensorKind::Gyroscope),
            "mag" => Some(SensorKind::Magnetometer),
            "grv" => Some(SensorKind::Gravity),
            "rot" => Some(SensorKind::Rotation),
            _ => None,
        }
    }

    /// Angular sensors land in the rot* columns, the rest in g*
    pub fn is_angular(&self) -> bool {
        matches!(self, SensorKind::Gyroscope | SensorKind::Rotation)
    }
}

/// Generic 3-axis sensor event (accelerometer, gyroscope, ...).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub kind: SensorKind,
    pub millis: i64,
    pub nanos: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl SensorSample {
    pub fn new(kind: SensorKind, millis: i64, nanos: i64, x: f64, y: f64, z: f64) -> Self {
        Self {
            kind,
            millis,
            nanos,
            x,
            y,
            z,
        }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearing_from_velocity() {
        let mut fix = LocationFix::empty(0);
        fix.v_north = 0.0;
        fix.v_east = -3.0;
        assert!((fix.bearing() - 270.0).abs() < 1e-9);
        assert!((fix.ground_speed() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_sensor_tags_round_trip() {
        for kind in [
            SensorKind::Accelerometer,
            SensorKind::Gyroscope,
            SensorKind::Magnetometer,
            SensorKind::Gravity,
            SensorKind::Rotation,
        ] {
            assert_eq!(SensorKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(SensorKind::from_tag("xyz"), None);
    }
}
