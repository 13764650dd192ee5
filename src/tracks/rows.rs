//! Session file row codec.
//!
//! Every row has the header's 17 columns. The `sensor` column says which
//! group of columns is populated; unknown values are empty.

use crate::types::{FusedAltitude, LocationFix, SensorKind, SensorSample};

pub const HEADER: &str =
    "millis,nano,sensor,pressure,lat,lon,hMSL,velN,velE,numSV,gX,gY,gZ,rotX,rotY,rotZ,acc";

pub const COLUMNS: usize = 17;

const ALT_TAG: &str = "alt";
const GPS_TAG: &str = "gps";

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrackRow {
    Altitude {
        millis: i64,
        nanos: i64,
        pressure_hpa: f64,
    },
    Location(LocationFix),
    Sensor(SensorSample),
}

impl TrackRow {
    pub fn millis(&self) -> i64 {
        match self {
            TrackRow::Altitude { millis, .. } => *millis,
            TrackRow::Location(fix) => fix.millis,
            TrackRow::Sensor(sample) => sample.millis,
        }
    }
}

fn num(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        String::new()
    }
}

pub fn altitude_row(alt: &FusedAltitude) -> String {
    format!(
        "{},{},{},{},,,,,,,,,,,,,",
        alt.millis,
        alt.nanos,
        ALT_TAG,
        num(alt.pressure_hpa)
    )
}

pub fn location_row(fix: &LocationFix) -> String {
    let sats = if fix.satellites_used >= 0 {
        fix.satellites_used.to_string()
    } else {
        String::new()
    };
    format!(
        "{},,{},,{},{},{},{},{},{},,,,,,,",
        fix.millis,
        GPS_TAG,
        num(fix.latitude),
        num(fix.longitude),
        num(fix.altitude_gps),
        num(fix.v_north),
        num(fix.v_east),
        sats
    )
}

pub fn sensor_row(sample: &SensorSample) -> String {
    let xyz = format!("{},{},{}", num(sample.x), num(sample.y), num(sample.z));
    let (linear, angular) = if sample.kind.is_angular() {
        (",,".to_string(), xyz)
    } else {
        (xyz, ",,".to_string())
    };
    format!(
        "{},{},{},,,,,,,,{},{},",
        sample.millis,
        sample.nanos,
        sample.kind.tag(),
        linear,
        angular
    )
}

fn field_f64(value: &str) -> Option<f64> {
    if value.is_empty() {
        Some(f64::NAN)
    } else {
        value.parse().ok()
    }
}

fn field_i64(value: &str) -> Option<i64> {
    if value.is_empty() {
        Some(0)
    } else {
        value.parse().ok()
    }
}

/// Decode one data row. `None` for the header, blank or malformed rows.
pub fn parse_row(line: &str) -> Option<TrackRow> {
    let cols: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(',').collect();
    if cols.len() != COLUMNS {
        return None;
    }
    let millis: i64 = cols[0].parse().ok()?;
    let nanos = field_i64(cols[1])?;

    match cols[2] {
        ALT_TAG => Some(TrackRow::Altitude {
            millis,
            nanos,
            pressure_hpa: field_f64(cols[3])?,
        }),
        GPS_TAG => {
            let mut fix = LocationFix::empty(millis);
            fix.latitude = field_f64(cols[4])?;
            fix.longitude = field_f64(cols[5])?;
            fix.altitude_gps = field_f64(cols[6])?;
            fix.v_north = field_f64(cols[7])?;
            fix.v_east = field_f64(cols[8])?;
            fix.satellites_used = if cols[9].is_empty() {
                -1
            } else {
                cols[9].parse().ok()?
            };
            Some(TrackRow::Location(fix))
        }
        tag => {
            let kind = SensorKind::from_tag(tag)?;
            let base = if kind.is_angular() { 13 } else { 10 };
            Some(TrackRow::Sensor(SensorSample::new(
                kind,
                millis,
                nanos,
                field_f64(cols[base])?,
                field_f64(cols[base + 1])?,
                field_f64(cols[base + 2])?,
            )))
        }
    }
}
