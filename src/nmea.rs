//! NMEA-0183 decoding.
//!
//! `validate` checks framing and checksum of a single line without touching any
//! state. `NmeaParser` accumulates fragments from GSA/GSV/GGA/VTG into an
//! in-progress fix and commits it on RMC or GNS.
//!
//! ```
//! use flight_tracker_rs::nmea::NmeaParser;
//!
//! let mut parser = NmeaParser::new();
//! let line = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
//! let fix = parser.parse_line(line, 764_426_119_000).unwrap().unwrap();
//! assert!((fix.latitude - 48.1173).abs() < 1e-4);
//! ```

use chrono::NaiveDate;
use thiserror::Error;

use crate::types::LocationFix;

/// Knots to meters per second
pub const KNOTS_TO_MPS: f64 = 1852.0 / 3600.0;

/// Divergence between GPS time and the local clock worth reporting
pub const CLOCK_SKEW_LIMIT_MS: i64 = 60_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NmeaError {
    #[error("empty sentence")]
    Empty,

    #[error("sentence does not start with '$'")]
    MissingStart,

    #[error("sentence contains non-ASCII bytes")]
    NonAscii,

    #[error("invalid sentence header {0:?}")]
    BadHeader(String),

    #[error("missing or malformed checksum")]
    MissingChecksum,

    #[error("checksum mismatch: sentence says {expected:02X}, computed {actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("{id} sentence too short ({count} fields)")]
    TooShort { id: String, count: usize },
}

/// A framed, checksum-verified sentence split into fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence<'a> {
    /// Talker ID, e.g. "GP", "GN"
    pub talker: &'a str,
    /// Sentence ID, e.g. "RMC"
    pub id: &'a str,
    /// Fields after the header, checksum excluded
    pub fields: Vec<&'a str>,
}

/// XOR of every byte between `$` and `*`
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Frame a sentence body (without `$`) with its checksum
pub fn with_checksum(body: &str) -> String {
    format!("${}*{:02X}", body, checksum(body))
}

/// Validate framing and checksum of one raw line.
pub fn validate(line: &str) -> Result<Sentence<'_>, NmeaError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(NmeaError::Empty);
    }
    if !line.is_ascii() {
        return Err(NmeaError::NonAscii);
    }
    let rest = line.strip_prefix('$').ok_or(NmeaError::MissingStart)?;
    let (body, sum) = rest.split_once('*').ok_or(NmeaError::MissingChecksum)?;

    let sum = sum.trim();
    if sum.len() != 2 {
        return Err(NmeaError::MissingChecksum);
    }
    let expected = u8::from_str_radix(sum, 16).map_err(|_| NmeaError::MissingChecksum)?;
    let actual = checksum(body);
    if expected != actual {
        return Err(NmeaError::ChecksumMismatch { expected, actual });
    }

    let mut parts = body.split(',');
    let header = parts.next().unwrap_or_default();
    if header.len() != 5 || !header.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(NmeaError::BadHeader(header.to_string()));
    }

    Ok(Sentence {
        talker: &header[..2],
        id: &header[2..],
        fields: parts.collect(),
    })
}

/// Decode `DDMM.MMMM` / `DDDMM.MMMM` plus hemisphere into signed degrees.
///
/// The degree width is implied by the position of the decimal point, so the
/// same routine handles latitude and longitude. Returns NaN when unset.
pub fn parse_degrees_minutes(value: &str, hemisphere: &str) -> f64 {
    if value.is_empty() || !value.is_ascii() {
        return f64::NAN;
    }
    let sign = match hemisphere {
        "N" | "E" => 1.0,
        "S" | "W" => -1.0,
        _ => return f64::NAN,
    };
    let dot = value.find('.').unwrap_or(value.len());
    if dot < 2 {
        return f64::NAN;
    }
    let (deg_str, min_str) = value.split_at(dot - 2);
    let degrees = if deg_str.is_empty() {
        0.0
    } else {
        match deg_str.parse::<u32>() {
            Ok(d) => d as f64,
            Err(_) => return f64::NAN,
        }
    };
    let minutes = match min_str.parse::<f64>() {
        Ok(m) if (0.0..60.0).contains(&m) => m,
        _ => return f64::NAN,
    };
    sign * (degrees + minutes / 60.0)
}

/// Parse `hhmmss[.sss]` into milliseconds since midnight UTC
pub fn parse_time(value: &str) -> Option<i64> {
    if value.len() < 6 || !value.is_ascii() {
        return None;
    }
    let hh: i64 = value[0..2].parse().ok()?;
    let mm: i64 = value[2..4].parse().ok()?;
    let ss: f64 = value[4..].parse().ok()?;
    if hh > 23 || mm > 59 || !(0.0..61.0).contains(&ss) {
        return None;
    }
    Some(hh * 3_600_000 + mm * 60_000 + (ss * 1000.0).round() as i64)
}

/// Parse `ddmmyy` into epoch milliseconds at UTC midnight
pub fn parse_date(value: &str) -> Option<i64> {
    if value.len() != 6 || !value.is_ascii() {
        return None;
    }
    let day: u32 = value[0..2].parse().ok()?;
    let month: u32 = value[2..4].parse().ok()?;
    let yy: i32 = value[4..6].parse().ok()?;
    let year = if yy < 80 { 2000 + yy } else { 1900 + yy };
    let midnight = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?;
    Some(midnight.and_utc().timestamp_millis())
}

/// Empty or unparsable → NaN
fn parse_f64(value: &str) -> f64 {
    if value.is_empty() {
        return f64::NAN;
    }
    value.trim().parse().unwrap_or_else(|_| {
        log::debug!("[nmea] unparsable number {:?}", value);
        f64::NAN
    })
}

/// Empty or unparsable → -1
fn parse_i32(value: &str) -> i32 {
    value.trim().parse().unwrap_or(-1)
}

fn require<'a>(sentence: &'a Sentence<'a>, count: usize) -> Result<&'a [&'a str], NmeaError> {
    if sentence.fields.len() < count {
        return Err(NmeaError::TooShort {
            id: sentence.id.to_string(),
            count: sentence.fields.len(),
        });
    }
    Ok(&sentence.fields)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NmeaStats {
    pub sentences: u64,
    pub rejected: u64,
    pub fixes: u64,
    pub unknown: u64,
}

/// Stateful accumulator turning a sentence stream into `LocationFix`es.
pub struct NmeaParser {
    fix: LocationFix,
    ground_speed: f64,
    bearing: f64,
    /// Epoch millis of the last RMC date, midnight UTC
    date_millis: Option<i64>,
    /// Epoch millis of the most recent decoded time-of-day
    gps_millis: Option<i64>,
    fix_quality: i32,
    satellites_in_view: i32,
    last_clock_skew: Option<i64>,
    stats: NmeaStats,
}

impl NmeaParser {
    pub fn new() -> Self {
        Self {
            fix: LocationFix::empty(0),
            ground_speed: f64::NAN,
            bearing: f64::NAN,
            date_millis: None,
            gps_millis: None,
            fix_quality: -1,
            satellites_in_view: -1,
            last_clock_skew: None,
            stats: NmeaStats::default(),
        }
    }

    pub fn stats(&self) -> NmeaStats {
        self.stats
    }

    pub fn satellites_in_view(&self) -> i32 {
        self.satellites_in_view
    }

    /// GGA fix quality: 0 invalid, 1 SPS, 2 DGPS, ... (-1 unknown)
    pub fn fix_quality(&self) -> i32 {
        self.fix_quality
    }

    /// Last reported divergence (local − GPS) beyond `CLOCK_SKEW_LIMIT_MS`
    pub fn clock_skew_millis(&self) -> Option<i64> {
        self.last_clock_skew
    }

    /// Feed one raw line.
    ///
    /// Returns `Ok(Some(fix))` when an RMC/GNS sentence commits a fix, `Ok(None)`
    /// for fragments, and `Err` for rejected lines. A rejected line leaves the
    /// accumulated state untouched.
    pub fn parse_line(
        &mut self,
        line: &str,
        local_millis: i64,
    ) -> Result<Option<LocationFix>, NmeaError> {
        self.stats.sentences += 1;
        let result = validate(line).and_then(|sentence| self.apply(&sentence, local_millis));
        match &result {
            Ok(Some(_)) => self.stats.fixes += 1,
            Ok(None) => {}
            Err(err) => {
                self.stats.rejected += 1;
                log::warn!("[nmea] rejected {:?}: {}", line.trim(), err);
            }
        }
        result
    }

    fn apply(
        &mut self,
        sentence: &Sentence<'_>,
        local_millis: i64,
    ) -> Result<Option<LocationFix>, NmeaError> {
        match sentence.id {
            "GSA" => {
                // DOPs are the last three fields (system ID may follow in 4.1)
                let f = require(sentence, 3)?;
                let n = if f.len() >= 18 { 17 } else { f.len() };
                self.fix.pdop = parse_f64(f[n - 3]);
                self.fix.hdop = parse_f64(f[n - 2]);
                self.fix.vdop = parse_f64(f[n - 1]);
                Ok(None)
            }
            "GSV" => {
                let f = require(sentence, 3)?;
                self.satellites_in_view = parse_i32(f[2]);
                Ok(None)
            }
            "GGA" => {
                let f = require(sentence, 10)?;
                self.update_time(f[0]);
                self.fix.latitude = parse_degrees_minutes(f[1], f[2]);
                self.fix.longitude = parse_degrees_minutes(f[3], f[4]);
                self.fix_quality = parse_i32(f[5]);
                self.fix.satellites_used = parse_i32(f[6]);
                self.fix.hdop = parse_f64(f[7]);
                if !f[8].is_empty() {
                    if f[9] == "M" {
                        self.fix.altitude_gps = parse_f64(f[8]);
                    } else {
                        log::error!(
                            "[nmea] expected altitude in meters, got unit {:?}; altitude unset",
                            f[9]
                        );
                    }
                }
                Ok(None)
            }
            "RMC" => {
                let f = require(sentence, 9)?;
                self.fix.latitude = parse_degrees_minutes(f[2], f[3]);
                self.fix.longitude = parse_degrees_minutes(f[4], f[5]);
                self.ground_speed = parse_f64(f[6]) * KNOTS_TO_MPS;
                self.bearing = parse_f64(f[7]);
                if let Some(date) = parse_date(f[8]) {
                    self.date_millis = Some(date);
                }
                self.update_time(f[0]);
                if f[1] != "A" {
                    log::trace!("[nmea] RMC status {:?}", f[1]);
                }
                self.update_velocity();
                Ok(self.commit(local_millis))
            }
            "GNS" => {
                let f = require(sentence, 9)?;
                self.update_time(f[0]);
                self.fix.latitude = parse_degrees_minutes(f[1], f[2]);
                self.fix.longitude = parse_degrees_minutes(f[3], f[4]);
                if !f[6].is_empty() {
                    self.fix.satellites_used = parse_i32(f[6]);
                }
                if !f[7].is_empty() {
                    self.fix.hdop = parse_f64(f[7]);
                }
                if !f[8].is_empty() {
                    self.fix.altitude_gps = parse_f64(f[8]);
                }
                self.update_velocity();
                Ok(self.commit(local_millis))
            }
            "VTG" => {
                let f = require(sentence, 5)?;
                self.bearing = parse_f64(f[0]);
                self.ground_speed = parse_f64(f[4]) * KNOTS_TO_MPS;
                self.update_velocity();
                Ok(None)
            }
            // Proprietary power status from some Bluetooth receivers
            "PWR" => Ok(None),
            other => {
                self.stats.unknown += 1;
                log::warn!("[nmea] unknown sentence {}{}", sentence.talker, other);
                Ok(None)
            }
        }
    }

    fn update_time(&mut self, time: &str) {
        if let (Some(date), Some(tod)) = (self.date_millis, parse_time(time)) {
            self.gps_millis = Some(date + tod);
        }
    }

    /// Bearing is clockwise from true north
    fn update_velocity(&mut self) {
        let bearing = self.bearing.to_radians();
        self.fix.v_north = self.ground_speed * bearing.cos();
        self.fix.v_east = self.ground_speed * bearing.sin();
    }

    fn commit(&mut self, local_millis: i64) -> Option<LocationFix> {
        let fix = &self.fix;
        let any_real = fix.latitude.is_finite()
            || fix.longitude.is_finite()
            || fix.v_north.is_finite()
            || fix.v_east.is_finite();
        if !any_real {
            return None;
        }

        let millis = match self.gps_millis {
            Some(gps) if gps > 0 => {
                let skew = local_millis - gps;
                if skew.abs() > CLOCK_SKEW_LIMIT_MS {
                    log::warn!("[nmea] system clock off by {}s", skew / 1000);
                    self.last_clock_skew = Some(skew);
                }
                gps
            }
            Some(gps) => {
                log::warn!("[nmea] invalid GPS timestamp {}", gps);
                local_millis
            }
            None => local_millis,
        };

        let mut committed = self.fix;
        committed.millis = millis;
        Some(committed)
    }
}

impl Default for NmeaParser {
    fn default() -> Self {
        Self::new()
    }
}
