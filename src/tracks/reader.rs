use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::GzDecoder;
use serde::Serialize;

use crate::altimeter::pressure_to_altitude;
use crate::error::{TrackerError, TrackerResult};
use crate::tracks::rows::{parse_row, TrackRow, HEADER};

/// Decoded contents of one session file.
#[derive(Debug, Default)]
pub struct SessionLog {
    pub rows: Vec<TrackRow>,
    /// Rows that could not be decoded
    pub skipped: usize,
}

/// Read a gzip CSV session file. A truncated gzip stream (e.g. power loss
/// mid-session) keeps the rows decoded before the damage.
pub fn read_session(path: &Path) -> TrackerResult<SessionLog> {
    let file = File::open(path)?;
    let mut lines = BufReader::new(GzDecoder::new(file)).lines();

    match lines.next() {
        Some(Ok(header)) if header.trim_end() == HEADER => {}
        Some(Ok(header)) => {
            return Err(TrackerError::InvalidState(format!(
                "unexpected header in {}: {:?}",
                path.display(),
                header
            )))
        }
        Some(Err(e)) => return Err(e.into()),
        None => {
            return Err(TrackerError::InvalidState(format!(
                "empty session file {}",
                path.display()
            )))
        }
    }

    let mut log = SessionLog::default();
    for line in lines {
        match line {
            Ok(line) => match parse_row(&line) {
                Some(row) => log.rows.push(row),
                None => log.skipped += 1,
            },
            Err(e) => {
                log::warn!("[tracks] {} truncated: {}", path.display(), e);
                break;
            }
        }
    }
    Ok(log)
}

/// Aggregate figures for one session.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub altitude_rows: usize,
    pub location_rows: usize,
    pub sensor_rows: usize,
    pub skipped_rows: usize,
    pub duration_ms: i64,
    /// Highest/lowest ISA pressure altitude, meters
    pub max_pressure_altitude: Option<f64>,
    pub min_pressure_altitude: Option<f64>,
    pub max_gps_altitude: Option<f64>,
    /// Peak horizontal speed, m/s
    pub max_ground_speed: Option<f64>,
}

fn fold_max(current: Option<f64>, value: f64) -> Option<f64> {
    if !value.is_finite() {
        return current;
    }
    Some(current.map_or(value, |c| c.max(value)))
}

fn fold_min(current: Option<f64>, value: f64) -> Option<f64> {
    if !value.is_finite() {
        return current;
    }
    Some(current.map_or(value, |c| c.min(value)))
}

impl SessionSummary {
    pub fn from_log(log: &SessionLog) -> Self {
        let mut summary = SessionSummary {
            skipped_rows: log.skipped,
            ..Default::default()
        };
        let mut first: Option<i64> = None;
        let mut last: Option<i64> = None;

        for row in &log.rows {
            let millis = row.millis();
            first = Some(first.map_or(millis, |f| f.min(millis)));
            last = Some(last.map_or(millis, |l| l.max(millis)));

            match row {
                TrackRow::Altitude { pressure_hpa, .. } => {
                    summary.altitude_rows += 1;
                    let altitude = pressure_to_altitude(*pressure_hpa);
                    summary.max_pressure_altitude = fold_max(summary.max_pressure_altitude, altitude);
                    summary.min_pressure_altitude = fold_min(summary.min_pressure_altitude, altitude);
                }
                TrackRow::Location(fix) => {
                    summary.location_rows += 1;
                    summary.max_gps_altitude = fold_max(summary.max_gps_altitude, fix.altitude_gps);
                    summary.max_ground_speed = fold_max(summary.max_ground_speed, fix.ground_speed());
                }
                TrackRow::Sensor(_) => summary.sensor_rows += 1,
            }
        }

        if let (Some(first), Some(last)) = (first, last) {
            summary.duration_ms = last - first;
        }
        summary
    }
}
