//! Barometric altitude fusion.
//!
//! `AltimeterCore` is the pure computation layer: pressure and GPS samples in,
//! `FusedAltitude` out. `AltitudeFusionEngine` wraps it in a worker thread so
//! sensor callbacks only enqueue and return.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use serde::{Deserialize, Serialize};

use crate::bus::Topic;
use crate::config::FusionConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::filters::KalmanFilter;
use crate::types::{FusedAltitude, LocationFix, PressureSample};

// ISA reference atmosphere
pub const PRESSURE_STANDARD_HPA: f64 = 1013.25;
const TEMP0: f64 = 288.15; // K
const LAPSE_RATE: f64 = -0.0065; // K/m
const EXP: f64 = 0.190263237;

/// Pressure altitude (m) under ISA conditions
pub fn pressure_to_altitude(pressure_hpa: f64) -> f64 {
    -TEMP0 * (1.0 - (pressure_hpa / PRESSURE_STANDARD_HPA).powf(EXP)) / LAPSE_RATE
}

/// Inverse of [`pressure_to_altitude`]
pub fn altitude_to_pressure(altitude_m: f64) -> f64 {
    PRESSURE_STANDARD_HPA * (1.0 + altitude_m * LAPSE_RATE / TEMP0).powf(1.0 / EXP)
}

/// Running average of the first `limit` raw samples after start.
#[derive(Clone, Debug)]
pub struct GroundLevel {
    level: f64,
    samples: u64,
    limit: u64,
}

impl GroundLevel {
    pub fn new(limit: u64) -> Self {
        Self {
            level: f64::NAN,
            samples: 0,
            limit,
        }
    }

    pub fn add_sample(&mut self, raw: f64) {
        if self.samples == 0 {
            self.level = raw;
        } else if self.samples < self.limit {
            self.level += (raw - self.level) / (self.samples + 1) as f64;
        }
        self.samples += 1;
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn is_calibrated(&self) -> bool {
        self.samples >= self.limit
    }
}

/// Welford mean/variance
#[derive(Clone, Debug, Default)]
pub struct RunningStat {
    n: u64,
    mean: f64,
    m2: f64,
}

impl RunningStat {
    pub fn add_sample(&mut self, x: f64) {
        if !x.is_finite() {
            return;
        }
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            f64::NAN
        } else {
            self.mean
        }
    }

    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            f64::NAN
        } else {
            self.m2 / (self.n - 1) as f64
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AltimeterStatus {
    pub altitude: f64,
    pub climb: f64,
    pub pressure_hpa: f64,
    pub pressure_altitude: f64,
    pub ground_level: f64,
    pub altitude_agl: f64,
    pub altitude_offset: f64,
    /// Barometer refresh rate, Hz
    pub refresh_rate: f64,
    /// Mean of (filtered − raw) pressure altitude
    pub model_error_mean: f64,
    pub model_error_variance: f64,
    pub baro_samples: u64,
    pub gps_samples: u64,
}

impl Default for AltimeterStatus {
    fn default() -> Self {
        AltimeterCore::new(FusionConfig::default()).status()
    }
}

pub struct AltimeterCore {
    config: FusionConfig,
    filter: KalmanFilter,
    ground: GroundLevel,

    pressure: f64,
    pressure_altitude_raw: f64,
    pressure_altitude_filtered: f64,
    /// altitude = filtered pressure altitude − offset
    altitude_offset: f64,

    altitude: f64,
    climb: f64,

    last_nanos: Option<i64>,
    last_millis: i64,

    baro_samples: u64,
    gps_samples: u64,
    refresh_rate: f64,
    model_error: RunningStat,
}

impl AltimeterCore {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            filter: KalmanFilter::new(config.sensor_variance, config.acceleration_variance),
            ground: GroundLevel::new(config.ground_level_samples),
            config,
            pressure: f64::NAN,
            pressure_altitude_raw: f64::NAN,
            pressure_altitude_filtered: f64::NAN,
            altitude_offset: 0.0,
            altitude: f64::NAN,
            climb: f64::NAN,
            last_nanos: None,
            last_millis: 0,
            baro_samples: 0,
            gps_samples: 0,
            refresh_rate: 0.0,
            model_error: RunningStat::default(),
        }
    }

    /// Process one barometer reading. Publishes on every accepted sample.
    pub fn on_pressure(&mut self, sample: &PressureSample) -> Option<FusedAltitude> {
        if !sample.pressure_hpa.is_finite() || sample.pressure_hpa <= 0.0 {
            log::warn!("[altimeter] rejected pressure sample {}", sample.pressure_hpa);
            return None;
        }

        let raw = pressure_to_altitude(sample.pressure_hpa);
        self.pressure = sample.pressure_hpa;
        self.pressure_altitude_raw = raw;
        self.last_millis = sample.millis;

        match self.last_nanos {
            None => {
                self.filter.init(raw, 0.0);
                self.last_nanos = Some(sample.nanos);
            }
            Some(prev) => {
                let delta = sample.nanos - prev;
                if delta > 0 {
                    self.update_refresh_rate(delta);
                    self.last_nanos = Some(sample.nanos);
                }
                // Out-of-order samples are refused by the filter and leave its state intact
                let dt = delta as f64 * 1e-9;
                if let Err(err) = self.filter.update(raw, dt) {
                    log::debug!("[altimeter] skipped filter update: {}", err);
                }
            }
        }

        self.pressure_altitude_filtered = self.filter.position();
        self.altitude = self.pressure_altitude_filtered - self.altitude_offset;
        self.climb = self.filter.velocity();
        self.model_error
            .add_sample(self.pressure_altitude_filtered - self.pressure_altitude_raw);
        self.ground.add_sample(raw);
        self.baro_samples += 1;

        Some(FusedAltitude {
            millis: sample.millis,
            nanos: sample.nanos,
            altitude: self.altitude,
            climb: self.climb,
            pressure_hpa: self.pressure,
        })
    }

    /// Process one GPS fix.
    ///
    /// With a barometer this only corrects the altitude offset. Without one,
    /// GPS altitude becomes the output and a `FusedAltitude` is returned.
    pub fn on_location(&mut self, fix: &LocationFix) -> Option<FusedAltitude> {
        if !fix.altitude_gps.is_finite() {
            return None;
        }

        let published = if self.baro_samples > 0 {
            if self.gps_samples == 0 {
                self.altitude_offset = self.pressure_altitude_filtered - fix.altitude_gps;
            } else {
                let error = self.altitude - fix.altitude_gps;
                let factor = self.gps_samples.min(self.config.altitude_offset_lag.max(1));
                self.altitude_offset += error / factor as f64;
            }
            self.altitude = self.pressure_altitude_filtered - self.altitude_offset;
            None
        } else {
            let prev_altitude = self.altitude;
            let prev_millis = self.last_millis;
            self.last_millis = fix.millis;
            self.altitude = fix.altitude_gps;
            if prev_altitude.is_nan() {
                self.climb = 0.0;
            } else {
                let dt = (fix.millis - prev_millis) as f64 * 1e-3;
                if dt > 0.0 {
                    self.climb = (self.altitude - prev_altitude) / dt;
                } else {
                    log::debug!("[altimeter] gps fix without time step, climb kept");
                }
            }
            Some(FusedAltitude {
                millis: fix.millis,
                nanos: 0,
                altitude: self.altitude,
                climb: self.climb,
                pressure_hpa: f64::NAN,
            })
        };

        self.gps_samples += 1;
        published
    }

    fn update_refresh_rate(&mut self, delta_nanos: i64) {
        let refresh = 1e9 / delta_nanos as f64;
        self.refresh_rate += (refresh - self.refresh_rate) * 0.5;
        if !self.refresh_rate.is_finite() {
            log::error!(
                "[altimeter] refresh rate not finite, delta {}ns; reset",
                delta_nanos
            );
            self.refresh_rate = 0.0;
        }
    }

    pub fn altitude(&self) -> f64 {
        self.altitude
    }

    pub fn climb(&self) -> f64 {
        self.climb
    }

    /// Filtered pressure altitude above the calibrated ground level
    pub fn altitude_agl(&self) -> f64 {
        self.pressure_altitude_filtered - self.ground.level()
    }

    pub fn ground_level(&self) -> f64 {
        self.ground.level()
    }

    pub fn altitude_offset(&self) -> f64 {
        self.altitude_offset
    }

    pub fn refresh_rate(&self) -> f64 {
        self.refresh_rate
    }

    pub fn status(&self) -> AltimeterStatus {
        AltimeterStatus {
            altitude: self.altitude,
            climb: self.climb,
            pressure_hpa: self.pressure,
            pressure_altitude: self.pressure_altitude_filtered,
            ground_level: self.ground.level(),
            altitude_agl: self.altitude_agl(),
            altitude_offset: self.altitude_offset,
            refresh_rate: self.refresh_rate,
            model_error_mean: self.model_error.mean(),
            model_error_variance: self.model_error.variance(),
            baro_samples: self.baro_samples,
            gps_samples: self.gps_samples,
        }
    }
}

// ─── Service ─────────────────────────────────────────────────────────────────

enum FusionInput {
    Pressure(PressureSample),
    Location(LocationFix),
}

struct Worker {
    tx: Sender<FusionInput>,
    handle: JoinHandle<()>,
}

/// Owns one `AltimeterCore` per started session on a dedicated thread.
pub struct AltitudeFusionEngine {
    config: FusionConfig,
    altitudes: Topic<FusedAltitude>,
    status: Arc<Mutex<AltimeterStatus>>,
    worker: Mutex<Option<Worker>>,
}

impl AltitudeFusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            altitudes: Topic::new("altitude"),
            status: Arc::new(Mutex::new(AltimeterStatus::default())),
            worker: Mutex::new(None),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a fresh session. Repeated starts are ignored.
    pub fn start(&self) {
        let mut worker = self.worker();
        if worker.is_some() {
            log::warn!("[altimeter] already started");
            return;
        }

        let (tx, rx) = channel::unbounded::<FusionInput>();
        let mut core = AltimeterCore::new(self.config.clone());
        let altitudes = self.altitudes.clone();
        let status = self.status.clone();
        *status.lock().unwrap_or_else(|e| e.into_inner()) = core.status();

        let handle = thread::spawn(move || {
            for input in rx.iter() {
                let fused = match input {
                    FusionInput::Pressure(sample) => core.on_pressure(&sample),
                    FusionInput::Location(fix) => core.on_location(&fix),
                };
                if let Some(fused) = fused {
                    altitudes.publish(fused);
                }
                *status.lock().unwrap_or_else(|e| e.into_inner()) = core.status();
            }
            log::debug!("[altimeter] worker exit");
        });

        *worker = Some(Worker { tx, handle });
        log::info!("[altimeter] started");
    }

    /// Drain pending input and stop. Repeated stops are ignored.
    pub fn stop(&self) {
        let Some(worker) = self.worker().take() else {
            log::warn!("[altimeter] stop while not started");
            return;
        };
        drop(worker.tx);
        if worker.handle.join().is_err() {
            log::error!("[altimeter] worker panicked");
        }
        log::info!("[altimeter] stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker().is_some()
    }

    fn submit(&self, input: FusionInput) -> TrackerResult<()> {
        match self.worker().as_ref() {
            Some(worker) => worker.tx.send(input).map_err(|_| TrackerError::NotRunning),
            None => Err(TrackerError::NotRunning),
        }
    }

    /// Enqueue a barometer reading. Never blocks on filter work.
    pub fn submit_pressure(&self, sample: PressureSample) -> TrackerResult<()> {
        self.submit(FusionInput::Pressure(sample))
    }

    pub fn submit_location(&self, fix: LocationFix) -> TrackerResult<()> {
        self.submit(FusionInput::Location(fix))
    }

    pub fn altitudes(&self) -> &Topic<FusedAltitude> {
        &self.altitudes
    }

    /// Snapshot as of the last processed input
    pub fn status(&self) -> AltimeterStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Drop for AltitudeFusionEngine {
    fn drop(&mut self) {
        if let Some(worker) = self.worker().take() {
            drop(worker.tx);
            let _ = worker.handle.join();
        }
    }
}
