//! Altitude/climb Kalman filter.
//!
//! Constant-velocity model over `[altitude, climb]` with white-noise
//! acceleration. Only altitude is observed.

use crate::error::{TrackerError, TrackerResult};
use crate::types::{AltStateMat, AltStateVec, BaroGain, BaroJacobian};

pub const DEFAULT_SENSOR_VARIANCE: f64 = 600.0;
pub const DEFAULT_ACCELERATION_VARIANCE: f64 = 8.0;

#[derive(Clone, Debug)]
pub struct KalmanFilter {
    /// Measurement variance ("r")
    sensor_variance: f64,
    acceleration_variance: f64,
    state: AltStateVec,
    covariance: AltStateMat,
    initialized: bool,
    last_residual: f64,
    update_count: u64,
}

impl KalmanFilter {
    pub fn new(sensor_variance: f64, acceleration_variance: f64) -> Self {
        Self {
            sensor_variance,
            acceleration_variance,
            state: AltStateVec::zeros(),
            covariance: AltStateMat::identity(),
            initialized: false,
            last_residual: f64::NAN,
            update_count: 0,
        }
    }

    /// Seed the state and reset covariance to identity.
    pub fn init(&mut self, position: f64, velocity: f64) {
        self.state = AltStateVec::new(position, velocity);
        self.covariance = AltStateMat::identity();
        self.last_residual = f64::NAN;
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// State transition for a step of `dt` seconds
    fn transition(dt: f64) -> AltStateMat {
        AltStateMat::new(1.0, dt, 0.0, 1.0)
    }

    fn process_noise(&self, dt: f64) -> AltStateMat {
        let a = self.acceleration_variance;
        let dt2 = dt * dt;
        let q11 = 0.25 * dt2 * dt2 * a;
        let q12 = 0.5 * dt2 * dt * a;
        let q22 = dt2 * a;
        AltStateMat::new(q11, q12, q12, q22)
    }

    /// Predict forward by `dt` seconds and correct with altitude measurement `z`.
    ///
    /// Invalid input is reported and the state left untouched.
    pub fn update(&mut self, z: f64, dt: f64) -> TrackerResult<()> {
        if !self.initialized {
            log::error!("[kalman] update before init");
            return Err(TrackerError::NotInitialized);
        }
        if !z.is_finite() {
            log::error!("[kalman] invalid measurement z={}", z);
            return Err(TrackerError::InvalidParameters(format!("z = {z}")));
        }
        if !dt.is_finite() || dt <= 0.0 {
            log::error!("[kalman] invalid time step dt={}", dt);
            return Err(TrackerError::InvalidParameters(format!("dt = {dt}")));
        }
        if !self.state.iter().all(|v| v.is_finite()) {
            log::error!("[kalman] invalid state {:?}", self.state.as_slice());
            return Err(TrackerError::InvalidState(format!(
                "x = {}, v = {}",
                self.state[0], self.state[1]
            )));
        }

        // Predict
        let f = Self::transition(dt);
        let predicted = f * self.state;
        let p = f * self.covariance * f.transpose() + self.process_noise(dt);

        // Correct
        let h = BaroJacobian::new(1.0, 0.0);
        let innovation = (h * p * h.transpose())[(0, 0)] + self.sensor_variance;
        let gain: BaroGain = p * h.transpose() / innovation;
        let residual = z - predicted[0];

        self.state = predicted + gain * residual;
        self.covariance = (AltStateMat::identity() - gain * h) * p;
        self.last_residual = residual;
        self.update_count += 1;
        Ok(())
    }

    /// Filtered altitude
    pub fn position(&self) -> f64 {
        self.state[0]
    }

    /// Filtered climb rate
    pub fn velocity(&self) -> f64 {
        self.state[1]
    }

    /// `z - predicted` from the most recent update (NaN before the first)
    pub fn last_residual(&self) -> f64 {
        self.last_residual
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn covariance(&self) -> &AltStateMat {
        &self.covariance
    }
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new(DEFAULT_SENSOR_VARIANCE, DEFAULT_ACCELERATION_VARIANCE)
    }
}
