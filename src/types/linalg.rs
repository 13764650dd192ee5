//! Linear algebra aliases for the altitude filter
//!
//! Keeps the 2-state (altitude, climb) filter dimension-checked at compile time.

use nalgebra::{SMatrix, SVector};

// ===== State Dimensions =====
pub const STATE_DIM_ALT: usize = 2; // (altitude, climb)

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_BARO: usize = 1; // pressure altitude

// ===== Altitude Filter Types =====
pub type AltStateVec = SVector<f64, STATE_DIM_ALT>;
pub type AltStateMat = SMatrix<f64, STATE_DIM_ALT, STATE_DIM_ALT>;

// Jacobian / gain types
pub type BaroJacobian = SMatrix<f64, MEASURE_DIM_BARO, STATE_DIM_ALT>; // 1×2
pub type BaroGain = SMatrix<f64, STATE_DIM_ALT, MEASURE_DIM_BARO>; // 2×1
