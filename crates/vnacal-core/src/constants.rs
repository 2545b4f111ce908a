//! Numerical constants for calibration and sweep calculations
//!
//! Provides standardized tolerance values and reference values
//! used throughout the library.

/// Tolerance for detecting near-zero values in division checks.
pub const NEAR_ZERO: f64 = 1e-15;

/// Determinant magnitude below which the 3-term calibration system is
/// considered singular (two or more standards measured the same value).
pub const SINGULAR_TOL: f64 = 1e-12;

/// Reference impedance of the measurement system in ohms.
pub const Z0: f64 = 50.0;

/// Speed of light in vacuum (m/s), used for wavelength conversions.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Readings with a magnitude above this are considered implausible
/// when input validation is enabled.
pub const MAX_PLAUSIBLE_MAGNITUDE: f64 = 9.5;

/// Default number of attempts per transport request.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default backoff between transport retries in milliseconds.
pub const DEFAULT_BACKOFF_MS: u64 = 500;
