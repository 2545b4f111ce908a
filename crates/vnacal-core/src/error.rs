//! Error types for the measurement pipeline
//!
//! Every variant carries the frequency, segment or standard it concerns so
//! that a consumer can render a precise message. No operation in this crate
//! substitutes a default numeric value for a failed computation.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, VnaError>;

/// Errors raised by planning, acquisition, interpolation and correction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VnaError {
    /// Sweep parameters rejected before any hardware access.
    #[error("Invalid sweep range {start}..{stop} Hz: {reason}")]
    InvalidRange {
        start: u64,
        stop: u64,
        reason: String,
    },

    /// Too few readings arrived for one frequency before the read gave up.
    #[error("Incomplete acquisition at {frequency} Hz: {received} of {required} readings")]
    IncompleteAcquisition {
        frequency: u64,
        received: usize,
        required: usize,
    },

    /// A segment could not be acquired after all retry attempts.
    #[error("Acquisition of segment {segment} failed after {attempts} attempts: {reason}")]
    AcquisitionFailed {
        segment: usize,
        attempts: u32,
        reason: String,
    },

    /// Interpolation needs at least two distinct frequencies.
    #[error("Insufficient data for '{label}': {points} point(s), need at least 2")]
    InsufficientData { label: String, points: usize },

    /// Requested frequency lies outside the measured span. Never extrapolated.
    #[error("Frequency {frequency} Hz outside '{label}' coverage {min}..={max} Hz")]
    FrequencyOutOfRange {
        label: String,
        frequency: u64,
        min: u64,
        max: u64,
    },

    /// Standards are degenerate at this frequency; the user must recalibrate.
    #[error(
        "Singular calibration at {frequency} Hz: two or more standards measured the same value, \
         recalibrate"
    )]
    SingularCalibration { frequency: u64 },

    /// A standard required by the requested correction model is absent.
    #[error("Missing calibration standard: {0}")]
    MissingStandard(String),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<figment::Error> for VnaError {
    fn from(err: figment::Error) -> Self {
        VnaError::Config(err.to_string())
    }
}

impl VnaError {
    /// Whether a retry of the same operation could succeed.
    ///
    /// Interpolation preconditions and singular calibrations are caller
    /// errors and never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VnaError::IncompleteAcquisition { .. } | VnaError::AcquisitionFailed { .. }
        )
    }
}
