//! vnacal-core: measurement pipeline for vector network analyzers
//!
//! Segmented frequency sweeps against analyzer hardware, averaging with
//! outlier rejection, SOL(T) calibration and error correction.
//!
//! ## Modules
//!
//! - `frequency` - Sweep plans and segment descriptors
//! - `samples` - Raw readings and averaging
//! - `dataset` - Ordered measurements and derived display quantities
//! - `interpolation` - Monotonic cubic interpolation over frequency
//! - `calibration` - Standards, calibration store and error correction
//! - `sweep` - Transport seam, sweep state machine and worker thread
//! - `config` - Layered configuration
//! - `telemetry` - Tracing subscriber setup
//! - `math` - RF conversions

pub mod calibration;
pub mod config;
pub mod constants;
pub mod dataset;
pub mod error;
pub mod frequency;
pub mod interpolation;
pub mod math;
pub mod samples;
pub mod sweep;
pub mod telemetry;

pub use calibration::{
    CalibrationRecord, CalibrationSet, CalibrationStandard, CalibrationStore, CorrectedDataset,
    CorrectionCache, CorrectionModel, CorrectionOptions, StandardKind, StandardModel,
};
pub use config::VnaConfig;
pub use dataset::{Datapoint, Dataset};
pub use error::{Result, VnaError};
pub use frequency::{FrequencyRange, Segment, Spacing, SweepPlan};
pub use samples::{AveragingPolicy, Reading};
pub use sweep::{SegmentSource, SweepMode, SweepOrchestrator, SweepOutcome, SweepWorker};
