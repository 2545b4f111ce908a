//! Calibration standards, the calibration store and SOL(T) error correction

pub mod solt;
pub mod standards;
pub mod store;

pub use solt::{
    CorrectedDataset, CorrectionCache, CorrectionKind, CorrectionModel, CorrectionOptions,
    ErrorTerms, PointTerms, TransmissionTerms,
};
pub use standards::{CalibrationStandard, StandardKind, StandardModel};
pub use store::{CalibrationRecord, CalibrationSet, CalibrationStore, Snapshot};
