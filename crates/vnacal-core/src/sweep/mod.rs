//! Segmented acquisition: transport seam, state machine and worker thread

pub mod orchestrator;
pub mod transport;
pub mod worker;

pub use orchestrator::{
    CancelToken, SweepEvent, SweepMode, SweepOrchestrator, SweepOutcome, SweepState,
};
pub use transport::{RetryPolicy, SegmentSource, TransportError};
pub use worker::{SweepWorker, EVENT_CAPACITY};
