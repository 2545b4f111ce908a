//! Device transport seam and retry policy

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::constants::{DEFAULT_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS};
use crate::frequency::Segment;
use crate::samples::Reading;

/// Failure of a single segment request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No answer within the read timeout
    #[error("Device read timed out")]
    Timeout,
    /// The link failed or the answer could not be decoded
    #[error("Device I/O error: {0}")]
    Io(String),
}

/// Source of raw readings, typically a serial VNA.
///
/// One call requests `points` frequencies starting at `start` Hz spaced by
/// `step` Hz and blocks until they arrive or the read times out.
pub trait SegmentSource {
    fn request_segment(
        &mut self,
        start: u64,
        step: f64,
        points: usize,
    ) -> Result<Vec<Reading>, TransportError>;
}

impl<T: SegmentSource + ?Sized> SegmentSource for Box<T> {
    fn request_segment(
        &mut self,
        start: u64,
        step: f64,
        points: usize,
    ) -> Result<Vec<Reading>, TransportError> {
        (**self).request_segment(start, step, points)
    }
}

impl<T: SegmentSource + ?Sized> SegmentSource for &mut T {
    fn request_segment(
        &mut self,
        start: u64,
        step: f64,
        points: usize,
    ) -> Result<Vec<Reading>, TransportError> {
        (**self).request_segment(start, step, points)
    }
}

/// Constant-backoff retry of segment requests
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first
    pub max_attempts: u32,
    /// Delay between attempts
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_delay: Duration::from_millis(DEFAULT_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries `max_attempts` times without waiting
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Result of a retried request that never succeeded
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Exhausted {
    pub attempts: u32,
    pub last: TransportError,
}

/// Request a segment, retrying on failure.
///
/// `check` validates the readings; a rejection counts as an I/O failure.
pub(crate) fn request_with_retry<S, F>(
    source: &mut S,
    segment: &Segment,
    policy: &RetryPolicy,
    check: F,
) -> Result<Vec<Reading>, Exhausted>
where
    S: SegmentSource + ?Sized,
    F: Fn(&[Reading]) -> Result<(), String>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last = TransportError::Timeout;

    for attempt in 1..=max_attempts {
        let result = source
            .request_segment(segment.start, segment.step(), segment.points)
            .and_then(|readings| {
                check(&readings).map_err(TransportError::Io)?;
                Ok(readings)
            });

        match result {
            Ok(readings) => {
                debug!(segment = segment.index, attempt, readings = readings.len(), "Segment read");
                return Ok(readings);
            }
            Err(err) => {
                warn!(
                    segment = segment.index,
                    attempt,
                    max_attempts,
                    %err,
                    "Segment request failed"
                );
                last = err;
                if attempt < max_attempts && !policy.backoff_delay.is_zero() {
                    thread::sleep(policy.backoff_delay);
                }
            }
        }
    }

    Err(Exhausted {
        attempts: max_attempts,
        last,
    })
}
