//! Sweep state machine
//!
//! `Idle -> Planning -> Acquiring(i) -> Merging -> Correcting -> Idle`.
//! Cancellation is observed between segments and between averaging passes,
//! never inside a transport request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::transport::{request_with_retry, Exhausted, RetryPolicy, SegmentSource, TransportError};
use crate::calibration::{CalibrationStore, CorrectedDataset, CorrectionCache, CorrectionOptions};
use crate::dataset::Dataset;
use crate::error::VnaError;
use crate::frequency::{Segment, SweepPlan};
use crate::samples::{AveragingPolicy, RawSampleStore, Reading};

/// Cooperative cancellation flag shared between threads
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag before reusing the token for another sweep
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    Planning,
    Acquiring { segment: usize },
    Merging,
    Correcting,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepMode {
    /// One pass, then idle
    #[default]
    Single,
    /// Repeat passes until cancelled
    Continuous,
    /// One pass with the averaging policy applied
    Average,
}

/// Result of one completed or cancelled pass
#[derive(Debug, Clone, PartialEq)]
pub struct SweepOutcome {
    /// Pass counter, starting at 1
    pub pass: u64,
    /// Merged uncorrected data
    pub raw: Dataset,
    /// Present when a calibration was applied
    pub corrected: Option<CorrectedDataset>,
    /// Failed segments, frequency gaps and correction errors
    pub failures: Vec<VnaError>,
    pub cancelled: bool,
}

impl SweepOutcome {
    /// Corrected data when available, raw otherwise
    pub fn dataset(&self) -> &Dataset {
        self.corrected.as_ref().map_or(&self.raw, |c| &c.dataset)
    }

    /// True when segments or frequencies are missing
    pub fn is_partial(&self) -> bool {
        self.cancelled || self.raw.is_incomplete()
    }
}

/// Notifications published while sweeping
#[derive(Debug, Clone, PartialEq)]
pub enum SweepEvent {
    Progress { percent: f64 },
    SegmentDone { segment: usize, points: usize },
    Error(VnaError),
    Completed(SweepOutcome),
}

struct Calibration {
    store: Arc<CalibrationStore>,
    cache: CorrectionCache,
}

/// Drives segmented acquisition against a `SegmentSource`
pub struct SweepOrchestrator<S> {
    source: S,
    plan: SweepPlan,
    mode: SweepMode,
    averaging: AveragingPolicy,
    retry: RetryPolicy,
    max_magnitude: Option<f64>,
    calibration: Option<Calibration>,
    cancel: CancelToken,
    events: Option<Sender<SweepEvent>>,
    state: SweepState,
    samples: RawSampleStore,
    merged: Dataset,
    failures: Vec<VnaError>,
    pass: u64,
}

impl<S: SegmentSource> SweepOrchestrator<S> {
    pub fn new(source: S, plan: SweepPlan) -> Self {
        Self {
            source,
            plan,
            mode: SweepMode::default(),
            averaging: AveragingPolicy::default(),
            retry: RetryPolicy::default(),
            max_magnitude: None,
            calibration: None,
            cancel: CancelToken::new(),
            events: None,
            state: SweepState::Idle,
            samples: RawSampleStore::default(),
            merged: Dataset::new(),
            failures: Vec::new(),
            pass: 0,
        }
    }

    pub fn with_mode(mut self, mode: SweepMode) -> Self {
        self.mode = mode;
        self
    }

    /// Policy used in `SweepMode::Average`
    pub fn with_averaging(mut self, averaging: AveragingPolicy) -> Self {
        self.averaging = averaging;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reject readings above `max_magnitude` as failed reads
    pub fn with_validation(mut self, max_magnitude: Option<f64>) -> Self {
        self.max_magnitude = max_magnitude;
        self
    }

    /// Correct every pass with the store's current calibration
    pub fn with_calibration(
        mut self,
        store: Arc<CalibrationStore>,
        options: CorrectionOptions,
    ) -> Self {
        self.calibration = Some(Calibration {
            store,
            cache: CorrectionCache::new(options),
        });
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: Sender<SweepEvent>) -> Self {
        self.events = Some(events);
        self
    }

    #[inline]
    pub fn state(&self) -> SweepState {
        self.state
    }

    #[inline]
    pub fn mode(&self) -> SweepMode {
        self.mode
    }

    #[inline]
    pub fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Policy applied to the current mode
    fn active_averaging(&self) -> AveragingPolicy {
        match self.mode {
            SweepMode::Average => self.averaging,
            SweepMode::Single | SweepMode::Continuous => AveragingPolicy::default(),
        }
    }

    /// Advance exactly one transition.
    ///
    /// Returns the outcome when a pass completes or is cancelled.
    pub fn step(&mut self) -> Option<SweepOutcome> {
        let (next, outcome) = match self.state {
            SweepState::Idle => (SweepState::Planning, None),
            SweepState::Planning => {
                self.begin_pass();
                (SweepState::Acquiring { segment: 0 }, None)
            }
            SweepState::Acquiring { segment } => (self.acquire(segment), None),
            SweepState::Merging => (self.merge(), None),
            SweepState::Correcting => {
                let outcome = self.correct();
                let next = if self.mode == SweepMode::Continuous {
                    self.begin_pass();
                    SweepState::Acquiring { segment: 0 }
                } else {
                    SweepState::Idle
                };
                (next, Some(outcome))
            }
            SweepState::Cancelled => (SweepState::Idle, Some(self.finish_cancelled())),
        };
        debug!(from = ?self.state, to = ?next, "Sweep transition");
        self.state = next;
        outcome
    }

    /// Drive `step()` until the current pass ends
    pub fn run_once(&mut self) -> SweepOutcome {
        loop {
            if let Some(outcome) = self.step() {
                return outcome;
            }
        }
    }

    /// Publish without blocking; failures are kept in the outcome either way
    fn emit(&self, event: SweepEvent) {
        if let Some(tx) = &self.events {
            match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("Sweep event channel full, event dropped"),
                Err(TrySendError::Disconnected(_)) => debug!("Sweep event receiver dropped"),
            }
        }
    }

    fn record(&mut self, err: VnaError) {
        self.emit(SweepEvent::Error(err.clone()));
        self.failures.push(err);
    }

    fn begin_pass(&mut self) {
        self.pass += 1;
        self.samples = RawSampleStore::new(self.active_averaging());
        self.merged = Dataset::new();
        self.failures.clear();
        info!(
            pass = self.pass,
            segments = self.plan.segment_count(),
            points = self.plan.point_count(),
            mode = ?self.mode,
            "Sweep pass started"
        );
    }

    fn acquire(&mut self, index: usize) -> SweepState {
        if self.cancel.is_cancelled() {
            return SweepState::Cancelled;
        }
        let segment = self.plan.segments()[index];
        let total = self.plan.segment_count();
        let passes = self.active_averaging().averages.max(1);
        let max_magnitude = self.max_magnitude;

        for pass in 0..passes {
            if pass > 0 && self.cancel.is_cancelled() {
                // Unfinished segment is discarded
                self.samples.clear();
                return SweepState::Cancelled;
            }

            let result = request_with_retry(&mut self.source, &segment, &self.retry, |readings| {
                check_plausible(readings, max_magnitude)
            });
            match result {
                Ok(readings) => self.store_readings(&segment, readings),
                Err(Exhausted {
                    last: TransportError::Timeout,
                    attempts,
                }) => {
                    warn!(segment = index, attempts, "Segment timed out, leaving gaps");
                }
                Err(Exhausted {
                    last: TransportError::Io(reason),
                    attempts,
                }) => {
                    error!(segment = index, attempts, %reason, "Segment acquisition failed");
                    self.samples.clear();
                    self.merged.mark_incomplete();
                    self.record(VnaError::AcquisitionFailed {
                        segment: index,
                        attempts,
                        reason,
                    });
                    return self.after_segment(index);
                }
            }

            let done = index * passes + pass + 1;
            self.emit(SweepEvent::Progress {
                percent: 100.0 * done as f64 / (total * passes) as f64,
            });
        }

        let (dataset, gaps) = self.samples.drain_segment(&segment.frequencies());
        let points = dataset.len();
        self.merged.merge(dataset);
        for gap in gaps {
            self.record(gap);
        }
        debug!(segment = index, points, "Segment complete");
        self.emit(SweepEvent::SegmentDone {
            segment: index,
            points,
        });
        self.after_segment(index)
    }

    fn after_segment(&self, index: usize) -> SweepState {
        if index + 1 < self.plan.segment_count() {
            SweepState::Acquiring { segment: index + 1 }
        } else {
            SweepState::Merging
        }
    }

    /// Snap reported frequencies onto the plan and store the readings
    fn store_readings(&mut self, segment: &Segment, readings: Vec<Reading>) {
        for reading in readings {
            match segment.snap(reading.freq) {
                Some(freq) => {
                    self.samples.push(Reading { freq, ..reading });
                }
                None => warn!(
                    segment = segment.index,
                    frequency = reading.freq,
                    "Reading outside planned frequencies dropped"
                ),
            }
        }
    }

    fn merge(&mut self) -> SweepState {
        if self.cancel.is_cancelled() {
            return SweepState::Cancelled;
        }
        if !self.failures.is_empty() {
            self.merged.mark_incomplete();
        }
        info!(
            pass = self.pass,
            points = self.merged.len(),
            failures = self.failures.len(),
            "Sweep merged"
        );
        SweepState::Correcting
    }

    fn correct(&mut self) -> SweepOutcome {
        let raw = std::mem::take(&mut self.merged);
        let mut failures = std::mem::take(&mut self.failures);

        let corrected = match &self.calibration {
            Some(cal) if !cal.store.is_empty() => {
                match cal.cache.model(&cal.store).and_then(|model| model.apply(raw.clone())) {
                    Ok(corrected) => Some(corrected),
                    Err(err) => {
                        error!(%err, "Correction failed, returning raw data");
                        self.emit(SweepEvent::Error(err.clone()));
                        failures.push(err);
                        None
                    }
                }
            }
            _ => None,
        };

        SweepOutcome {
            pass: self.pass,
            raw,
            corrected,
            failures,
            cancelled: false,
        }
    }

    fn finish_cancelled(&mut self) -> SweepOutcome {
        let mut raw = std::mem::take(&mut self.merged);
        raw.mark_incomplete();
        self.samples.clear();
        info!(pass = self.pass, points = raw.len(), "Sweep cancelled");

        SweepOutcome {
            pass: self.pass,
            raw,
            corrected: None,
            failures: std::mem::take(&mut self.failures),
            cancelled: true,
        }
    }
}

fn check_plausible(readings: &[Reading], max_magnitude: Option<f64>) -> Result<(), String> {
    let Some(max) = max_magnitude else {
        return Ok(());
    };
    let implausible = readings
        .iter()
        .find(|r| r.s11.norm() > max || r.s21.is_some_and(|z| z.norm() > max));
    match implausible {
        Some(r) => Err(format!("implausible reading at {} Hz", r.freq)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationStandard, StandardKind};
    use crate::frequency::Spacing;
    use approx::assert_relative_eq;
    use num_complex::Complex64;

    fn s11_at(freq: u64) -> Complex64 {
        Complex64::new(0.5, freq as f64 * 1e-9)
    }

    /// Simulated analyzer with scripted faults keyed by segment start
    #[derive(Default)]
    struct MockVna {
        calls: Vec<u64>,
        io_failure: Vec<u64>,
        timeout: Vec<u64>,
        implausible_once: Vec<u64>,
        outlier_first: bool,
        cancel_at: Option<(u64, CancelToken)>,
    }

    impl SegmentSource for MockVna {
        fn request_segment(
            &mut self,
            start: u64,
            step: f64,
            points: usize,
        ) -> Result<Vec<Reading>, TransportError> {
            let first_call = !self.calls.contains(&start);
            self.calls.push(start);

            if let Some((at, token)) = &self.cancel_at {
                if *at == start {
                    token.cancel();
                }
            }
            if self.io_failure.contains(&start) {
                return Err(TransportError::Io("checksum mismatch".into()));
            }
            if self.timeout.contains(&start) {
                return Err(TransportError::Timeout);
            }

            let implausible = first_call && self.implausible_once.contains(&start);
            let outlier = first_call && self.outlier_first;
            Ok((0..points)
                .map(|k| {
                    let freq = start + (k as f64 * step).round() as u64;
                    let s11 = if implausible {
                        Complex64::new(12.0, 0.0)
                    } else if outlier {
                        Complex64::new(100.0, 100.0)
                    } else {
                        s11_at(freq)
                    };
                    Reading::new(freq, s11, Some(Complex64::new(0.25, 0.0)))
                })
                .collect())
        }
    }

    fn plan(start: u64, stop: u64, segments: usize, points: usize) -> SweepPlan {
        SweepPlan::new(start, stop, segments, points, Spacing::Linear).unwrap()
    }

    #[test]
    fn test_two_segment_linear_sweep() {
        let mut vna = MockVna::default();
        let mut sweep = SweepOrchestrator::new(&mut vna, plan(1_000_000, 101_000_000, 2, 11));
        let outcome = sweep.run_once();

        assert_eq!(sweep.state(), SweepState::Idle);
        assert_eq!(outcome.raw.len(), 21);
        assert!(!outcome.is_partial());
        assert!(outcome.failures.is_empty());
        let freqs = outcome.raw.frequencies();
        assert_eq!(freqs[0], 1_000_000);
        assert_eq!(freqs[20], 101_000_000);
        assert!(freqs.windows(2).all(|w| w[1] - w[0] == 5_000_000));
        assert_eq!(vna.calls, vec![1_000_000, 51_000_000]);
    }

    #[test]
    fn test_step_transitions() {
        let mut vna = MockVna::default();
        let mut sweep = SweepOrchestrator::new(&mut vna, plan(100, 200, 2, 3));

        let mut states = vec![sweep.state()];
        let outcome = loop {
            let outcome = sweep.step();
            states.push(sweep.state());
            if let Some(outcome) = outcome {
                break outcome;
            }
        };

        assert_eq!(
            states,
            vec![
                SweepState::Idle,
                SweepState::Planning,
                SweepState::Acquiring { segment: 0 },
                SweepState::Acquiring { segment: 1 },
                SweepState::Merging,
                SweepState::Correcting,
                SweepState::Idle,
            ]
        );
        assert_eq!(outcome.pass, 1);
        assert_eq!(outcome.raw.len(), 5);
    }

    #[test]
    fn test_cancel_keeps_completed_segments() {
        let token = CancelToken::new();
        let mut vna = MockVna {
            cancel_at: Some((11_000_000, token.clone())),
            ..Default::default()
        };
        let mut sweep = SweepOrchestrator::new(&mut vna, plan(1_000_000, 31_000_000, 3, 6))
            .with_cancel_token(token.clone());
        let outcome = sweep.run_once();

        assert!(outcome.cancelled);
        assert!(outcome.raw.is_incomplete());
        assert_eq!(sweep.state(), SweepState::Idle);
        // Segments 0 and 1 only
        assert_eq!(outcome.raw.len(), 11);
        assert_eq!(outcome.raw.max_freq(), Some(21_000_000));
        assert!(outcome.corrected.is_none());
        assert_eq!(vna.calls, vec![1_000_000, 11_000_000]);
    }

    #[test]
    fn test_cancel_between_averaging_passes() {
        let token = CancelToken::new();
        let mut vna = MockVna {
            cancel_at: Some((11_000_000, token.clone())),
            ..Default::default()
        };
        let mut sweep = SweepOrchestrator::new(&mut vna, plan(1_000_000, 31_000_000, 3, 6))
            .with_mode(SweepMode::Average)
            .with_averaging(AveragingPolicy::new(3))
            .with_cancel_token(token);
        let outcome = sweep.run_once();

        assert!(outcome.cancelled);
        // Segment 1 was interrupted after its first pass
        let first = plan(1_000_000, 31_000_000, 3, 6).segments()[0].frequencies();
        assert_eq!(outcome.raw.frequencies(), first);
        assert_eq!(vna.calls.iter().filter(|&&s| s == 11_000_000).count(), 1);
    }

    #[test]
    fn test_failed_segment_is_skipped() {
        let mut vna = MockVna {
            io_failure: vec![11_000_000],
            ..Default::default()
        };
        let mut sweep = SweepOrchestrator::new(&mut vna, plan(1_000_000, 31_000_000, 3, 6))
            .with_retry(RetryPolicy::immediate(3));
        let outcome = sweep.run_once();

        assert!(!outcome.cancelled);
        assert!(outcome.raw.is_incomplete());
        assert_eq!(
            outcome.failures,
            vec![VnaError::AcquisitionFailed {
                segment: 1,
                attempts: 3,
                reason: "checksum mismatch".into(),
            }]
        );
        // Boundaries of the failed segment come from its neighbours
        assert_eq!(outcome.raw.len(), 12);
        assert!(outcome.raw.get(15_000_000).is_none());
        assert_eq!(vna.calls.iter().filter(|&&s| s == 11_000_000).count(), 3);
        assert_eq!(*vna.calls.last().unwrap(), 21_000_000);
    }

    #[test]
    fn test_timeouts_leave_gaps() {
        let mut vna = MockVna {
            timeout: vec![11_000_000],
            ..Default::default()
        };
        let mut sweep = SweepOrchestrator::new(&mut vna, plan(1_000_000, 31_000_000, 3, 6))
            .with_retry(RetryPolicy::immediate(2));
        let outcome = sweep.run_once();

        let gaps = outcome
            .failures
            .iter()
            .filter(|e| matches!(e, VnaError::IncompleteAcquisition { received: 0, .. }))
            .count();
        assert_eq!(gaps, 6);
        assert!(outcome.raw.is_incomplete());
        assert_eq!(outcome.raw.len(), 12);
    }

    #[test]
    fn test_average_mode_rejects_outliers() {
        let mut vna = MockVna {
            outlier_first: true,
            ..Default::default()
        };
        let mut sweep = SweepOrchestrator::new(&mut vna, plan(1_000, 2_000, 1, 11))
            .with_mode(SweepMode::Average)
            .with_averaging(AveragingPolicy::new(4));
        let outcome = sweep.run_once();

        assert_eq!(outcome.raw.len(), 11);
        for dp in outcome.raw.iter() {
            assert_relative_eq!(dp.s11.re, s11_at(dp.freq).re, epsilon = 1e-12);
            assert_relative_eq!(dp.s11.im, s11_at(dp.freq).im, epsilon = 1e-12);
        }
        assert_eq!(vna.calls.len(), 4);
    }

    #[test]
    fn test_implausible_readings_retried() {
        let mut vna = MockVna {
            implausible_once: vec![1_000],
            ..Default::default()
        };
        let mut sweep = SweepOrchestrator::new(&mut vna, plan(1_000, 2_000, 1, 11))
            .with_retry(RetryPolicy::immediate(3))
            .with_validation(Some(9.5));
        let outcome = sweep.run_once();

        assert!(outcome.failures.is_empty());
        assert_relative_eq!(outcome.raw.points()[0].s11.re, 0.5);
        assert_eq!(vna.calls.len(), 2);
    }

    #[test]
    fn test_continuous_mode_loops_until_cancelled() {
        let mut vna = MockVna::default();
        let mut sweep =
            SweepOrchestrator::new(&mut vna, plan(100, 200, 2, 3)).with_mode(SweepMode::Continuous);

        let first = sweep.run_once();
        assert_eq!(sweep.state(), SweepState::Acquiring { segment: 0 });
        let second = sweep.run_once();
        assert_eq!((first.pass, second.pass), (1, 2));
        assert_eq!(first.raw, second.raw);

        sweep.cancel_token().cancel();
        let last = sweep.run_once();
        assert!(last.cancelled);
        assert!(last.raw.is_empty());
        assert_eq!(sweep.state(), SweepState::Idle);
    }

    #[test]
    fn test_calibrated_pass() {
        let store = Arc::new(CalibrationStore::new());
        for (kind, value) in [
            (StandardKind::Short, -1.0),
            (StandardKind::Open, 1.0),
            (StandardKind::Load, 0.0),
        ] {
            store.replace_standard(CalibrationStandard::constant(
                kind,
                0,
                Complex64::new(value, 0.0),
            ));
        }

        let mut vna = MockVna::default();
        let mut sweep = SweepOrchestrator::new(&mut vna, plan(1_000, 2_000, 1, 11))
            .with_calibration(Arc::clone(&store), CorrectionOptions::default());
        let outcome = sweep.run_once();

        let corrected = outcome.corrected.as_ref().unwrap();
        assert!(corrected.uncorrected.is_empty());
        for (raw, cor) in outcome.raw.iter().zip(outcome.dataset().iter()) {
            assert_relative_eq!(raw.s11.re, cor.s11.re, epsilon = 1e-9);
            assert_relative_eq!(raw.s11.im, cor.s11.im, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_incomplete_calibration_reported() {
        let store = Arc::new(CalibrationStore::new());
        store.replace_standard(CalibrationStandard::constant(
            StandardKind::Short,
            0,
            Complex64::new(-1.0, 0.0),
        ));

        let mut vna = MockVna::default();
        let mut sweep = SweepOrchestrator::new(&mut vna, plan(1_000, 2_000, 1, 11))
            .with_calibration(store, CorrectionOptions::default());
        let outcome = sweep.run_once();

        assert!(outcome.corrected.is_none());
        assert_eq!(outcome.failures, vec![VnaError::MissingStandard("open".into())]);
        assert_eq!(outcome.dataset().len(), 11);
    }

    #[test]
    fn test_events_published() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut vna = MockVna::default();
        let mut sweep =
            SweepOrchestrator::new(&mut vna, plan(100, 200, 2, 3)).with_events(tx);
        sweep.run_once();
        drop(sweep);

        let events: Vec<SweepEvent> = rx.try_iter().collect();
        let done = events
            .iter()
            .filter(|e| matches!(e, SweepEvent::SegmentDone { .. }))
            .count();
        assert_eq!(done, 2);
        let last_progress = events.iter().rev().find_map(|e| match e {
            SweepEvent::Progress { percent } => Some(*percent),
            _ => None,
        });
        assert_eq!(last_progress, Some(100.0));
    }
}
