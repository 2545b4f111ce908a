//! Raw sample store and averaging policy
//!
//! Readings are accumulated per frequency in arrival order. When more than
//! one reading per frequency is requested, they are combined with
//! geometric outlier rejection: the reading farthest from the centroid is
//! discarded before averaging.

use std::collections::BTreeMap;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dataset::{Datapoint, Dataset};
use crate::error::{Result, VnaError};

/// One uncorrected reading reported by the analyzer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub freq: u64,
    pub s11: Complex64,
    pub s21: Option<Complex64>,
}

impl Reading {
    pub fn new(freq: u64, s11: Complex64, s21: Option<Complex64>) -> Self {
        Self { freq, s11, s21 }
    }

    fn is_finite(&self) -> bool {
        Datapoint::new(self.freq, self.s11, self.s21).is_finite()
    }
}

/// How many readings are taken per frequency and how many outliers dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AveragingPolicy {
    /// Readings per frequency (1 disables averaging)
    pub averages: usize,
    /// Readings discarded as outliers when at least 3 are available
    pub discard: usize,
}

impl Default for AveragingPolicy {
    fn default() -> Self {
        Self {
            averages: 1,
            discard: 1,
        }
    }
}

impl AveragingPolicy {
    pub fn new(averages: usize) -> Self {
        Self {
            averages: averages.max(1),
            ..Self::default()
        }
    }

    /// Minimum readings needed before a frequency can be resolved
    #[inline]
    pub fn required_readings(&self) -> usize {
        self.averages.saturating_sub(1).max(1)
    }
}

/// Combine readings with geometric outlier rejection.
///
/// With three or more values, up to `discard` values farthest from the
/// centroid are removed (at least two always remain) and the rest averaged.
/// Returns `None` for an empty slice.
pub fn average_readings(values: &[Complex64], discard: usize) -> Option<Complex64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len();
    let centroid = mean(values);
    if n < 3 || discard == 0 {
        return Some(centroid);
    }

    let drop = discard.min(n - 2);
    let mut sorted: Vec<Complex64> = values.to_vec();
    sorted.sort_by(|a, b| {
        (a - centroid)
            .norm()
            .partial_cmp(&(b - centroid).norm())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Some(mean(&sorted[..n - drop]))
}

fn mean(values: &[Complex64]) -> Complex64 {
    values.iter().sum::<Complex64>() / values.len() as f64
}

#[derive(Debug, Default, Clone)]
struct Bucket {
    s11: Vec<Complex64>,
    s21: Vec<Complex64>,
}

/// Accumulates raw readings until a segment is complete
#[derive(Debug, Clone, Default)]
pub struct RawSampleStore {
    policy: AveragingPolicy,
    buckets: BTreeMap<u64, Bucket>,
    received: usize,
}

impl RawSampleStore {
    pub fn new(policy: AveragingPolicy) -> Self {
        Self {
            policy,
            buckets: BTreeMap::new(),
            received: 0,
        }
    }

    #[inline]
    pub fn policy(&self) -> AveragingPolicy {
        self.policy
    }

    /// Store a reading. Non-finite readings are dropped and `false` returned.
    pub fn push(&mut self, reading: Reading) -> bool {
        if !reading.is_finite() {
            warn!(frequency = reading.freq, "Discarding non-finite reading");
            return false;
        }
        let bucket = self.buckets.entry(reading.freq).or_default();
        bucket.s11.push(reading.s11);
        if let Some(s21) = reading.s21 {
            bucket.s21.push(s21);
        }
        self.received += 1;
        true
    }

    /// Total readings accepted since the last clear
    #[inline]
    pub fn received(&self) -> usize {
        self.received
    }

    /// Readings accepted at `freq`
    pub fn count(&self, freq: u64) -> usize {
        self.buckets.get(&freq).map_or(0, |b| b.s11.len())
    }

    /// Averaged datapoint at `freq`.
    ///
    /// Fails with `IncompleteAcquisition` when fewer than
    /// `max(1, averages - 1)` readings arrived.
    pub fn resolve(&self, freq: u64) -> Result<Datapoint> {
        let required = self.policy.required_readings();
        let bucket = self.buckets.get(&freq);
        let received = bucket.map_or(0, |b| b.s11.len());
        let incomplete = VnaError::IncompleteAcquisition {
            frequency: freq,
            received,
            required,
        };
        let Some(bucket) = bucket.filter(|_| received >= required) else {
            return Err(incomplete);
        };

        let s11 = average_readings(&bucket.s11, self.policy.discard).ok_or(incomplete)?;
        let s21 = if bucket.s21.len() >= required {
            average_readings(&bucket.s21, self.policy.discard)
        } else {
            None
        };
        Ok(Datapoint::new(freq, s11, s21))
    }

    /// Resolve and remove the readings of `frequencies`.
    ///
    /// Returns the resolved points and one `IncompleteAcquisition` per gap.
    /// Gaps are omitted from the dataset, which is then marked incomplete.
    pub fn drain_segment(&mut self, frequencies: &[u64]) -> (Dataset, Vec<VnaError>) {
        let mut dataset = Dataset::new();
        let mut gaps = Vec::new();

        for &freq in frequencies {
            match self.resolve(freq) {
                Ok(dp) => dataset.insert(dp),
                Err(err) => {
                    debug!(frequency = freq, %err, "Frequency left as gap");
                    gaps.push(err);
                }
            }
            if let Some(bucket) = self.buckets.remove(&freq) {
                self.received -= bucket.s11.len();
            }
        }
        if !gaps.is_empty() {
            dataset.mark_incomplete();
        }
        (dataset, gaps)
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.received = 0;
    }
}
