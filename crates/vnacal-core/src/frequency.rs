//! Frequency plan - ordered sampling frequencies of a segmented sweep
//!
//! A sweep is split into segments, each acquired in one hardware request.
//! Adjacent segments share their boundary frequency, so a plan with `S`
//! segments of `P` points yields `S * P - (S - 1)` unique frequencies.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, VnaError};

/// Frequency unit enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrequencyUnit {
    #[serde(alias = "hz")]
    Hz,
    #[serde(alias = "khz", alias = "kHz")]
    KHz,
    #[default]
    #[serde(alias = "mhz")]
    MHz,
    #[serde(alias = "ghz")]
    GHz,
}

impl FrequencyUnit {
    /// Get the multiplier to convert to Hz
    pub fn multiplier(&self) -> f64 {
        match self {
            FrequencyUnit::Hz => 1.0,
            FrequencyUnit::KHz => 1e3,
            FrequencyUnit::MHz => 1e6,
            FrequencyUnit::GHz => 1e9,
        }
    }

    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hz" => Some(FrequencyUnit::Hz),
            "khz" => Some(FrequencyUnit::KHz),
            "mhz" => Some(FrequencyUnit::MHz),
            "ghz" => Some(FrequencyUnit::GHz),
            _ => None,
        }
    }

    /// Convert a value in this unit to whole Hz
    pub fn to_hz(&self, value: f64) -> u64 {
        (value * self.multiplier()).round().max(0.0) as u64
    }
}

/// Placement of segment boundaries across the span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Spacing {
    #[default]
    Linear,
    #[serde(alias = "log")]
    Logarithmic,
}

/// One contiguous block of frequencies acquired in a single request.
///
/// Points are linearly spaced between `start` and `stop` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    pub stop: u64,
    pub points: usize,
}

impl Segment {
    /// Nominal step between points in Hz
    #[inline]
    pub fn step(&self) -> f64 {
        (self.stop - self.start) as f64 / (self.points - 1) as f64
    }

    /// The `k`-th frequency of the segment, rounded to the nearest Hz
    #[inline]
    pub fn frequency(&self, k: usize) -> u64 {
        let width = (self.stop - self.start) as f64;
        self.start + (k as f64 * width / (self.points - 1) as f64).round() as u64
    }

    /// All frequencies of the segment in increasing order
    pub fn frequencies(&self) -> Vec<u64> {
        (0..self.points).map(|k| self.frequency(k)).collect()
    }

    #[inline]
    pub fn contains(&self, freq: u64) -> bool {
        freq >= self.start && freq <= self.stop
    }

    /// Snap a device-reported frequency to the nearest planned point.
    ///
    /// Returns `None` when the reported frequency is more than half a step
    /// away from every planned point.
    pub fn snap(&self, freq: u64) -> Option<u64> {
        let step = self.step();
        let k = ((freq as f64 - self.start as f64) / step).round();
        if k < 0.0 || k > (self.points - 1) as f64 {
            return None;
        }
        let planned = self.frequency(k as usize);
        if (planned as f64 - freq as f64).abs() <= step / 2.0 {
            Some(planned)
        } else {
            None
        }
    }
}

/// Inclusive frequency interval in Hz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyRange {
    pub min: u64,
    pub max: u64,
}

impl FrequencyRange {
    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    /// Range covering every representable frequency
    pub fn unbounded() -> Self {
        Self {
            min: 0,
            max: u64::MAX,
        }
    }

    #[inline]
    pub fn contains(&self, freq: u64) -> bool {
        freq >= self.min && freq <= self.max
    }

    /// Overlap of two ranges, `None` when disjoint
    pub fn intersect(&self, other: &FrequencyRange) -> Option<FrequencyRange> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        (min <= max).then_some(FrequencyRange { min, max })
    }
}

/// A validated, segmented sweep plan
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    start: u64,
    stop: u64,
    points_per_segment: usize,
    spacing: Spacing,
    segments: Vec<Segment>,
}

impl SweepPlan {
    /// Create a new plan
    ///
    /// # Arguments
    /// * `start` - Start frequency in Hz
    /// * `stop` - Stop frequency in Hz, must exceed `start`
    /// * `segments` - Number of segments (at least 1)
    /// * `points_per_segment` - Points per segment (at least 2)
    /// * `spacing` - Linear or logarithmic segment boundaries
    ///
    /// # Example
    /// ```
    /// use vnacal_core::frequency::{Spacing, SweepPlan};
    /// let plan = SweepPlan::new(1_000_000, 101_000_000, 2, 11, Spacing::Linear).unwrap();
    /// assert_eq!(plan.point_count(), 21);
    /// ```
    pub fn new(
        start: u64,
        stop: u64,
        segments: usize,
        points_per_segment: usize,
        spacing: Spacing,
    ) -> Result<Self> {
        let invalid = |reason: String| VnaError::InvalidRange {
            start,
            stop,
            reason,
        };

        if start >= stop {
            return Err(invalid("start must be below stop".into()));
        }
        if segments == 0 {
            return Err(invalid("at least one segment is required".into()));
        }
        if points_per_segment < 2 {
            return Err(invalid(format!(
                "{points_per_segment} points per segment, need at least 2"
            )));
        }

        let span = (stop - start) as f64;
        let boundaries: Vec<u64> = (0..=segments)
            .map(|i| {
                let fraction = match spacing {
                    Spacing::Linear => i as f64 / segments as f64,
                    Spacing::Logarithmic => log_fraction(i, segments),
                };
                start + (span * fraction).round() as u64
            })
            .collect();

        let mut planned = Vec::with_capacity(segments);
        for (index, pair) in boundaries.windows(2).enumerate() {
            let (seg_start, seg_stop) = (pair[0], pair[1]);
            // Every point needs its own integer frequency
            if seg_stop <= seg_start || seg_stop - seg_start < (points_per_segment - 1) as u64 {
                return Err(invalid(format!(
                    "segment {index} ({seg_start}..{seg_stop} Hz) cannot hold \
                     {points_per_segment} points with a step of at least 1 Hz"
                )));
            }
            planned.push(Segment {
                index,
                start: seg_start,
                stop: seg_stop,
                points: points_per_segment,
            });
        }

        debug!(
            start,
            stop,
            segments,
            points_per_segment,
            ?spacing,
            "Planned sweep"
        );

        Ok(Self {
            start,
            stop,
            points_per_segment,
            spacing,
            segments: planned,
        })
    }

    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    pub fn points_per_segment(&self) -> usize {
        self.points_per_segment
    }

    #[inline]
    pub fn spacing(&self) -> Spacing {
        self.spacing
    }

    /// Get the start frequency in Hz
    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Get the stop frequency in Hz
    #[inline]
    pub fn stop(&self) -> u64 {
        self.stop
    }

    /// Get the frequency span in Hz
    #[inline]
    pub fn span(&self) -> u64 {
        self.stop - self.start
    }

    /// Number of unique frequencies after merging shared boundaries
    #[inline]
    pub fn point_count(&self) -> usize {
        let s = self.segments.len();
        s * self.points_per_segment - (s - 1)
    }

    /// Nominal step of an equivalent single-segment linear sweep
    pub fn step(&self) -> f64 {
        self.span() as f64 / (self.point_count() - 1) as f64
    }

    /// Merged, strictly increasing frequencies of the whole plan
    pub fn frequencies(&self) -> Vec<u64> {
        let mut out: Vec<u64> = Vec::with_capacity(self.point_count());
        for segment in &self.segments {
            for f in segment.frequencies() {
                if out.last().map_or(true, |&last| f > last) {
                    out.push(f);
                }
            }
        }
        out
    }
}

/// Fraction of the span covered by the first `index` logarithmic segments.
///
/// Segment widths grow with the index; the fraction is 0 at index 0 and 1
/// at `segments`.
fn log_fraction(index: usize, segments: usize) -> f64 {
    let total = (segments as f64 + 1.0).ln();
    1.0 - (segments as f64 + 1.0 - index as f64).ln() / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_two_segments() {
        let plan = SweepPlan::new(1_000_000, 101_000_000, 2, 11, Spacing::Linear).unwrap();
        let f = plan.frequencies();

        assert_eq!(f.len(), 21);
        assert_eq!(f[0], 1_000_000);
        assert_eq!(f[20], 101_000_000);
        for w in f.windows(2) {
            assert_eq!(w[1] - w[0], 5_000_000);
        }
        assert_eq!(f.iter().filter(|&&x| x == 51_000_000).count(), 1);
        assert_relative_eq!(plan.step(), 5e6, epsilon = 1e-9);
    }

    #[test]
    fn test_log_segments_grow() {
        let plan = SweepPlan::new(1_000_000, 900_000_000, 4, 101, Spacing::Logarithmic).unwrap();
        let widths: Vec<u64> = plan.segments().iter().map(|s| s.stop - s.start).collect();

        assert_eq!(plan.segments()[0].start, 1_000_000);
        assert_eq!(plan.segments()[3].stop, 900_000_000);
        for w in widths.windows(2) {
            assert!(w[1] > w[0]);
        }
        assert_eq!(plan.frequencies().len(), plan.point_count());
    }

    #[test]
    fn test_single_segment_log_matches_linear() {
        let lin = SweepPlan::new(10, 1010, 1, 11, Spacing::Linear).unwrap();
        let log = SweepPlan::new(10, 1010, 1, 11, Spacing::Logarithmic).unwrap();
        assert_eq!(lin.frequencies(), log.frequencies());
    }

    #[test]
    fn test_invalid_ranges() {
        assert!(matches!(
            SweepPlan::new(100, 100, 1, 11, Spacing::Linear),
            Err(VnaError::InvalidRange { .. })
        ));
        assert!(matches!(
            SweepPlan::new(200, 100, 1, 11, Spacing::Linear),
            Err(VnaError::InvalidRange { .. })
        ));
        assert!(matches!(
            SweepPlan::new(100, 200, 0, 11, Spacing::Linear),
            Err(VnaError::InvalidRange { .. })
        ));
        assert!(matches!(
            SweepPlan::new(100, 200, 1, 1, Spacing::Linear),
            Err(VnaError::InvalidRange { .. })
        ));
        // 5 Hz span cannot hold 11 distinct points
        assert!(matches!(
            SweepPlan::new(100, 105, 1, 11, Spacing::Linear),
            Err(VnaError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_segment_snap() {
        let seg = Segment {
            index: 0,
            start: 1000,
            stop: 2000,
            points: 11,
        };
        assert_eq!(seg.snap(1101), Some(1100));
        assert_eq!(seg.snap(1000), Some(1000));
        assert_eq!(seg.snap(2051), None);
        assert_eq!(seg.snap(900), None);
    }

    #[test]
    fn test_range_intersection() {
        let a = FrequencyRange::new(10, 100);
        let b = FrequencyRange::new(50, 200);

        assert_eq!(a.intersect(&b), Some(FrequencyRange::new(50, 100)));
        assert_eq!(a.intersect(&FrequencyRange::new(101, 200)), None);
        assert_eq!(
            a.intersect(&FrequencyRange::unbounded()),
            Some(FrequencyRange::new(10, 100))
        );
        assert!(a.contains(100) && !a.contains(101));
    }

    #[test]
    fn test_frequency_unit_multiplier() {
        assert_eq!(FrequencyUnit::Hz.multiplier(), 1.0);
        assert_eq!(FrequencyUnit::KHz.multiplier(), 1e3);
        assert_eq!(FrequencyUnit::MHz.multiplier(), 1e6);
        assert_eq!(FrequencyUnit::GHz.multiplier(), 1e9);
        assert_eq!(FrequencyUnit::MHz.to_hz(1.5), 1_500_000);
    }

    #[test]
    fn test_frequency_unit_from_str() {
        assert_eq!(FrequencyUnit::from_str("ghz"), Some(FrequencyUnit::GHz));
        assert_eq!(FrequencyUnit::from_str("MHz"), Some(FrequencyUnit::MHz));
        assert_eq!(FrequencyUnit::from_str("invalid"), None);
    }
}
