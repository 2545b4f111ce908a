//! Calibration standards and their ideal-standard models
//!
//! A physical standard is never exactly a short, open, load or thru. Each
//! kind carries its own coefficient set describing the deviation, and a
//! single function turns that model into the frequency-dependent reflection
//! (or transmission) the standard actually presents. All-zero coefficients
//! reproduce the textbook values -1, +1, 0 and 1 through the same formulas.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::constants::Z0;
use crate::dataset::Dataset;
use crate::error::Result;
use crate::frequency::FrequencyRange;
use crate::interpolation::ComplexSpline;
use crate::math::{db_2_magnitude, impedance_2_gamma};

/// Measured standard kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StandardKind {
    Short,
    Open,
    Load,
    /// S21 measured with the thru connected
    Through,
    /// S11 measured with the thru connected
    #[serde(rename = "thrurefl")]
    ThroughReflect,
    /// S21 measured with both ports terminated
    Isolation,
}

impl StandardKind {
    pub const ALL: [StandardKind; 6] = [
        StandardKind::Short,
        StandardKind::Open,
        StandardKind::Load,
        StandardKind::Through,
        StandardKind::ThroughReflect,
        StandardKind::Isolation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StandardKind::Short => "short",
            StandardKind::Open => "open",
            StandardKind::Load => "load",
            StandardKind::Through => "through",
            StandardKind::ThroughReflect => "thrurefl",
            StandardKind::Isolation => "isolation",
        }
    }

    /// Kinds measured on S21 rather than S11
    pub fn is_transmission(&self) -> bool {
        matches!(self, StandardKind::Through | StandardKind::Isolation)
    }

    /// Parse from name (case-insensitive)
    pub fn from_name(s: &str) -> Option<Self> {
        let s = s.to_lowercase();
        Self::ALL.into_iter().find(|k| k.name() == s)
    }
}

impl fmt::Display for StandardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Deviation model of a physical standard.
///
/// Offset delays are one-way, in seconds. Polynomial coefficients are in SI
/// units with frequency in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StandardModel {
    /// Series inductance L(f) = L0 + L1 f + L2 f² + L3 f³
    Short { l: [f64; 4], offset_delay: f64 },
    /// Fringing capacitance C(f) = C0 + C1 f + C2 f² + C3 f³
    Open { c: [f64; 4], offset_delay: f64 },
    /// Resistance with parasitic shunt capacitance and series inductance
    Load {
        resistance: f64,
        inductance: f64,
        capacitance: f64,
        offset_delay: f64,
    },
    /// Insertion delay and flat insertion loss in dB
    Through { delay: f64, loss_db: f64 },
}

impl StandardModel {
    pub fn ideal_short() -> Self {
        StandardModel::Short {
            l: [0.0; 4],
            offset_delay: 0.0,
        }
    }

    pub fn ideal_open() -> Self {
        StandardModel::Open {
            c: [0.0; 4],
            offset_delay: 0.0,
        }
    }

    pub fn ideal_load() -> Self {
        StandardModel::Load {
            resistance: Z0,
            inductance: 0.0,
            capacitance: 0.0,
            offset_delay: 0.0,
        }
    }

    pub fn ideal_through() -> Self {
        StandardModel::Through {
            delay: 0.0,
            loss_db: 0.0,
        }
    }

    /// The ideal model for a kind, `None` for kinds without a model
    pub fn ideal(kind: StandardKind) -> Option<Self> {
        match kind {
            StandardKind::Short => Some(Self::ideal_short()),
            StandardKind::Open => Some(Self::ideal_open()),
            StandardKind::Load => Some(Self::ideal_load()),
            StandardKind::Through => Some(Self::ideal_through()),
            StandardKind::ThroughReflect | StandardKind::Isolation => None,
        }
    }

    /// Which standard this model describes
    pub fn kind(&self) -> StandardKind {
        match self {
            StandardModel::Short { .. } => StandardKind::Short,
            StandardModel::Open { .. } => StandardKind::Open,
            StandardModel::Load { .. } => StandardKind::Load,
            StandardModel::Through { .. } => StandardKind::Through,
        }
    }

    /// Actual reflection (or, for the thru, transmission) at `freq` Hz.
    ///
    /// Reference: arXiv:1606.02446, eqs. (18)-(21).
    pub fn gamma(&self, freq: u64) -> Complex64 {
        let f = freq as f64;
        let omega = 2.0 * PI * f;
        let one = Complex64::new(1.0, 0.0);
        // Round trip through the offset line
        let offset = |delay: f64| Complex64::from_polar(1.0, -4.0 * PI * f * delay);

        match *self {
            StandardModel::Short { l, offset_delay } => {
                let zs = Complex64::new(0.0, omega * polynomial(&l, f));
                impedance_2_gamma(zs, Z0) * offset(offset_delay)
            }
            StandardModel::Open { c, offset_delay } => {
                let y = Complex64::new(0.0, omega * polynomial(&c, f)) * Z0;
                (one - y) / (one + y) * offset(offset_delay)
            }
            StandardModel::Load {
                resistance,
                inductance,
                capacitance,
                offset_delay,
            } => {
                let mut zl = Complex64::new(resistance, 0.0);
                if capacitance > 0.0 {
                    zl = zl / Complex64::new(1.0, omega * resistance * capacitance);
                }
                if inductance > 0.0 {
                    zl += Complex64::new(0.0, omega * inductance);
                }
                impedance_2_gamma(zl, Z0) * offset(offset_delay)
            }
            StandardModel::Through { delay, loss_db } => {
                Complex64::from_polar(db_2_magnitude(-loss_db), -omega * delay)
            }
        }
    }
}

#[inline]
fn polynomial(coeffs: &[f64; 4], f: f64) -> f64 {
    coeffs[0] + f * (coeffs[1] + f * (coeffs[2] + f * coeffs[3]))
}

/// One measured standard: frequency → raw reading
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationStandard {
    kind: StandardKind,
    points: BTreeMap<u64, Complex64>,
    constant: bool,
}

impl CalibrationStandard {
    pub fn new(kind: StandardKind) -> Self {
        Self {
            kind,
            points: BTreeMap::new(),
            constant: false,
        }
    }

    /// Build from `(frequency, value)` pairs; later duplicates win
    pub fn from_points(
        kind: StandardKind,
        points: impl IntoIterator<Item = (u64, Complex64)>,
    ) -> Self {
        Self {
            kind,
            points: points.into_iter().collect(),
            constant: false,
        }
    }

    /// Standard captured by a calibration sweep.
    ///
    /// Transmission kinds take S21; points without S21 are skipped.
    pub fn from_dataset(kind: StandardKind, dataset: &Dataset) -> Self {
        let points = dataset.iter().filter_map(|dp| {
            let value = if kind.is_transmission() { dp.s21? } else { dp.s11 };
            Some((dp.freq, value))
        });
        Self::from_points(kind, points)
    }

    /// A single value valid at every frequency
    pub fn constant(kind: StandardKind, freq: u64, value: Complex64) -> Self {
        Self {
            kind,
            points: BTreeMap::from([(freq, value)]),
            constant: true,
        }
    }

    #[inline]
    pub fn kind(&self) -> StandardKind {
        self.kind
    }

    /// Whether a single-point standard is broadcast as a constant
    #[inline]
    pub fn is_constant(&self) -> bool {
        self.constant && self.points.len() == 1
    }

    pub fn insert(&mut self, freq: u64, value: Complex64) {
        self.points.insert(freq, value);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = (u64, Complex64)> + '_ {
        self.points.iter().map(|(&f, &v)| (f, v))
    }

    pub fn frequencies(&self) -> impl Iterator<Item = u64> + '_ {
        self.points.keys().copied()
    }

    /// Span of measured frequencies; unbounded for constant standards
    pub fn coverage(&self) -> Option<FrequencyRange> {
        if self.is_constant() {
            return Some(FrequencyRange::unbounded());
        }
        let min = *self.points.keys().next()?;
        let max = *self.points.keys().next_back()?;
        Some(FrequencyRange::new(min, max))
    }

    /// Interpolator over this standard's measured points
    pub fn interpolator(&self) -> Result<ComplexSpline> {
        if self.is_constant() {
            let value = self.points.values().next().copied().unwrap_or_default();
            return Ok(ComplexSpline::constant(self.kind.name(), value));
        }
        let points: Vec<(u64, Complex64)> = self.points().collect();
        ComplexSpline::new(self.kind.name(), &points)
    }

    /// Estimate of the raw reading at `freq`
    pub fn interpolate(&self, freq: u64) -> Result<Complex64> {
        if let Some(&value) = self.points.get(&freq) {
            if self.points.len() >= 2 || self.is_constant() {
                return Ok(value);
            }
        }
        self.interpolator()?.eval(freq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VnaError;
    use approx::assert_relative_eq;

    #[test]
    fn test_zero_coefficients_are_ideal() {
        for freq in [0, 1_000_000, 3_000_000_000] {
            let short = StandardModel::ideal_short().gamma(freq);
            let open = StandardModel::ideal_open().gamma(freq);
            let load = StandardModel::ideal_load().gamma(freq);
            let thru = StandardModel::ideal_through().gamma(freq);

            assert_relative_eq!(short.re, -1.0, epsilon = 1e-15);
            assert_relative_eq!(short.im, 0.0, epsilon = 1e-15);
            assert_relative_eq!(open.re, 1.0, epsilon = 1e-15);
            assert_relative_eq!(load.norm(), 0.0, epsilon = 1e-15);
            assert_relative_eq!(thru.re, 1.0, epsilon = 1e-15);
        }
    }

    #[test]
    fn test_open_capacitance_rotates_phase() {
        let open = StandardModel::Open {
            c: [50e-15, 0.0, 0.0, 0.0],
            offset_delay: 0.0,
        };
        let g = open.gamma(1_000_000_000);

        // Lossless: magnitude stays 1, phase goes negative
        assert_relative_eq!(g.norm(), 1.0, epsilon = 1e-12);
        assert!(g.im < 0.0);
        let expected = -2.0 * (2.0 * PI * 1e9 * 50e-15 * Z0).atan();
        assert_relative_eq!(g.arg(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_short_offset_delay() {
        let short = StandardModel::Short {
            l: [0.0; 4],
            offset_delay: 25e-12,
        };
        // Round trip of 50 ps at 5 GHz is a quarter turn
        let g = short.gamma(5_000_000_000);
        assert_relative_eq!(g.re, 0.0, epsilon = 1e-12);
        assert_relative_eq!(g.im, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_through_loss_and_delay() {
        let thru = StandardModel::Through {
            delay: 100e-12,
            loss_db: 6.0,
        };
        let g = thru.gamma(2_500_000_000);
        assert_relative_eq!(g.norm(), 10.0_f64.powf(-0.3), epsilon = 1e-12);
        assert_relative_eq!(g.arg(), -PI / 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_load_parasitics() {
        let load = StandardModel::Load {
            resistance: 50.0,
            inductance: 1e-9,
            capacitance: 0.0,
            offset_delay: 0.0,
        };
        let g = load.gamma(1_000_000_000);
        assert!(g.norm() > 0.0);
        assert!(g.im > 0.0);
    }

    #[test]
    fn test_from_dataset_picks_parameter() {
        use crate::dataset::Datapoint;

        let sweep = Dataset::from_points(vec![
            Datapoint::new(100, Complex64::new(0.1, 0.0), Some(Complex64::new(0.9, 0.0))),
            Datapoint::new(200, Complex64::new(0.2, 0.0), None),
        ]);

        let thrurefl = CalibrationStandard::from_dataset(StandardKind::ThroughReflect, &sweep);
        assert_eq!(thrurefl.len(), 2);

        let through = CalibrationStandard::from_dataset(StandardKind::Through, &sweep);
        assert_eq!(through.points().collect::<Vec<_>>(), vec![(100, Complex64::new(0.9, 0.0))]);
    }

    #[test]
    fn test_kind_names() {
        for kind in StandardKind::ALL {
            assert_eq!(StandardKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(StandardKind::from_name("THRUREFL"), Some(StandardKind::ThroughReflect));
        assert_eq!(StandardKind::from_name("match"), None);
    }

    #[test]
    fn test_standard_interpolation_contract() {
        let std = CalibrationStandard::from_points(
            StandardKind::Open,
            vec![
                (100, Complex64::new(0.9, 0.1)),
                (200, Complex64::new(0.8, 0.2)),
                (300, Complex64::new(0.7, 0.3)),
            ],
        );

        assert_eq!(std.interpolate(200).unwrap(), Complex64::new(0.8, 0.2));
        assert_eq!(std.coverage(), Some(FrequencyRange::new(100, 300)));
        assert!(matches!(
            std.interpolate(301),
            Err(VnaError::FrequencyOutOfRange { .. })
        ));
    }

    #[test]
    fn test_single_point_needs_constant_flag() {
        let single = CalibrationStandard::from_points(
            StandardKind::Load,
            vec![(100, Complex64::new(0.01, 0.0))],
        );
        assert!(matches!(
            single.interpolate(100),
            Err(VnaError::InsufficientData { points: 1, .. })
        ));

        let constant =
            CalibrationStandard::constant(StandardKind::Load, 100, Complex64::new(0.01, 0.0));
        assert_eq!(constant.interpolate(5_000).unwrap(), Complex64::new(0.01, 0.0));
        assert_eq!(constant.coverage(), Some(FrequencyRange::unbounded()));
    }
}
