//! SOL(T) error correction
//!
//! Port 1 is solved as a 3-term error box (directivity `e00`, source match
//! `e11`, and `delta_e = e00*e11 - e10e01`) from short, open and load. When a
//! thru is available the forward path adds isolation `e30`, load match
//! `e22` and transmission tracking `e10e32`.
//!
//! Error terms are solved on the calibration grid and interpolated onto the
//! frequencies of every corrected measurement.

use std::collections::BTreeSet;
use std::sync::Arc;

use nalgebra::{Matrix3, Vector3};
use ndarray::Array1;
use num_complex::Complex64;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::standards::{CalibrationStandard, StandardKind};
use super::store::{intersect_coverage, CalibrationSet, CalibrationStore};
use crate::constants::{NEAR_ZERO, SINGULAR_TOL};
use crate::dataset::{Datapoint, Dataset};
use crate::error::{Result, VnaError};
use crate::frequency::FrequencyRange;
use crate::interpolation::ComplexSpline;

/// Options applied when building and applying a correction model
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CorrectionOptions {
    /// Use the thru alone when no through-reflect was measured
    #[serde(default)]
    pub enhanced_response: bool,
    /// Port extension delay in seconds, applied after correction
    #[serde(default)]
    pub offset_delay: f64,
}

/// Error model resolved from the available standards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionKind {
    /// Reflection only; S21 passes through raw
    OnePort,
    /// Thru without through-reflect, load match assumed zero
    EnhancedResponse,
    /// Forward path with load match from the through-reflect
    TwoPort,
}

impl CorrectionKind {
    fn corrects_transmission(&self) -> bool {
        !matches!(self, CorrectionKind::OnePort)
    }
}

/// Forward transmission error terms
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionTerms {
    /// Isolation
    pub e30: Array1<Complex64>,
    /// Load match
    pub e22: Array1<Complex64>,
    /// Transmission tracking
    pub e10e32: Array1<Complex64>,
}

/// Error terms on the calibration grid
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorTerms {
    pub frequencies: Vec<u64>,
    /// Directivity
    pub e00: Array1<Complex64>,
    /// Source match
    pub e11: Array1<Complex64>,
    pub delta_e: Array1<Complex64>,
    pub transmission: Option<TransmissionTerms>,
}

impl ErrorTerms {
    /// Reflection tracking
    pub fn e10e01(&self) -> Array1<Complex64> {
        &self.e00 * &self.e11 - &self.delta_e
    }
}

/// Error terms at a single frequency
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointTerms {
    pub e00: Complex64,
    pub e11: Complex64,
    pub delta_e: Complex64,
    /// `(e30, e22, e10e32)`
    pub transmission: Option<(Complex64, Complex64, Complex64)>,
}

impl PointTerms {
    #[inline]
    pub fn e10e01(&self) -> Complex64 {
        self.e00 * self.e11 - self.delta_e
    }

    /// Actual reflection from a measured one
    #[inline]
    pub fn correct_reflection(&self, m11: Complex64) -> Complex64 {
        (m11 - self.e00) / (m11 * self.e11 - self.delta_e)
    }

    /// Actual transmission, `None` for one-port terms
    #[inline]
    pub fn correct_transmission(&self, m11: Complex64, m21: Complex64) -> Option<Complex64> {
        let (e30, _, e10e32) = self.transmission?;
        Some((m21 - e30) / e10e32 * self.e10e01() / (self.e11 * m11 - self.delta_e))
    }

    pub fn correct(&self, dp: &Datapoint) -> Datapoint {
        let s21 = match self.transmission {
            Some(_) => dp.s21.and_then(|m21| self.correct_transmission(dp.s11, m21)),
            None => dp.s21,
        };
        Datapoint::new(dp.freq, self.correct_reflection(dp.s11), s21)
    }
}

#[derive(Debug, Clone)]
struct TermSplines {
    e00: ComplexSpline,
    e11: ComplexSpline,
    delta_e: ComplexSpline,
    transmission: Option<[ComplexSpline; 3]>,
}

impl TermSplines {
    fn new(terms: &ErrorTerms) -> Result<Self> {
        let f = &terms.frequencies;
        Ok(Self {
            e00: term_spline("e00", f, &terms.e00)?,
            e11: term_spline("e11", f, &terms.e11)?,
            delta_e: term_spline("delta_e", f, &terms.delta_e)?,
            transmission: match &terms.transmission {
                Some(t) => Some([
                    term_spline("e30", f, &t.e30)?,
                    term_spline("e22", f, &t.e22)?,
                    term_spline("e10e32", f, &t.e10e32)?,
                ]),
                None => None,
            },
        })
    }

    fn eval(&self, freq: u64) -> Result<PointTerms> {
        let transmission = match &self.transmission {
            Some([e30, e22, e10e32]) => {
                Some((e30.eval(freq)?, e22.eval(freq)?, e10e32.eval(freq)?))
            }
            None => None,
        };
        Ok(PointTerms {
            e00: self.e00.eval(freq)?,
            e11: self.e11.eval(freq)?,
            delta_e: self.delta_e.eval(freq)?,
            transmission,
        })
    }
}

/// A single grid point is broadcast as a constant
fn term_spline(label: &str, freqs: &[u64], values: &Array1<Complex64>) -> Result<ComplexSpline> {
    if freqs.len() == 1 {
        return Ok(ComplexSpline::constant(label, values[0]));
    }
    let points: Vec<(u64, Complex64)> = freqs.iter().copied().zip(values.iter().copied()).collect();
    ComplexSpline::new(label, &points)
}

/// Measurements after correction
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedDataset {
    pub dataset: Dataset,
    /// Frequencies outside the valid range, passed through raw
    pub uncorrected: Vec<u64>,
    pub valid_range: FrequencyRange,
}

/// Solved error model, immutable once built
#[derive(Debug, Clone)]
pub struct CorrectionModel {
    kind: CorrectionKind,
    options: CorrectionOptions,
    valid_range: FrequencyRange,
    terms: ErrorTerms,
    splines: TermSplines,
}

impl CorrectionModel {
    /// Solve the error terms of a calibration set.
    ///
    /// # Errors
    /// * `MissingStandard` when short, open or load is absent
    /// * `InsufficientData` when a standard has a single unflagged point or
    ///   the standards share no frequencies
    /// * `SingularCalibration` at the first degenerate grid frequency
    pub fn build(set: &CalibrationSet, options: CorrectionOptions) -> Result<Self> {
        for kind in [StandardKind::Short, StandardKind::Open, StandardKind::Load] {
            if !set.has(kind) {
                return Err(VnaError::MissingStandard(kind.name().to_string()));
            }
        }

        let kind = if set.is_valid_two_port() {
            CorrectionKind::TwoPort
        } else if set.has(StandardKind::Through) && options.enhanced_response {
            CorrectionKind::EnhancedResponse
        } else {
            CorrectionKind::OnePort
        };

        let mut used = vec![StandardKind::Short, StandardKind::Open, StandardKind::Load];
        match kind {
            CorrectionKind::OnePort => {}
            CorrectionKind::EnhancedResponse => used.push(StandardKind::Through),
            CorrectionKind::TwoPort => {
                used.extend([StandardKind::Through, StandardKind::ThroughReflect])
            }
        }
        if kind.corrects_transmission() && set.has(StandardKind::Isolation) {
            used.push(StandardKind::Isolation);
        }
        let standards: Vec<&CalibrationStandard> =
            used.iter().filter_map(|&k| set.standard(k)).collect();

        let range = intersect_coverage(standards.iter().copied()).ok_or_else(|| {
            VnaError::InsufficientData {
                label: "calibration overlap".into(),
                points: 0,
            }
        })?;

        let all_constant = standards.iter().all(|s| s.is_constant());
        let grid: Vec<u64> = if all_constant {
            // Terms are solved once and broadcast
            standards
                .iter()
                .flat_map(|s| s.frequencies())
                .min()
                .into_iter()
                .collect()
        } else {
            standards
                .iter()
                .filter(|s| !s.is_constant())
                .flat_map(|s| s.frequencies())
                .filter(|&f| range.contains(f))
                .collect::<BTreeSet<u64>>()
                .into_iter()
                .collect()
        };

        let sampled = Sampled::new(set, &standards, kind)?;
        let terms = solve(&grid, &sampled)?;
        let splines = TermSplines::new(&terms)?;

        info!(
            kind = ?kind,
            points = grid.len(),
            min = range.min,
            max = range.max,
            "Correction model built"
        );

        Ok(Self {
            kind,
            options,
            valid_range: range,
            terms,
            splines,
        })
    }

    #[inline]
    pub fn kind(&self) -> CorrectionKind {
        self.kind
    }

    #[inline]
    pub fn options(&self) -> CorrectionOptions {
        self.options
    }

    /// Span over which measurements are corrected
    #[inline]
    pub fn valid_range(&self) -> FrequencyRange {
        self.valid_range
    }

    #[inline]
    pub fn terms(&self) -> &ErrorTerms {
        &self.terms
    }

    /// Error terms interpolated at `freq`
    pub fn terms_at(&self, freq: u64) -> Result<PointTerms> {
        if !self.valid_range.contains(freq) {
            return Err(VnaError::FrequencyOutOfRange {
                label: "correction".into(),
                frequency: freq,
                min: self.valid_range.min,
                max: self.valid_range.max,
            });
        }
        self.splines.eval(freq)
    }

    /// Correct a measured dataset.
    ///
    /// Points outside the valid range, and points whose correction is not
    /// finite, are kept raw and listed in `uncorrected`. The offset delay is
    /// applied to every point afterwards.
    pub fn apply(&self, measured: Dataset) -> Result<CorrectedDataset> {
        let incomplete = measured.is_incomplete();
        let mut uncorrected = Vec::new();
        let mut non_finite = 0usize;
        let mut out = Dataset::new();

        for dp in measured.into_points() {
            if !self.valid_range.contains(dp.freq) {
                uncorrected.push(dp.freq);
                out.insert(dp);
                continue;
            }
            let corrected = self.splines.eval(dp.freq)?.correct(&dp);
            if corrected.is_finite() {
                out.insert(corrected);
            } else {
                non_finite += 1;
                uncorrected.push(dp.freq);
                out.insert(dp);
            }
        }
        if incomplete {
            out.mark_incomplete();
        }
        if non_finite > 0 {
            warn!(count = non_finite, "Correction not finite, points left raw");
        }
        if uncorrected.len() > non_finite {
            warn!(
                count = uncorrected.len() - non_finite,
                min = self.valid_range.min,
                max = self.valid_range.max,
                "Points outside calibration range left uncorrected"
            );
        }

        Ok(CorrectedDataset {
            dataset: out.with_delay(self.options.offset_delay),
            uncorrected,
            valid_range: self.valid_range,
        })
    }
}

/// Interpolators for every standard a model uses
struct Sampled<'a> {
    set: &'a CalibrationSet,
    short: ComplexSpline,
    open: ComplexSpline,
    load: ComplexSpline,
    through: Option<ComplexSpline>,
    through_reflect: Option<ComplexSpline>,
    isolation: Option<ComplexSpline>,
    kind: CorrectionKind,
}

impl<'a> Sampled<'a> {
    fn new(
        set: &'a CalibrationSet,
        standards: &[&CalibrationStandard],
        kind: CorrectionKind,
    ) -> Result<Self> {
        let find = |k: StandardKind| -> Result<Option<ComplexSpline>> {
            standards
                .iter()
                .find(|s| s.kind() == k)
                .map(|s| s.interpolator())
                .transpose()
        };
        let require = |k: StandardKind| -> Result<ComplexSpline> {
            find(k)?.ok_or_else(|| VnaError::MissingStandard(k.name().to_string()))
        };

        Ok(Self {
            set,
            short: require(StandardKind::Short)?,
            open: require(StandardKind::Open)?,
            load: require(StandardKind::Load)?,
            through: find(StandardKind::Through)?,
            through_reflect: find(StandardKind::ThroughReflect)?,
            isolation: find(StandardKind::Isolation)?,
            kind,
        })
    }

    fn ideal(&self, kind: StandardKind, freq: u64) -> Result<Complex64> {
        self.set
            .model(kind)
            .map(|m| m.gamma(freq))
            .ok_or_else(|| VnaError::MissingStandard(kind.name().to_string()))
    }
}

fn solve(grid: &[u64], sampled: &Sampled<'_>) -> Result<ErrorTerms> {
    let n = grid.len();
    let mut e00 = Array1::<Complex64>::zeros(n);
    let mut e11 = Array1::<Complex64>::zeros(n);
    let mut delta_e = Array1::<Complex64>::zeros(n);
    let transmission = sampled.kind.corrects_transmission();
    let mut e30 = Array1::<Complex64>::zeros(n);
    let mut e22 = Array1::<Complex64>::zeros(n);
    let mut e10e32 = Array1::<Complex64>::zeros(n);

    for (i, &freq) in grid.iter().enumerate() {
        let measured = [
            sampled.short.eval(freq)?,
            sampled.open.eval(freq)?,
            sampled.load.eval(freq)?,
        ];
        let actual = [
            sampled.ideal(StandardKind::Short, freq)?,
            sampled.ideal(StandardKind::Open, freq)?,
            sampled.ideal(StandardKind::Load, freq)?,
        ];
        let (d, s, de) = solve_one_port(freq, measured, actual)?;
        e00[i] = d;
        e11[i] = s;
        delta_e[i] = de;

        if transmission {
            let (iso, load_match, tracking) = solve_forward(freq, sampled, d, s, de)?;
            e30[i] = iso;
            e22[i] = load_match;
            e10e32[i] = tracking;
        }
    }
    debug!(points = n, transmission, "Error terms solved");

    Ok(ErrorTerms {
        frequencies: grid.to_vec(),
        e00,
        e11,
        delta_e,
        transmission: transmission.then_some(TransmissionTerms { e30, e22, e10e32 }),
    })
}

/// Solve `gm = e00 + ga*gm*e11 - ga*delta_e` for three standards.
///
/// Returns `(e00, e11, delta_e)` by Cramer's rule.
fn solve_one_port(
    freq: u64,
    measured: [Complex64; 3],
    actual: [Complex64; 3],
) -> Result<(Complex64, Complex64, Complex64)> {
    let one = Complex64::new(1.0, 0.0);
    let row = |k: usize| [one, actual[k] * measured[k], -actual[k]];
    let (r0, r1, r2) = (row(0), row(1), row(2));

    let a = Matrix3::new(
        r0[0], r0[1], r0[2], //
        r1[0], r1[1], r1[2], //
        r2[0], r2[1], r2[2],
    );
    let b = Vector3::new(measured[0], measured[1], measured[2]);

    let det = a.determinant();
    if !det.is_finite() || det.norm() < SINGULAR_TOL {
        return Err(VnaError::SingularCalibration { frequency: freq });
    }

    let mut x = [Complex64::new(0.0, 0.0); 3];
    for (col, value) in x.iter_mut().enumerate() {
        let mut ai = a;
        ai.set_column(col, &b);
        *value = ai.determinant() / det;
    }
    if !x.iter().all(|v| v.is_finite()) {
        return Err(VnaError::SingularCalibration { frequency: freq });
    }
    Ok((x[0], x[1], x[2]))
}

/// Returns `(e30, e22, e10e32)` at `freq`
fn solve_forward(
    freq: u64,
    sampled: &Sampled<'_>,
    e00: Complex64,
    e11: Complex64,
    delta_e: Complex64,
) -> Result<(Complex64, Complex64, Complex64)> {
    let through = sampled
        .through
        .as_ref()
        .ok_or_else(|| VnaError::MissingStandard(StandardKind::Through.name().to_string()))?
        .eval(freq)?;
    let isolation = match &sampled.isolation {
        Some(spline) => spline.eval(freq)?,
        None => Complex64::new(0.0, 0.0),
    };
    let gt = sampled.ideal(StandardKind::Through, freq)?;
    if gt.norm() < NEAR_ZERO {
        return Err(VnaError::SingularCalibration { frequency: freq });
    }
    let gt2 = gt * gt;
    let e10e01 = e00 * e11 - delta_e;

    let e22 = match (&sampled.kind, &sampled.through_reflect) {
        (CorrectionKind::TwoPort, Some(thrurefl)) => {
            let g = thrurefl.eval(freq)? - e00;
            let den = g * e11 * gt2 + e10e01 * gt2;
            if den.norm() < SINGULAR_TOL {
                return Err(VnaError::SingularCalibration { frequency: freq });
            }
            g / den
        }
        _ => Complex64::new(0.0, 0.0),
    };

    let e10e32 = (through - isolation) * (Complex64::new(1.0, 0.0) - e11 * e22 * gt2) / gt;
    let finite = isolation.is_finite() && e22.is_finite() && e10e32.is_finite();
    if !finite || e10e32.norm() < SINGULAR_TOL {
        return Err(VnaError::SingularCalibration { frequency: freq });
    }
    Ok((isolation, e22, e10e32))
}

/// Correction model rebuilt lazily when the calibration store changes
#[derive(Debug, Default)]
pub struct CorrectionCache {
    options: CorrectionOptions,
    cached: Mutex<Option<(u64, Arc<CorrectionModel>)>>,
}

impl CorrectionCache {
    pub fn new(options: CorrectionOptions) -> Self {
        Self {
            options,
            cached: Mutex::new(None),
        }
    }

    #[inline]
    pub fn options(&self) -> CorrectionOptions {
        self.options
    }

    /// Model for the current store version, rebuilt only on change
    pub fn model(&self, store: &CalibrationStore) -> Result<Arc<CorrectionModel>> {
        let mut cached = self.cached.lock();
        if let Some((version, model)) = cached.as_ref() {
            if *version == store.version() {
                return Ok(Arc::clone(model));
            }
        }

        let snapshot = store.snapshot();
        debug!(version = snapshot.version, "Rebuilding correction model");
        let model = Arc::new(CorrectionModel::build(&snapshot.set, self.options)?);
        *cached = Some((snapshot.version, Arc::clone(&model)));
        Ok(model)
    }

    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}
