//! Frequency-domain interpolation of calibration and reference data
//!
//! Complex values are interpolated as two independent real-valued
//! monotonic cubic Hermite splines (Fritsch-Carlson PCHIP), one for the real
//! part and one for the imaginary part. A PCHIP never overshoots between
//! samples, which keeps interpolated reflection coefficients physical.
//!
//! Interpolation never extrapolates: a request outside the measured span
//! fails with `FrequencyOutOfRange`.

use num_complex::Complex64;

use crate::dataset::{Datapoint, Dataset};
use crate::error::{Result, VnaError};
use crate::frequency::FrequencyRange;

#[derive(Debug, Clone, PartialEq)]
enum Shape {
    /// A single value broadcast at every frequency
    Constant,
    /// Derivatives at each knot for the real and imaginary splines
    Pchip { d_re: Vec<f64>, d_im: Vec<f64> },
}

/// Interpolator over sampled complex data
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexSpline {
    label: String,
    freqs: Vec<u64>,
    values: Vec<Complex64>,
    shape: Shape,
}

impl ComplexSpline {
    /// Build a spline from `(frequency, value)` pairs sorted by frequency.
    ///
    /// # Arguments
    /// * `label` - Name reported in errors (standard or trace name)
    /// * `points` - Strictly increasing frequencies with their values
    ///
    /// Fails with `InsufficientData` for fewer than two points.
    pub fn new(label: impl Into<String>, points: &[(u64, Complex64)]) -> Result<Self> {
        let label = label.into();
        if points.len() < 2 {
            return Err(VnaError::InsufficientData {
                label,
                points: points.len(),
            });
        }
        debug_assert!(points.windows(2).all(|w| w[0].0 < w[1].0));

        let freqs: Vec<u64> = points.iter().map(|p| p.0).collect();
        let values: Vec<Complex64> = points.iter().map(|p| p.1).collect();
        let x = relative_axis(&freqs);
        let re: Vec<f64> = values.iter().map(|v| v.re).collect();
        let im: Vec<f64> = values.iter().map(|v| v.im).collect();

        Ok(Self {
            label,
            shape: Shape::Pchip {
                d_re: pchip_slopes(&x, &re),
                d_im: pchip_slopes(&x, &im),
            },
            freqs,
            values,
        })
    }

    /// A spline that returns `value` at every frequency
    pub fn constant(label: impl Into<String>, value: Complex64) -> Self {
        Self {
            label: label.into(),
            freqs: Vec::new(),
            values: vec![value],
            shape: Shape::Constant,
        }
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Measured span, unbounded for constant splines
    pub fn range(&self) -> FrequencyRange {
        match self.shape {
            Shape::Constant => FrequencyRange::unbounded(),
            Shape::Pchip { .. } => {
                FrequencyRange::new(self.freqs[0], self.freqs[self.freqs.len() - 1])
            }
        }
    }

    /// Evaluate at `freq` Hz.
    ///
    /// A measured frequency returns its stored value unmodified.
    pub fn eval(&self, freq: u64) -> Result<Complex64> {
        let (d_re, d_im) = match &self.shape {
            Shape::Constant => return Ok(self.values[0]),
            Shape::Pchip { d_re, d_im } => (d_re, d_im),
        };

        let n = self.freqs.len();
        let (min, max) = (self.freqs[0], self.freqs[n - 1]);
        if freq < min || freq > max {
            return Err(VnaError::FrequencyOutOfRange {
                label: self.label.clone(),
                frequency: freq,
                min,
                max,
            });
        }

        // Binary search for interval
        let idx = match self.freqs.binary_search(&freq) {
            Ok(i) => return Ok(self.values[i]),
            Err(i) => i - 1,
        };

        let h = (self.freqs[idx + 1] - self.freqs[idx]) as f64;
        let t = (freq - self.freqs[idx]) as f64 / h;
        let (y0, y1) = (self.values[idx], self.values[idx + 1]);

        Ok(Complex64::new(
            hermite(t, h, y0.re, y1.re, d_re[idx], d_re[idx + 1]),
            hermite(t, h, y0.im, y1.im, d_im[idx], d_im[idx + 1]),
        ))
    }
}

/// Frequencies as offsets from the first point, for better conditioning
fn relative_axis(freqs: &[u64]) -> Vec<f64> {
    freqs.iter().map(|&f| (f - freqs[0]) as f64).collect()
}

/// Cubic Hermite segment evaluated at normalized position `t` in [0, 1]
#[inline]
fn hermite(t: f64, h: f64, y0: f64, y1: f64, d0: f64, d1: f64) -> f64 {
    let t2 = t * t;
    let t3 = t2 * t;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + t;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;
    h00 * y0 + h10 * h * d0 + h01 * y1 + h11 * h * d1
}

/// Knot derivatives of a shape-preserving (Fritsch-Carlson) cubic.
fn pchip_slopes(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = x.len();
    let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
    let delta: Vec<f64> = (0..n - 1).map(|k| (y[k + 1] - y[k]) / h[k]).collect();

    if n == 2 {
        return vec![delta[0], delta[0]];
    }

    let mut d = vec![0.0; n];
    for k in 1..n - 1 {
        if delta[k - 1] * delta[k] <= 0.0 {
            // Local extremum: flat tangent keeps the curve monotone
            d[k] = 0.0;
        } else {
            let w1 = 2.0 * h[k] + h[k - 1];
            let w2 = h[k] + 2.0 * h[k - 1];
            d[k] = (w1 + w2) / (w1 / delta[k - 1] + w2 / delta[k]);
        }
    }

    d[0] = end_slope(h[0], h[1], delta[0], delta[1]);
    d[n - 1] = end_slope(h[n - 2], h[n - 3], delta[n - 2], delta[n - 3]);
    d
}

/// One-sided three-point end derivative, clamped to preserve shape
fn end_slope(h0: f64, h1: f64, del0: f64, del1: f64) -> f64 {
    let d = ((2.0 * h0 + h1) * del0 - h0 * del1) / (h0 + h1);
    if d.signum() != del0.signum() || del0 == 0.0 {
        0.0
    } else if del0.signum() != del1.signum() && d.abs() > 3.0 * del0.abs() {
        3.0 * del0
    } else {
        d
    }
}

/// Resample an external trace onto a target frequency grid.
///
/// S11 is always resampled; S21 only when every source point carries one.
/// Every target must lie within the trace's span.
pub fn resample(dataset: &Dataset, targets: &[u64]) -> Result<Dataset> {
    let s11: Vec<(u64, Complex64)> = dataset.iter().map(|p| (p.freq, p.s11)).collect();
    let s11 = ComplexSpline::new("s11", &s11)?;
    let s21 = match dataset.s21() {
        Some(values) => {
            let points: Vec<(u64, Complex64)> = dataset
                .frequencies()
                .into_iter()
                .zip(values.iter().copied())
                .collect();
            Some(ComplexSpline::new("s21", &points)?)
        }
        None => None,
    };

    let mut out = Dataset::new();
    for &freq in targets {
        let s21_value = s21.as_ref().map(|spline| spline.eval(freq)).transpose()?;
        out.insert(Datapoint::new(freq, s11.eval(freq)?, s21_value));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn points(values: &[(u64, f64)]) -> Vec<(u64, Complex64)> {
        values
            .iter()
            .map(|&(f, v)| (f, Complex64::new(v, -v)))
            .collect()
    }

    #[test]
    fn test_exact_knots_identity() {
        let pts = points(&[(100, 0.1), (250, 0.7), (300, -0.2), (1000, 0.4)]);
        let spline = ComplexSpline::new("short", &pts).unwrap();

        for &(f, v) in &pts {
            assert_eq!(spline.eval(f).unwrap(), v);
        }
    }

    #[test]
    fn test_two_points_linear() {
        let spline = ComplexSpline::new("load", &points(&[(0, 0.0), (100, 1.0)])).unwrap();
        let v = spline.eval(25).unwrap();
        assert_relative_eq!(v.re, 0.25, epsilon = 1e-12);
        assert_relative_eq!(v.im, -0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_monotone_data_stays_monotone() {
        let pts = points(&[(0, 0.0), (10, 0.1), (20, 0.9), (30, 1.0), (40, 1.0)]);
        let spline = ComplexSpline::new("open", &pts).unwrap();

        let mut prev = f64::NEG_INFINITY;
        for f in 0..=40 {
            let v = spline.eval(f).unwrap().re;
            assert!(v >= prev - 1e-12, "not monotone at {f}");
            assert!(v <= 1.0 + 1e-12, "overshoot at {f}");
            prev = v;
        }
    }

    #[test]
    fn test_out_of_range() {
        let spline = ComplexSpline::new("short", &points(&[(100, 0.0), (200, 1.0)])).unwrap();

        for f in [0, 99, 201] {
            assert!(matches!(
                spline.eval(f),
                Err(VnaError::FrequencyOutOfRange { frequency, min: 100, max: 200, .. })
                    if frequency == f
            ));
        }
    }

    #[test]
    fn test_insufficient_data() {
        assert!(matches!(
            ComplexSpline::new("open", &points(&[(100, 0.0)])),
            Err(VnaError::InsufficientData { points: 1, .. })
        ));
    }

    #[test]
    fn test_constant_broadcast() {
        let spline = ComplexSpline::constant("load", Complex64::new(0.01, 0.0));
        assert_eq!(spline.eval(0).unwrap(), Complex64::new(0.01, 0.0));
        assert_eq!(spline.eval(u64::MAX).unwrap(), Complex64::new(0.01, 0.0));
        assert_eq!(spline.range(), FrequencyRange::unbounded());
    }

    #[test]
    fn test_resample_trace() {
        let trace = Dataset::from_points(vec![
            Datapoint::new(100, Complex64::new(0.0, 0.0), Some(Complex64::new(1.0, 0.0))),
            Datapoint::new(200, Complex64::new(1.0, 0.0), Some(Complex64::new(0.0, 0.0))),
        ]);
        let out = resample(&trace, &[100, 150, 200]).unwrap();

        assert_eq!(out.frequencies(), vec![100, 150, 200]);
        assert_relative_eq!(out.get(150).unwrap().s11.re, 0.5, epsilon = 1e-12);
        assert_relative_eq!(out.get(150).unwrap().s21.unwrap().re, 0.5, epsilon = 1e-12);

        assert!(resample(&trace, &[250]).is_err());
    }
}
