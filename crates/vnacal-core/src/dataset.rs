//! Dataset - ordered (frequency, S11, S21) measurements
//!
//! The unit passed between the sweep orchestrator, the error-correction
//! engine and external consumers. Frequencies are strictly increasing and
//! no sample is ever NaN or infinite: failed points are omitted and the
//! dataset is marked incomplete instead.

use std::f64::consts::PI;

use ndarray::Array1;
use num_complex::Complex64;
use tracing::warn;

use crate::constants::{SPEED_OF_LIGHT, Z0};
use crate::math::conversions::{
    complex_2_db, complex_2_degree, gamma_2_impedance, gamma_2_vswr, impedance_2_capacitance,
    impedance_2_inductance,
};

/// One frequency point of a sweep
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Datapoint {
    /// Frequency in Hz
    pub freq: u64,
    /// Reflection
    pub s11: Complex64,
    /// Transmission, when the analyzer reported it
    pub s21: Option<Complex64>,
}

impl Datapoint {
    pub fn new(freq: u64, s11: Complex64, s21: Option<Complex64>) -> Self {
        Self { freq, s11, s21 }
    }

    /// Whether every sample in the point is finite
    pub fn is_finite(&self) -> bool {
        is_finite(self.s11) && self.s21.map_or(true, is_finite)
    }

    /// Rotate the samples by an offset (port extension) delay in seconds.
    ///
    /// Reflection travels the offset twice, transmission once.
    pub fn with_delay(&self, delay: f64) -> Self {
        let rotate = |z: Complex64, mult: f64| {
            z * Complex64::from_polar(1.0, -2.0 * PI * self.freq as f64 * delay * mult)
        };
        Self {
            freq: self.freq,
            s11: rotate(self.s11, 2.0),
            s21: self.s21.map(|z| rotate(z, 1.0)),
        }
    }

    /// S11 magnitude in dB
    pub fn return_gain_db(&self) -> f64 {
        complex_2_db(self.s11)
    }

    /// S21 magnitude in dB
    pub fn transmission_gain_db(&self) -> Option<f64> {
        self.s21.map(complex_2_db)
    }

    /// S11 phase in degrees
    pub fn phase(&self) -> f64 {
        complex_2_degree(self.s11)
    }

    pub fn vswr(&self) -> Option<f64> {
        gamma_2_vswr(self.s11)
    }

    /// Free-space wavelength in metres
    pub fn wavelength(&self) -> Option<f64> {
        (self.freq > 0).then(|| SPEED_OF_LIGHT / self.freq as f64)
    }

    /// Input impedance derived from S11
    pub fn impedance(&self) -> Option<Complex64> {
        gamma_2_impedance(self.s11, Z0)
    }

    /// Impedance of a DUT in series between the ports, derived from S21
    pub fn series_impedance(&self) -> Option<Complex64> {
        let s21 = self.s21?;
        (s21.norm() > 0.0).then(|| (Complex64::new(1.0, 0.0) - s21) / s21 * (2.0 * Z0))
    }

    /// Impedance of a DUT shunted across the line, derived from S21
    pub fn shunt_impedance(&self) -> Option<Complex64> {
        let s21 = self.s21?;
        let den = Complex64::new(1.0, 0.0) - s21;
        (den.norm() > 0.0).then(|| s21 / den * (0.5 * Z0))
    }

    /// |X/R| of the input impedance
    pub fn q_factor(&self) -> Option<f64> {
        let z = self.impedance()?;
        (z.re != 0.0).then(|| (z.im / z.re).abs())
    }

    pub fn capacitive_equivalent(&self) -> Option<f64> {
        impedance_2_capacitance(self.impedance()?, self.freq as f64)
    }

    pub fn inductive_equivalent(&self) -> Option<f64> {
        impedance_2_inductance(self.impedance()?, self.freq as f64)
    }
}

#[inline]
fn is_finite(z: Complex64) -> bool {
    z.re.is_finite() && z.im.is_finite()
}

/// Ordered, deduplicated sweep data
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    points: Vec<Datapoint>,
    incomplete: bool,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from points in any order.
    ///
    /// Points are sorted by frequency; for duplicate frequencies the one
    /// appearing last wins. Non-finite points are omitted and mark the
    /// dataset incomplete.
    pub fn from_points(points: impl IntoIterator<Item = Datapoint>) -> Self {
        let mut dataset = Self::new();
        for dp in points {
            dataset.insert(dp);
        }
        dataset
    }

    /// Insert a point, replacing any point already stored at its frequency.
    pub fn insert(&mut self, dp: Datapoint) {
        if !dp.is_finite() {
            warn!(frequency = dp.freq, "Dropping non-finite datapoint");
            self.incomplete = true;
            return;
        }
        match self.points.binary_search_by_key(&dp.freq, |p| p.freq) {
            Ok(i) => self.points[i] = dp,
            Err(i) => self.points.insert(i, dp),
        }
    }

    /// Merge another dataset into this one; `other` wins on shared frequencies.
    pub fn merge(&mut self, other: Dataset) {
        self.incomplete |= other.incomplete;
        for dp in other.points {
            self.insert(dp);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[inline]
    pub fn points(&self) -> &[Datapoint] {
        &self.points
    }

    pub fn iter(&self) -> impl Iterator<Item = &Datapoint> {
        self.points.iter()
    }

    pub fn into_points(self) -> Vec<Datapoint> {
        self.points
    }

    /// Point stored at exactly `freq`
    pub fn get(&self, freq: u64) -> Option<&Datapoint> {
        self.points
            .binary_search_by_key(&freq, |p| p.freq)
            .ok()
            .map(|i| &self.points[i])
    }

    pub fn frequencies(&self) -> Vec<u64> {
        self.points.iter().map(|p| p.freq).collect()
    }

    pub fn min_freq(&self) -> Option<u64> {
        self.points.first().map(|p| p.freq)
    }

    pub fn max_freq(&self) -> Option<u64> {
        self.points.last().map(|p| p.freq)
    }

    /// S11 samples as an array
    pub fn s11(&self) -> Array1<Complex64> {
        self.points.iter().map(|p| p.s11).collect()
    }

    /// S21 samples, present only when every point carries one
    pub fn s21(&self) -> Option<Array1<Complex64>> {
        self.points.iter().map(|p| p.s21).collect::<Option<Vec<_>>>().map(Array1::from)
    }

    /// True when segments or frequencies are known to be missing
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn mark_incomplete(&mut self) {
        self.incomplete = true;
    }

    /// Apply an offset delay to every point
    pub fn with_delay(self, delay: f64) -> Self {
        if delay == 0.0 {
            return self;
        }
        Self {
            points: self.points.iter().map(|p| p.with_delay(delay)).collect(),
            incomplete: self.incomplete,
        }
    }
}

impl FromIterator<Datapoint> for Dataset {
    fn from_iter<I: IntoIterator<Item = Datapoint>>(iter: I) -> Self {
        Self::from_points(iter)
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a Datapoint;
    type IntoIter = std::slice::Iter<'a, Datapoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn dp(freq: u64, re: f64) -> Datapoint {
        Datapoint::new(freq, Complex64::new(re, 0.0), None)
    }

    #[test]
    fn test_insert_sorts_and_last_wins() {
        let ds = Dataset::from_points(vec![dp(30, 0.3), dp(10, 0.1), dp(20, 0.2), dp(10, 0.9)]);

        assert_eq!(ds.frequencies(), vec![10, 20, 30]);
        assert_relative_eq!(ds.get(10).unwrap().s11.re, 0.9);
        assert!(!ds.is_incomplete());
    }

    #[test]
    fn test_non_finite_points_are_omitted() {
        let ds = Dataset::from_points(vec![
            dp(10, 0.1),
            Datapoint::new(20, Complex64::new(f64::NAN, 0.0), None),
            Datapoint::new(30, Complex64::new(0.0, 0.0), Some(Complex64::new(f64::INFINITY, 0.0))),
        ]);

        assert_eq!(ds.len(), 1);
        assert!(ds.is_incomplete());
    }

    #[test]
    fn test_merge_overlapping() {
        let mut a = Dataset::from_points(vec![dp(10, 0.1), dp(20, 0.2)]);
        let b = Dataset::from_points(vec![dp(20, 0.5), dp(30, 0.3)]);
        a.merge(b);

        assert_eq!(a.frequencies(), vec![10, 20, 30]);
        assert_relative_eq!(a.get(20).unwrap().s11.re, 0.5);
    }

    #[test]
    fn test_s21_requires_all_points() {
        let ds = Dataset::from_points(vec![
            Datapoint::new(10, Complex64::new(0.0, 0.0), Some(Complex64::new(1.0, 0.0))),
            dp(20, 0.0),
        ]);
        assert!(ds.s21().is_none());
        assert_eq!(ds.s11().len(), 2);
    }

    #[test]
    fn test_delay_rotation() {
        // Quarter period of two-way delay at 1 MHz: 2 * 1e6 * 125ns = 0.25 turn
        let p = Datapoint::new(1_000_000, Complex64::new(1.0, 0.0), Some(Complex64::new(1.0, 0.0)));
        let d = p.with_delay(125e-9);

        assert_relative_eq!(d.s11.re, 0.0, epsilon = 1e-12);
        assert_relative_eq!(d.s11.im, -1.0, epsilon = 1e-12);
        let s21 = d.s21.unwrap();
        assert_relative_eq!(s21.re, (PI / 4.0).cos(), epsilon = 1e-12);
        assert_relative_eq!(s21.im, -(PI / 4.0).sin(), epsilon = 1e-12);
    }

    #[test]
    fn test_display_quantities() {
        let p = Datapoint::new(
            100_000_000,
            Complex64::new(0.5, 0.0),
            Some(Complex64::new(0.5, 0.0)),
        );

        assert_relative_eq!(p.vswr().unwrap(), 3.0, epsilon = 1e-12);
        assert_relative_eq!(p.impedance().unwrap().re, 150.0, epsilon = 1e-9);
        assert_relative_eq!(p.series_impedance().unwrap().re, 100.0, epsilon = 1e-9);
        assert_relative_eq!(p.shunt_impedance().unwrap().re, 25.0, epsilon = 1e-9);
        assert_relative_eq!(p.wavelength().unwrap(), 2.99792458, epsilon = 1e-9);
        assert_relative_eq!(p.q_factor().unwrap(), 0.0, epsilon = 1e-12);
    }
}
