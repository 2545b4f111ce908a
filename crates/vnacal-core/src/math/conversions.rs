//! Unit conversion functions
//!
//! Provides conversions between complex reflection coefficients and the
//! scalar quantities shown to users (dB, phase, VSWR, impedance).

use num_complex::Complex64;
use std::f64::consts::PI;

use crate::constants::NEAR_ZERO;

/// Convert complex number to dB (20*log10(|z|))
pub fn complex_2_db(z: Complex64) -> f64 {
    20.0 * z.norm().log10()
}

/// Convert complex number to phase in degrees
pub fn complex_2_degree(z: Complex64) -> f64 {
    z.arg() * 180.0 / PI
}

/// Convert dB to magnitude (10^(dB/20))
pub fn db_2_magnitude(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}

/// Voltage standing wave ratio from a reflection coefficient.
///
/// Returns `None` for total reflection (|Γ| >= 1).
pub fn gamma_2_vswr(gamma: Complex64) -> Option<f64> {
    let mag = gamma.norm();
    (mag < 1.0).then(|| (1.0 + mag) / (1.0 - mag))
}

/// Impedance seen through a reflection coefficient: Z = Z0 (1+Γ)/(1-Γ)
pub fn gamma_2_impedance(gamma: Complex64, z0: f64) -> Option<Complex64> {
    let den = Complex64::new(1.0, 0.0) - gamma;
    (den.norm() > NEAR_ZERO).then(|| (Complex64::new(1.0, 0.0) + gamma) / den * z0)
}

/// Reflection coefficient of an impedance: Γ = (Z-Z0)/(Z+Z0)
pub fn impedance_2_gamma(z: Complex64, z0: f64) -> Complex64 {
    (z - z0) / (z + z0)
}

/// Equivalent capacitance of a (negative) reactance at `freq` Hz
pub fn impedance_2_capacitance(z: Complex64, freq: f64) -> Option<f64> {
    (freq > 0.0 && z.im.abs() > NEAR_ZERO).then(|| -1.0 / (2.0 * PI * freq * z.im))
}

/// Equivalent inductance of a (positive) reactance at `freq` Hz
pub fn impedance_2_inductance(z: Complex64, freq: f64) -> Option<f64> {
    (freq > 0.0).then(|| z.im / (2.0 * PI * freq))
}
