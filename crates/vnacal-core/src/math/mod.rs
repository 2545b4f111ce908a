//! Mathematical functions module
//!
//! Provides the RF conversions used by display and export consumers.

pub mod conversions;

pub use conversions::*;
