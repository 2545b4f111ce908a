//! Layered configuration using Figment
//!
//! Values are resolved from:
//! 1. built-in defaults
//! 2. a TOML file (`vnacal.toml` by default)
//! 3. environment variables prefixed with `VNACAL_`, nested keys separated
//!    by a double underscore, e.g. `VNACAL_SWEEP__POINTS_PER_SEGMENT=51`

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};

use crate::calibration::CorrectionOptions;
use crate::constants::{DEFAULT_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS, MAX_PLAUSIBLE_MAGNITUDE};
use crate::error::{Result, VnaError};
use crate::frequency::{FrequencyUnit, Spacing, SweepPlan};
use crate::samples::AveragingPolicy;
use crate::sweep::{RetryPolicy, SegmentSource, SweepMode, SweepOrchestrator};
use crate::telemetry::TracingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "vnacal.toml";
pub const ENV_PREFIX: &str = "VNACAL_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VnaConfig {
    pub sweep: SweepConfig,
    pub averaging: AveragingPolicy,
    pub retry: RetryConfig,
    pub correction: CorrectionOptions,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Sweep range and acquisition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Start frequency in `unit`
    pub start: f64,
    /// Stop frequency in `unit`
    pub stop: f64,
    pub unit: FrequencyUnit,
    pub segments: usize,
    pub points_per_segment: usize,
    pub spacing: Spacing,
    pub mode: SweepMode,
    /// Reject implausible readings as failed reads
    pub validate: bool,
    pub max_magnitude: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start: 0.05,
            stop: 900.0,
            unit: FrequencyUnit::MHz,
            segments: 1,
            points_per_segment: 101,
            spacing: Spacing::Linear,
            mode: SweepMode::Single,
            validate: false,
            max_magnitude: MAX_PLAUSIBLE_MAGNITUDE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

impl Default for VnaConfig {
    fn default() -> Self {
        Self {
            sweep: SweepConfig::default(),
            averaging: AveragingPolicy::default(),
            retry: RetryConfig::default(),
            correction: CorrectionOptions::default(),
            log_level: "info".to_string(),
        }
    }
}

impl VnaConfig {
    /// Load from `vnacal.toml` and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file and the environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::figment(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Parse TOML text over the defaults, ignoring the environment
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Ok(Self::figment(Toml::string(toml)).extract()?)
    }

    fn figment(provider: impl Provider) -> Figment {
        Figment::from(Serialized::defaults(VnaConfig::default())).merge(provider)
    }

    /// Check every setting and build the sweep plan
    pub fn validate(&self) -> Result<SweepPlan> {
        if self.averaging.averages == 0 {
            return Err(VnaError::Config("averaging.averages must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(VnaError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.sweep.validate && self.sweep.max_magnitude <= 0.0 {
            return Err(VnaError::Config("sweep.max_magnitude must be positive".into()));
        }
        if !self.sweep.start.is_finite() || !self.sweep.stop.is_finite() || self.sweep.start < 0.0 {
            return Err(VnaError::Config(format!(
                "sweep range {}..{} is not a valid frequency range",
                self.sweep.start, self.sweep.stop
            )));
        }
        self.tracing_config()?;

        let unit = self.sweep.unit;
        SweepPlan::new(
            unit.to_hz(self.sweep.start),
            unit.to_hz(self.sweep.stop),
            self.sweep.segments,
            self.sweep.points_per_segment,
            self.sweep.spacing,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff_delay: std::time::Duration::from_millis(self.retry.backoff_ms),
        }
    }

    pub fn tracing_config(&self) -> Result<TracingConfig> {
        TracingConfig::from_level_name(&self.log_level)
    }

    /// Orchestrator for `source` with every configured setting applied
    pub fn orchestrator<S: SegmentSource>(&self, source: S) -> Result<SweepOrchestrator<S>> {
        let plan = self.validate()?;
        Ok(SweepOrchestrator::new(source, plan)
            .with_mode(self.sweep.mode)
            .with_averaging(self.averaging)
            .with_retry(self.retry_policy())
            .with_validation(self.sweep.validate.then_some(self.sweep.max_magnitude)))
    }
}
