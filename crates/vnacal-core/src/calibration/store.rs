//! Calibration set and its versioned, lock-protected store

use std::collections::BTreeMap;

use num_complex::Complex64;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::standards::{CalibrationStandard, StandardKind, StandardModel};
use crate::error::{Result, VnaError};
use crate::frequency::FrequencyRange;

/// Measured standards, their models and free-text notes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationSet {
    standards: BTreeMap<StandardKind, CalibrationStandard>,
    models: BTreeMap<StandardKind, StandardModel>,
    notes: Vec<String>,
}

impl CalibrationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard(&self, kind: StandardKind) -> Option<&CalibrationStandard> {
        self.standards.get(&kind).filter(|s| !s.is_empty())
    }

    pub fn has(&self, kind: StandardKind) -> bool {
        self.standard(kind).is_some()
    }

    pub fn standards(&self) -> impl Iterator<Item = &CalibrationStandard> {
        self.standards.values().filter(|s| !s.is_empty())
    }

    /// Replace the standard of the same kind
    pub fn insert(&mut self, standard: CalibrationStandard) {
        self.standards.insert(standard.kind(), standard);
    }

    pub fn remove(&mut self, kind: StandardKind) -> Option<CalibrationStandard> {
        self.standards.remove(&kind)
    }

    /// Model used for `kind`: the characterized one if set, else the ideal
    pub fn model(&self, kind: StandardKind) -> Option<StandardModel> {
        self.models.get(&kind).copied().or_else(|| StandardModel::ideal(kind))
    }

    /// Characterized models only
    pub fn models(&self) -> impl Iterator<Item = &StandardModel> {
        self.models.values()
    }

    pub fn set_model(&mut self, model: StandardModel) {
        self.models.insert(model.kind(), model);
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn set_notes(&mut self, notes: Vec<String>) {
        self.notes = notes;
    }

    /// Short, open and load are all present
    pub fn is_valid_one_port(&self) -> bool {
        [StandardKind::Short, StandardKind::Open, StandardKind::Load]
            .into_iter()
            .all(|k| self.has(k))
    }

    /// One-port set plus through and through-reflect
    pub fn is_valid_two_port(&self) -> bool {
        self.is_valid_one_port()
            && self.has(StandardKind::Through)
            && self.has(StandardKind::ThroughReflect)
    }

    /// Intersection of the coverage of every present standard.
    ///
    /// `None` when the set is empty or coverages are disjoint.
    pub fn valid_range(&self) -> Option<FrequencyRange> {
        intersect_coverage(self.standards())
    }
}

/// Overlap of the coverage of `standards`
pub(crate) fn intersect_coverage<'a>(
    standards: impl IntoIterator<Item = &'a CalibrationStandard>,
) -> Option<FrequencyRange> {
    let mut range: Option<FrequencyRange> = None;
    for standard in standards {
        let coverage = standard.coverage()?;
        range = Some(match range {
            Some(r) => r.intersect(&coverage)?,
            None => coverage,
        });
    }
    range
}

/// A set together with the store version it was taken at
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub version: u64,
    pub set: CalibrationSet,
}

#[derive(Debug, Default)]
struct Versioned {
    version: u64,
    set: CalibrationSet,
}

/// Shared calibration state.
///
/// Writers are serialized by the lock; every mutation bumps the version so
/// that derived correction models know when to rebuild.
#[derive(Debug, Default)]
pub struct CalibrationStore {
    inner: RwLock<Versioned>,
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_set(set: CalibrationSet) -> Self {
        Self {
            inner: RwLock::new(Versioned { version: 1, set }),
        }
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// True when no standard has been measured
    pub fn is_empty(&self) -> bool {
        self.inner.read().set.standards().next().is_none()
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut CalibrationSet) -> R) -> R {
        let mut inner = self.inner.write();
        let out = f(&mut inner.set);
        inner.version += 1;
        debug!(version = inner.version, "Calibration updated");
        out
    }

    /// Add points to a standard, creating it if absent; new points win
    pub fn insert_standard(&self, standard: CalibrationStandard) {
        self.mutate(|set| {
            let existing = set
                .standards
                .get_mut(&standard.kind())
                .filter(|e| !e.is_constant() && !standard.is_constant());
            match existing {
                Some(existing) => {
                    for (freq, value) in standard.points() {
                        existing.insert(freq, value);
                    }
                }
                None => set.insert(standard),
            }
        })
    }

    /// Replace a standard wholesale
    pub fn replace_standard(&self, standard: CalibrationStandard) {
        self.mutate(|set| set.insert(standard))
    }

    pub fn remove_standard(&self, kind: StandardKind) -> Option<CalibrationStandard> {
        self.mutate(|set| set.remove(kind))
    }

    pub fn set_model(&self, model: StandardModel) {
        self.mutate(|set| set.set_model(model))
    }

    pub fn set_notes(&self, notes: Vec<String>) {
        self.mutate(|set| set.set_notes(notes))
    }

    pub fn clear(&self) {
        self.mutate(|set| *set = CalibrationSet::new())
    }

    /// Version-stamped copy of the current set
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read();
        Snapshot {
            version: inner.version,
            set: inner.set.clone(),
        }
    }

    /// Replace the whole set with the content of a record
    pub fn import(&self, record: &CalibrationRecord) -> Result<()> {
        let set = record.to_set()?;
        info!(
            standards = set.standards().count(),
            notes = set.notes().len(),
            "Importing calibration"
        );
        self.mutate(|current| *current = set);
        Ok(())
    }

    pub fn export(&self) -> CalibrationRecord {
        CalibrationRecord::from_set(&self.inner.read().set)
    }
}

/// Serializable form of a calibration set.
///
/// Standards map their name to `(freq, re, im)` triples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub standards: BTreeMap<String, Vec<(u64, f64, f64)>>,
    /// Names of single-point standards broadcast as constants
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constant: Vec<String>,
    #[serde(default)]
    pub models: Vec<StandardModel>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl CalibrationRecord {
    pub fn from_set(set: &CalibrationSet) -> Self {
        let standards = set
            .standards()
            .map(|s| {
                let triples = s.points().map(|(f, v)| (f, v.re, v.im)).collect();
                (s.kind().name().to_string(), triples)
            })
            .collect();
        let constant = set
            .standards()
            .filter(|s| s.is_constant())
            .map(|s| s.kind().name().to_string())
            .collect();

        Self {
            standards,
            constant,
            models: set.models().copied().collect(),
            notes: set.notes().to_vec(),
        }
    }

    pub fn to_set(&self) -> Result<CalibrationSet> {
        let mut set = CalibrationSet::new();
        for (name, triples) in &self.standards {
            let kind = parse_kind(name)?;
            if let Some(&(f, re, im)) = triples
                .iter()
                .find(|(_, re, im)| !re.is_finite() || !im.is_finite())
            {
                return Err(VnaError::Config(format!(
                    "standard '{name}' has a non-finite value {re}{im:+}j at {f} Hz"
                )));
            }
            let points = triples.iter().map(|&(f, re, im)| (f, Complex64::new(re, im)));
            let is_constant = self.constant.iter().any(|c| c.eq_ignore_ascii_case(name));
            let standard = match (is_constant, triples.as_slice()) {
                (true, [(f, re, im)]) => {
                    CalibrationStandard::constant(kind, *f, Complex64::new(*re, *im))
                }
                _ => CalibrationStandard::from_points(kind, points),
            };
            set.insert(standard);
        }
        for model in &self.models {
            set.set_model(*model);
        }
        set.set_notes(self.notes.clone());
        Ok(set)
    }
}

fn parse_kind(name: &str) -> Result<StandardKind> {
    StandardKind::from_name(name)
        .ok_or_else(|| VnaError::Config(format!("unknown calibration standard '{name}'")))
}
