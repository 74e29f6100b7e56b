//! Composition profiles per metal grade
//!
//! A profile maps element symbols to the inclusive `(min, max)` weight
//! percentage a conforming sample falls in. Profiles come from a
//! `CompositionSource`; the static one ships a few common grades and can be
//! replaced by a JSON file of the form `{"<grade>": {"<element>": [min, max]}}`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::utils::error::{NotFound, ProfileError};

/// Element symbol to inclusive `(min, max)`.
pub type CompositionRange = BTreeMap<String, (f64, f64)>;

pub trait CompositionSource: Send + Sync {
    fn composition_range(&self, grade: &str) -> Result<CompositionRange, NotFound>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct StaticCompositionSource {
    profiles: BTreeMap<String, CompositionRange>,
}

impl StaticCompositionSource {
    pub fn new(profiles: BTreeMap<String, CompositionRange>) -> Self {
        Self { profiles }
    }

    /// SG-Iron, Grey-Iron and Carbon-Steel.
    pub fn builtin() -> Self {
        let profile = |ranges: &[(&str, f64, f64)]| -> CompositionRange {
            ranges
                .iter()
                .map(|&(el, min, max)| (el.to_string(), (min, max)))
                .collect()
        };

        let mut profiles = BTreeMap::new();
        profiles.insert(
            "SG-Iron".to_string(),
            profile(&[
                ("C", 3.4, 3.8),
                ("Si", 2.2, 2.8),
                ("Mn", 0.1, 0.4),
                ("P", 0.0, 0.05),
                ("S", 0.0, 0.02),
                ("Mg", 0.03, 0.06),
                ("Cu", 0.0, 0.5),
                ("Cr", 0.0, 0.1),
            ]),
        );
        profiles.insert(
            "Grey-Iron".to_string(),
            profile(&[
                ("C", 3.1, 3.5),
                ("Si", 1.8, 2.4),
                ("Mn", 0.5, 0.8),
                ("P", 0.0, 0.15),
                ("S", 0.05, 0.12),
                ("Cr", 0.0, 0.2),
            ]),
        );
        profiles.insert(
            "Carbon-Steel".to_string(),
            profile(&[
                ("C", 0.15, 0.3),
                ("Si", 0.15, 0.35),
                ("Mn", 0.6, 0.9),
                ("P", 0.0, 0.04),
                ("S", 0.0, 0.05),
                ("Pb", 0.0, 0.02),
            ]),
        );
        Self { profiles }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ProfileError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let source = Self::from_json_str(&std::fs::read_to_string(path)?)?;
        info!("Loaded {} composition profile(s) from {}", source.profiles.len(), path.display());
        Ok(source)
    }

    pub fn grades(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

impl Default for StaticCompositionSource {
    fn default() -> Self {
        Self::builtin()
    }
}

impl CompositionSource for StaticCompositionSource {
    fn composition_range(&self, grade: &str) -> Result<CompositionRange, NotFound> {
        self.profiles.get(grade).cloned().ok_or_else(|| NotFound {
            grade: grade.to_string(),
        })
    }
}
