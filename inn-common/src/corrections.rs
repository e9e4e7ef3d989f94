//! Versioned correction and reference table
//!
//! Dataset-specific patches live in a TOML file instead of source code:
//! known erroneous participant tax ids, city spelling fixes, and the list of
//! training centres with their coordinates.
//!
//! ```toml
//! version = 1
//!
//! [nit_remap]
//! "18217688" = "88217688"
//!
//! [city_fix]
//! "Donmatías" = "Don Matías"
//!
//! [[centers]]
//! name = "Suba"
//! city = "Bogotá"
//! latitude = 4.7461
//! longitude = -74.0827
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

/// A training centre location
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TrainingCenter {
    pub name: String,
    /// City served; centres sharing a city are treated as co-located
    #[serde(default)]
    pub city: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

/// Correction/reference table
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CorrectionTable {
    #[serde(default)]
    pub version: u32,

    /// Erroneous tax id -> correct tax id
    #[serde(default)]
    pub nit_remap: BTreeMap<String, String>,

    /// City spelling -> canonical spelling
    #[serde(default)]
    pub city_fix: BTreeMap<String, String>,

    #[serde(default)]
    pub centers: Vec<TrainingCenter>,
}

impl CorrectionTable {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Read correction table {} failed: {}",
                path.display(),
                e
            ))
        })?;
        let table = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            version = table.version,
            nit_remaps = table.nit_remap.len(),
            city_fixes = table.city_fix.len(),
            centers = table.centers.len(),
            "Loaded correction table"
        );
        Ok(table)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let table: CorrectionTable = toml::from_str(content)?;
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        for center in &self.centers {
            if center.name.trim().is_empty() {
                return Err(Error::Config("training centre with empty name".to_string()));
            }
            if !(-90.0..=90.0).contains(&center.latitude)
                || !(-180.0..=180.0).contains(&center.longitude)
            {
                return Err(Error::Config(format!(
                    "training centre '{}' has invalid coordinates ({}, {})",
                    center.name, center.latitude, center.longitude
                )));
            }
        }
        Ok(())
    }

    /// Remapped tax id, or the input unchanged
    pub fn remap_nit<'a>(&'a self, nit: &'a str) -> &'a str {
        self.nit_remap.get(nit).map(String::as_str).unwrap_or(nit)
    }

    /// Corrected city spelling, or the input unchanged
    pub fn fix_city<'a>(&self, city: &'a str) -> Cow<'a, str> {
        match self.city_fix.get(city) {
            Some(fixed) => Cow::Owned(fixed.clone()),
            None => Cow::Borrowed(city),
        }
    }
}
