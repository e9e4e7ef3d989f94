//! Canonical on-disk layout of the processed data tree

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Source dataset of an address table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    /// Business-registry census
    Rues,
    /// Training-programme participant roster
    Zasca,
}

impl Dataset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dataset::Rues => "rues",
            Dataset::Zasca => "zasca",
        }
    }

    /// Identifier column written to the standardized-address table
    pub fn id_column(&self) -> &'static str {
        match self {
            Dataset::Rues => "nit",
            Dataset::Zasca => "id",
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rues" => Ok(Dataset::Rues),
            "zasca" => Ok(Dataset::Zasca),
            other => Err(crate::Error::InvalidInput(format!("invalid dataset: {}", other))),
        }
    }
}

/// Paths under the data directory
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("02_processed")
    }

    pub fn geolocation_dir(&self) -> PathBuf {
        self.processed_dir().join("geolocation")
    }

    /// Registry panel (one row per entity and source year)
    pub fn rues_total(&self) -> PathBuf {
        self.processed_dir().join("rues_total.csv")
    }

    /// Participant roster
    pub fn zasca_total(&self) -> PathBuf {
        self.processed_dir().join("zasca_total.csv")
    }

    /// Directory holding one JSON file per annotator batch
    pub fn batch_dir(&self, dataset: Dataset) -> PathBuf {
        self.geolocation_dir().join(format!("{}_addresses", dataset))
    }

    pub fn addresses_csv(&self, dataset: Dataset) -> PathBuf {
        self.geolocation_dir().join(format!("{}_addresses.csv", dataset))
    }

    pub fn coordinates_csv(&self, dataset: Dataset) -> PathBuf {
        self.geolocation_dir().join(format!("{}_coordinates.csv", dataset))
    }

    pub fn coordinates_checkpoint(&self, dataset: Dataset) -> PathBuf {
        self.geolocation_dir().join(format!("{}_coordinates.json", dataset))
    }

    pub fn nominatim_coordinates_csv(&self, dataset: Dataset) -> PathBuf {
        self.geolocation_dir()
            .join(format!("{}_coordinates_nominatim.csv", dataset))
    }

    pub fn nominatim_checkpoint(&self, dataset: Dataset) -> PathBuf {
        self.geolocation_dir()
            .join(format!("{}_coordinates_nominatim.json", dataset))
    }

    pub fn comparison_csv(&self) -> PathBuf {
        self.geolocation_dir().join("zasca_coordinates_comparison.csv")
    }

    /// Final linked table
    pub fn linked_csv(&self) -> PathBuf {
        self.geolocation_dir().join("data_with_coords.csv")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_parse() {
        assert_eq!("RUES".parse::<Dataset>().unwrap(), Dataset::Rues);
        assert_eq!(" zasca ".parse::<Dataset>().unwrap(), Dataset::Zasca);
        assert!("emicron".parse::<Dataset>().is_err());
    }

    #[test]
    fn test_layout_paths() {
        let layout = DataLayout::new("/data");
        assert_eq!(
            layout.batch_dir(Dataset::Rues),
            PathBuf::from("/data/02_processed/geolocation/rues_addresses")
        );
        assert_eq!(
            layout.coordinates_csv(Dataset::Zasca),
            PathBuf::from("/data/02_processed/geolocation/zasca_coordinates.csv")
        );
        assert_eq!(
            layout.linked_csv(),
            PathBuf::from("/data/02_processed/geolocation/data_with_coords.csv")
        );
    }
}
