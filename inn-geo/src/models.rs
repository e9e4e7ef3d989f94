//! Records passed between pipeline stages

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw address submitted for normalization
#[derive(Debug, Clone, PartialEq)]
pub struct AddressRecord {
    pub id: String,
    pub address: String,
}

impl AddressRecord {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// Model-normalized address
///
/// `formatted_address`, `country`, `area` and `city` are either all present
/// or all absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedAddress {
    pub id: String,
    pub raw_address: Option<String>,
    pub formatted_address: Option<String>,
    pub country: Option<String>,
    pub area: Option<String>,
    pub city: Option<String>,
}

/// Columns of the standardized-address table after the id column
pub const NORMALIZED_COLUMNS: [&str; 5] =
    ["raw_address", "formatted_address", "country", "area", "city"];

fn text_field(entry: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match entry.get(key) {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || inn_common::table::is_null_marker(trimmed) {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        _ => None,
    }
}

impl NormalizedAddress {
    /// Build from one entry of a model response object
    ///
    /// `raw_address` is the text originally submitted for `id`. Returns `None`
    /// when the entry is not a JSON object. A partially resolved entry keeps
    /// its raw address but loses every resolved field.
    pub fn from_model_entry(id: &str, raw_address: Option<&str>, entry: &Value) -> Option<Self> {
        let entry = entry.as_object()?;

        let formatted_address = text_field(entry, "formatted_address");
        let country = text_field(entry, "country");
        let area = text_field(entry, "area");
        let city = text_field(entry, "city");

        let complete = formatted_address.is_some()
            && country.is_some()
            && area.is_some()
            && city.is_some();
        let any = formatted_address.is_some()
            || country.is_some()
            || area.is_some()
            || city.is_some();
        if any && !complete {
            tracing::debug!(id, "Partial model answer, dropping resolved fields");
        }

        let raw_address = raw_address.map(str::to_string);
        if complete {
            Some(Self {
                id: id.to_string(),
                raw_address,
                formatted_address,
                country,
                area,
                city,
            })
        } else {
            Some(Self {
                id: id.to_string(),
                raw_address,
                formatted_address: None,
                country: None,
                area: None,
                city: None,
            })
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.formatted_address.is_some()
    }

    /// Cells in [`NORMALIZED_COLUMNS`] order
    pub fn cells(&self) -> Vec<String> {
        [
            &self.raw_address,
            &self.formatted_address,
            &self.country,
            &self.area,
            &self.city,
        ]
        .iter()
        .map(|v| v.as_deref().unwrap_or_default().to_string())
        .collect()
    }
}

/// Input to a geocoding provider
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeocodeRequest {
    pub formatted_address: Option<String>,
    pub country: Option<String>,
    pub area: Option<String>,
    pub city: Option<String>,
}

impl GeocodeRequest {
    /// All components present
    pub fn is_complete(&self) -> bool {
        self.formatted_address.is_some()
            && self.country.is_some()
            && self.area.is_some()
            && self.city.is_some()
    }
}

impl From<&NormalizedAddress> for GeocodeRequest {
    fn from(address: &NormalizedAddress) -> Self {
        Self {
            formatted_address: address.formatted_address.clone(),
            country: address.country.clone(),
            area: address.area.clone(),
            city: address.city.clone(),
        }
    }
}
