//! Typed ingestion of the linkage inputs
//!
//! Column presence is checked once here. Everything downstream works on
//! these records instead of probing tables.

use crate::error::{LinkError, LinkResult};
use crate::geo::Point;
use crate::ids::reconcile_nit;
use inn_common::table::normalize_numeric_text;
use inn_common::{CorrectionTable, CsvTable};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Yearly registry metrics carried into the flattened panel
pub const PANEL_METRICS: [&str; 9] = [
    "ciiu_principal",
    "cantidad_establecimientos",
    "activos_total",
    "empleados",
    "ingresos_actividad_ordinaria",
    "resultado_del_periodo",
    "cantidad_mujeres_empleadas",
    "cantidad_mujeres_en_cargos_direc",
    "codigo_tamano_empresa",
];

/// Participant columns with dedicated fields (not carried as attributes)
const PARTICIPANT_KEY_COLUMNS: [&str; 8] = [
    "nit",
    "city",
    "centro",
    "yearcohort",
    "id",
    "gmaps_address",
    "latitude",
    "longitude",
];

/// Linked output columns the participant roster may not supply
const RESERVED_OUTPUT_COLUMNS: [&str; 2] = ["up_id", "link_source"];

/// Whether `name` has the `{metric}_{year}` shape of a flattened panel column
fn is_panel_column(name: &str) -> bool {
    PANEL_METRICS.iter().any(|metric| {
        name.strip_prefix(*metric)
            .and_then(|rest| rest.strip_prefix('_'))
            .map(|year| !year.is_empty() && year.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false)
    })
}

/// Geocoded location; the pair is present or absent as a whole
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Location {
    pub gmaps_address: Option<String>,
    pub point: Option<Point>,
}

impl Location {
    pub fn has_point(&self) -> bool {
        self.point.is_some()
    }
}

/// One row of a coordinate table (`{dataset}_coordinates.csv`)
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinateRecord {
    pub id: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub gmaps_address: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub longitude: Option<f64>,
}

impl CoordinateRecord {
    pub fn key(&self) -> &str {
        normalize_numeric_text(&self.id)
    }

    pub fn location(&self) -> Location {
        Location {
            gmaps_address: self
                .gmaps_address
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string),
            point: Point::from_pair(self.latitude, self.longitude),
        }
    }
}

/// Read a coordinate table
pub fn read_coordinates(path: &Path) -> LinkResult<Vec<CoordinateRecord>> {
    let records: Vec<CoordinateRecord> =
        inn_common::table::read_records(path).map_err(|e| match e {
            inn_common::Error::Csv(source) => LinkError::Coordinates {
                path: path.display().to_string(),
                source,
            },
            other => LinkError::Common(other),
        })?;
    let located = records.iter().filter(|r| r.location().has_point()).count();
    info!(
        path = %path.display(),
        rows = records.len(),
        located,
        "Loaded coordinate table"
    );
    Ok(records)
}

/// One registry observation (entity, year)
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryRecord {
    pub nit: String,
    pub year: String,
    pub city: Option<String>,
    /// Aligned with [`PANEL_METRICS`]
    pub metrics: Vec<Option<String>>,
}

impl RegistryRecord {
    pub fn metric(&self, name: &str) -> Option<&str> {
        let index = PANEL_METRICS.iter().position(|m| *m == name)?;
        self.metrics.get(index)?.as_deref()
    }
}

/// Adapt the registry table; rows without a tax id or year are skipped
pub fn registry_records(table: &CsvTable) -> LinkResult<Vec<RegistryRecord>> {
    table.require_column("nit")?;
    table.require_column("source_year")?;
    for metric in PANEL_METRICS {
        if !table.has_column(metric) {
            warn!(table = %table.name, column = metric, "Registry metric column absent");
        }
    }

    let mut skipped = 0usize;
    let mut records = Vec::with_capacity(table.len());
    for row in &table.rows {
        let (Some(nit), Some(year)) = (table.get(row, "nit"), table.get(row, "source_year")) else {
            skipped += 1;
            continue;
        };
        records.push(RegistryRecord {
            nit: normalize_numeric_text(nit).to_string(),
            year: normalize_numeric_text(year).to_string(),
            city: table.get(row, "city").map(str::to_string),
            metrics: PANEL_METRICS
                .iter()
                .map(|m| table.get(row, m).map(|v| normalize_numeric_text(v).to_string()))
                .collect(),
        });
    }
    if skipped > 0 {
        debug!(skipped, "Registry rows without nit or source_year skipped");
    }
    Ok(records)
}

/// One participant, keyed by reconciled tax id
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantRecord {
    /// `numberid_emp1`, the key of the participant coordinate table
    pub internal_id: String,
    pub nit: String,
    pub city: Option<String>,
    pub centro: Option<String>,
    pub yearcohort: Option<String>,
    /// Aligned with [`ParticipantTable::attribute_columns`]
    pub attributes: Vec<Option<String>>,
}

/// Participant roster with its pass-through columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticipantTable {
    pub attribute_columns: Vec<String>,
    pub records: Vec<ParticipantRecord>,
}

/// Adapt the participant table, reconciling tax ids on the way in
pub fn participant_table(
    table: &CsvTable,
    corrections: &CorrectionTable,
) -> LinkResult<ParticipantTable> {
    table.require_column("numberid_emp1")?;

    let mut seen = HashSet::new();
    let mut attribute_columns: Vec<String> = Vec::new();
    for header in &table.headers {
        let name = header.as_str();
        if PARTICIPANT_KEY_COLUMNS.contains(&name) {
            continue;
        }
        if RESERVED_OUTPUT_COLUMNS.contains(&name) || is_panel_column(name) || !seen.insert(name) {
            warn!(table = %table.name, column = name, "Participant column clashes with a linked column, skipped");
            continue;
        }
        attribute_columns.push(header.clone());
    }

    let mut records = Vec::with_capacity(table.len());
    let mut remapped = 0usize;
    for row in &table.rows {
        let Some(internal_id) = table.get(row, "numberid_emp1") else {
            continue;
        };
        let internal_id = normalize_numeric_text(internal_id).to_string();
        let raw_nit = table.get(row, "nit");
        let Some(nit) = reconcile_nit(raw_nit, Some(&internal_id), corrections) else {
            continue;
        };
        if raw_nit.map(normalize_numeric_text) != Some(nit.as_str()) {
            remapped += 1;
        }

        records.push(ParticipantRecord {
            internal_id,
            nit,
            city: table
                .get(row, "city")
                .map(|c| corrections.fix_city(c).into_owned()),
            centro: table.get(row, "centro").map(str::to_string),
            yearcohort: table
                .get(row, "yearcohort")
                .map(|v| normalize_numeric_text(v).to_string()),
            attributes: attribute_columns
                .iter()
                .map(|c| table.get(row, c).map(str::to_string))
                .collect(),
        });
    }

    info!(
        participants = records.len(),
        reconciled = remapped,
        "Loaded participant table"
    );
    Ok(ParticipantTable {
        attribute_columns,
        records,
    })
}
