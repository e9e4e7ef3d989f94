//! Linkage driver: inputs to the canonical geocoded table

use crate::centers::{assign_centers, backfill_cohorts};
use crate::error::{LinkError, LinkResult};
use crate::merge::{attach_coordinates, build_pool, outer_merge, LinkedEntity};
use crate::panel::flatten_panel;
use crate::records::{
    participant_table, read_coordinates, registry_records, CoordinateRecord,
};
use inn_common::config::LinkageConfig;
use inn_common::{CorrectionTable, CsvTable, DataLayout, Dataset};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

/// Columns written after the panel and participant attributes
const TRAILING_COLUMNS: [&str; 7] = [
    "gmaps_address",
    "latitude",
    "longitude",
    "city",
    "centro",
    "yearcohort",
    "link_source",
];

/// Everything the linker reads
#[derive(Debug, Clone)]
pub struct LinkInputs {
    pub registry: CsvTable,
    pub registry_coordinates: Vec<CoordinateRecord>,
    pub participants: CsvTable,
    pub participant_coordinates: Vec<CoordinateRecord>,
}

impl LinkInputs {
    /// Read the four input tables from the canonical layout
    pub fn load(layout: &DataLayout) -> LinkResult<Self> {
        Ok(Self {
            registry: CsvTable::read(&layout.rues_total())?,
            registry_coordinates: read_coordinates(&layout.coordinates_csv(Dataset::Rues))?,
            participants: CsvTable::read(&layout.zasca_total())?,
            participant_coordinates: read_coordinates(&layout.coordinates_csv(Dataset::Zasca))?,
        })
    }

    /// Input paths that do not exist
    pub fn missing(layout: &DataLayout) -> Vec<PathBuf> {
        [
            layout.rues_total(),
            layout.coordinates_csv(Dataset::Rues),
            layout.zasca_total(),
            layout.coordinates_csv(Dataset::Zasca),
        ]
        .into_iter()
        .filter(|p| !p.exists())
        .collect()
    }
}

/// Linked rows plus the column names of their variable-width parts
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedTable {
    pub panel_columns: Vec<String>,
    pub attribute_columns: Vec<String>,
    pub entities: Vec<LinkedEntity>,
}

impl LinkedTable {
    pub fn headers(&self) -> Vec<String> {
        std::iter::once("up_id".to_string())
            .chain(self.panel_columns.iter().cloned())
            .chain(self.attribute_columns.iter().cloned())
            .chain(TRAILING_COLUMNS.iter().map(|c| c.to_string()))
            .collect()
    }

    pub fn to_csv_table(&self) -> CsvTable {
        let mut table = CsvTable::new("data_with_coords", self.headers());
        for entity in &self.entities {
            let point = entity.location.point;
            let mut row = Vec::with_capacity(table.headers.len());
            row.push(entity.up_id.clone());
            row.extend(entity.panel_values.iter().map(|v| v.clone().unwrap_or_default()));
            row.extend(entity.attributes.iter().map(|v| v.clone().unwrap_or_default()));
            row.extend([
                entity.location.gmaps_address.clone().unwrap_or_default(),
                point.map(|p| p.latitude.to_string()).unwrap_or_default(),
                point.map(|p| p.longitude.to_string()).unwrap_or_default(),
                entity.city.clone().unwrap_or_default(),
                entity.centro.clone().unwrap_or_default(),
                entity.yearcohort.clone().unwrap_or_default(),
                entity.source.as_str().to_string(),
            ]);
            table.push_row(row);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Links registry and participant records into one row per tax id
pub struct RecordLinker {
    corrections: CorrectionTable,
    top_n_industries: usize,
    placeholder_ids: Vec<String>,
}

impl RecordLinker {
    /// Requires at least one training centre in `corrections`
    pub fn new(corrections: CorrectionTable, config: &LinkageConfig) -> LinkResult<Self> {
        if corrections.centers.is_empty() {
            return Err(LinkError::NoCenters);
        }
        Ok(Self {
            corrections,
            top_n_industries: config.top_n_industries.max(1),
            placeholder_ids: config.placeholder_ids.clone(),
        })
    }

    /// Run every linkage step over in-memory inputs
    pub fn link(&self, inputs: &LinkInputs) -> LinkResult<LinkedTable> {
        let registry = registry_records(&inputs.registry)?;
        let participants = participant_table(&inputs.participants, &self.corrections)?;
        let attribute_columns = participants.attribute_columns;

        let located = attach_coordinates(participants.records, &inputs.participant_coordinates);
        let pool = build_pool(&inputs.registry_coordinates, &located);

        let panel = flatten_panel(&registry, &pool);
        let panel_columns = panel.columns();

        let mut entities = outer_merge(panel, located, attribute_columns.len(), &self.placeholder_ids);

        let known: HashSet<&str> = self.corrections.centers.iter().map(|c| c.name.as_str()).collect();
        let unknown: HashSet<&str> = entities
            .iter()
            .filter_map(|e| e.centro.as_deref())
            .filter(|c| !known.contains(c))
            .collect();
        if !unknown.is_empty() {
            warn!(centres = ?unknown, "Participant centres missing from the correction table");
        }

        assign_centers(&mut entities, &self.corrections.centers, self.top_n_industries);
        let filled = backfill_cohorts(&mut entities);
        info!(filled, "Backfilled control-unit cohorts");

        Ok(LinkedTable {
            panel_columns,
            attribute_columns,
            entities,
        })
    }

    /// Read inputs from `layout`, link, and write `data_with_coords.csv`
    pub fn run(&self, layout: &DataLayout) -> LinkResult<LinkedTable> {
        let inputs = LinkInputs::load(layout)?;
        let linked = self.link(&inputs)?;

        let path = layout.linked_csv();
        linked.to_csv_table().write(&path)?;
        info!(rows = linked.len(), path = %path.display(), "Saved linked table");
        Ok(linked)
    }
}
