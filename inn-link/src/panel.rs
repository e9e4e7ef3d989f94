//! Registry panel flattening
//!
//! The registry has one row per (entity, year). The panel has one row per
//! entity with a `{metric}_{year}` column for every metric and year.

use crate::pool::CoordinatePool;
use crate::records::{Location, RegistryRecord, PANEL_METRICS};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// One registry entity with its yearly metrics side by side
#[derive(Debug, Clone, PartialEq)]
pub struct PanelEntity {
    pub nit: String,
    pub location: Location,
    /// City from the most recent year that has one
    pub city: Option<String>,
    /// Industry code from the most recent year that has one
    pub industry: Option<String>,
    /// Aligned with [`RegistryPanel::columns`]
    pub values: Vec<Option<String>>,
}

/// Flattened registry, sorted by tax id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryPanel {
    /// Observation years, oldest first
    pub years: Vec<String>,
    pub entities: Vec<PanelEntity>,
}

impl RegistryPanel {
    /// `{metric}_{year}` column names, metric-major
    pub fn columns(&self) -> Vec<String> {
        PANEL_METRICS
            .iter()
            .flat_map(|metric| self.years.iter().map(move |year| format!("{}_{}", metric, year)))
            .collect()
    }

    pub fn width(&self) -> usize {
        PANEL_METRICS.len() * self.years.len()
    }
}

fn sorted_years(records: &[RegistryRecord]) -> Vec<String> {
    let mut years: Vec<String> = records
        .iter()
        .map(|r| r.year.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    years.sort_by_key(|y| (y.parse::<i64>().ok(), y.clone()));
    years
}

/// Pivot registry observations into one row per located entity
///
/// Entities without coordinates in `pool` are left out. Repeated
/// (nit, year) observations keep the first row.
pub fn flatten_panel(records: &[RegistryRecord], pool: &CoordinatePool) -> RegistryPanel {
    let years = sorted_years(records);

    let mut by_nit: BTreeMap<&str, BTreeMap<&str, &RegistryRecord>> = BTreeMap::new();
    let mut repeated = 0usize;
    for record in records {
        let per_year = by_nit.entry(record.nit.as_str()).or_default();
        if per_year.contains_key(record.year.as_str()) {
            repeated += 1;
        } else {
            per_year.insert(record.year.as_str(), record);
        }
    }
    if repeated > 0 {
        debug!(repeated, "Repeated (nit, year) observations dropped");
    }

    let mut unlocated = 0usize;
    let mut entities = Vec::with_capacity(by_nit.len());
    for (nit, per_year) in &by_nit {
        let location = match pool.get(nit) {
            Some(location) if location.has_point() => location.clone(),
            _ => {
                unlocated += 1;
                continue;
            }
        };

        let latest = |pick: &dyn Fn(&RegistryRecord) -> Option<String>| {
            years
                .iter()
                .rev()
                .find_map(|y| per_year.get(y.as_str()).and_then(|r| pick(r)))
        };

        let values = (0..PANEL_METRICS.len())
            .flat_map(|metric| {
                years.iter().map(move |year| {
                    per_year
                        .get(year.as_str())
                        .and_then(|r| r.metrics.get(metric).cloned().flatten())
                })
            })
            .collect();

        entities.push(PanelEntity {
            nit: nit.to_string(),
            location,
            city: latest(&|r| r.city.clone()),
            industry: latest(&|r| r.metric("ciiu_principal").map(str::to_string)),
            values,
        });
    }

    info!(
        entities = entities.len(),
        unlocated,
        years = ?years,
        "Flattened registry panel"
    );
    RegistryPanel { years, entities }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Point;

    fn record(nit: &str, year: &str, city: Option<&str>, ciiu: Option<&str>, empleados: &str) -> RegistryRecord {
        let mut metrics = vec![None; PANEL_METRICS.len()];
        metrics[0] = ciiu.map(str::to_string);
        metrics[3] = Some(empleados.to_string());
        RegistryRecord {
            nit: nit.to_string(),
            year: year.to_string(),
            city: city.map(str::to_string),
            metrics,
        }
    }

    fn pool(nits: &[&str]) -> CoordinatePool {
        let mut pool = CoordinatePool::new();
        for nit in nits {
            pool.insert(
                *nit,
                Location {
                    gmaps_address: None,
                    point: Some(Point::new(4.0, -74.0)),
                },
            );
        }
        pool
    }

    #[test]
    fn test_columns_are_metric_major() {
        let panel = flatten_panel(
            &[record("1", "2024", None, None, "1"), record("1", "2023", None, None, "2")],
            &pool(&["1"]),
        );
        assert_eq!(panel.years, vec!["2023", "2024"]);
        let columns = panel.columns();
        assert_eq!(columns.len(), panel.width());
        assert_eq!(columns[0], "ciiu_principal_2023");
        assert_eq!(columns[1], "ciiu_principal_2024");
        assert_eq!(columns[6], "empleados_2023");
        assert_eq!(panel.entities[0].values[6].as_deref(), Some("2"));
        assert_eq!(panel.entities[0].values[7].as_deref(), Some("1"));
    }

    #[test]
    fn test_city_and_industry_from_latest_year() {
        let panel = flatten_panel(
            &[
                record("1", "2023", Some("Cali"), Some("1410"), "1"),
                record("1", "2024", None, Some("1420"), "1"),
            ],
            &pool(&["1"]),
        );
        let entity = &panel.entities[0];
        assert_eq!(entity.city.as_deref(), Some("Cali"));
        assert_eq!(entity.industry.as_deref(), Some("1420"));
    }

    #[test]
    fn test_unlocated_and_repeated_rows() {
        let panel = flatten_panel(
            &[
                record("1", "2023", None, None, "first"),
                record("1", "2023", None, None, "second"),
                record("2", "2023", None, None, "1"),
            ],
            &pool(&["1"]),
        );
        assert_eq!(panel.entities.len(), 1);
        assert_eq!(panel.entities[0].values[3].as_deref(), Some("first"));
    }
}
