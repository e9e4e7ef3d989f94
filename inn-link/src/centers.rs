//! Training-centre assignment for control units
//!
//! A control unit (no enrolled centre) is assigned the nearest centre whose
//! own participants' most common industries include the unit's industry.
//! Centres that serve the same city take turns receiving control units
//! instead of always favouring the marginally closer one. Control units then
//! inherit their centre's earliest participant cohort.

use crate::geo::Point;
use crate::merge::LinkedEntity;
use inn_common::table::normalize_numeric_text;
use inn_common::TrainingCenter;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Most frequent industry codes among each centre's treated entities
///
/// Ties in frequency are broken by code so the result is stable.
pub fn top_industries(entities: &[LinkedEntity], top_n: usize) -> HashMap<String, Vec<String>> {
    let mut counts: HashMap<&str, BTreeMap<&str, usize>> = HashMap::new();
    for entity in entities.iter().filter(|e| e.treated) {
        if let (Some(centro), Some(industry)) = (entity.centro.as_deref(), entity.industry.as_deref()) {
            *counts.entry(centro).or_default().entry(industry).or_default() += 1;
        }
    }

    counts
        .into_iter()
        .map(|(centro, per_code)| {
            let mut ranked: Vec<(&str, usize)> = per_code.into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
            let codes = ranked
                .into_iter()
                .take(top_n)
                .map(|(code, _)| code.to_string())
                .collect();
            (centro.to_string(), codes)
        })
        .collect()
}

/// Nearest-centre search restricted by industry
pub struct CenterAssigner<'a> {
    centers: &'a [TrainingCenter],
    industries: HashMap<String, Vec<String>>,
    /// Control units handed out so far per city with co-located centres
    turns: HashMap<String, usize>,
}

impl<'a> CenterAssigner<'a> {
    pub fn new(centers: &'a [TrainingCenter], industries: HashMap<String, Vec<String>>) -> Self {
        Self {
            centers,
            industries,
            turns: HashMap::new(),
        }
    }

    /// Centres whose top industries include `industry`
    ///
    /// Falls back to every centre when the industry is unknown or no centre
    /// lists it.
    pub fn eligible(&self, industry: Option<&str>) -> Vec<&'a TrainingCenter> {
        let matching: Vec<&TrainingCenter> = match industry {
            Some(code) => self
                .centers
                .iter()
                .filter(|c| {
                    self.industries
                        .get(&c.name)
                        .map(|codes| codes.iter().any(|k| k == code))
                        .unwrap_or(false)
                })
                .collect(),
            None => Vec::new(),
        };
        if matching.is_empty() {
            self.centers.iter().collect()
        } else {
            matching
        }
    }

    /// Centre for the next control unit
    ///
    /// When the nearest centre shares its city with other eligible centres,
    /// the group (sorted by name) is served round-robin. Only calls that land
    /// in the group advance its turn.
    pub fn assign(&mut self, point: Point, industry: Option<&str>) -> Option<&'a TrainingCenter> {
        let eligible = self.eligible(industry);

        let mut nearest: Option<(&'a TrainingCenter, f64)> = None;
        for &center in &eligible {
            let distance = point.distance_km(&Point::new(center.latitude, center.longitude));
            // Strict comparison keeps the first of equidistant centres
            if nearest.map(|(_, best)| distance < best).unwrap_or(true) {
                nearest = Some((center, distance));
            }
        }
        let (nearest, _) = nearest?;

        let Some(city) = nearest.city.as_deref() else {
            return Some(nearest);
        };
        let mut colocated: Vec<&TrainingCenter> = eligible
            .into_iter()
            .filter(|c| c.city.as_deref() == Some(city))
            .collect();
        if colocated.len() < 2 {
            return Some(nearest);
        }
        colocated.sort_by(|a, b| a.name.cmp(&b.name));
        let turn = self.turns.entry(city.to_string()).or_default();
        let pick = colocated[*turn % colocated.len()];
        *turn += 1;
        Some(pick)
    }
}

/// Give every control unit a centre; returns the number assigned
pub fn assign_centers(entities: &mut [LinkedEntity], centers: &[TrainingCenter], top_n: usize) -> usize {
    let industries = top_industries(entities, top_n);
    for (centro, codes) in &industries {
        debug!(centro = %centro, industries = ?codes, "Centre top industries");
    }
    let mut assigner = CenterAssigner::new(centers, industries);

    let mut assigned = 0usize;
    let mut unlocated = 0usize;
    for entity in entities.iter_mut() {
        if entity.centro.is_some() {
            continue;
        }
        let Some(point) = entity.location.point else {
            unlocated += 1;
            continue;
        };
        if let Some(center) = assigner.assign(point, entity.industry.as_deref()) {
            entity.centro = Some(center.name.clone());
            assigned += 1;
        }
    }

    if unlocated > 0 {
        warn!(unlocated, "Control units without coordinates left unassigned");
    }
    info!(assigned, "Assigned control units to nearest centre");
    assigned
}

fn cohort_year(value: &str) -> Option<i32> {
    normalize_numeric_text(value).parse().ok()
}

/// Earliest cohort among each centre's treated entities
pub fn earliest_cohorts(entities: &[LinkedEntity]) -> BTreeMap<String, i32> {
    let mut earliest: BTreeMap<String, i32> = BTreeMap::new();
    for entity in entities.iter().filter(|e| e.treated) {
        let (Some(centro), Some(year)) = (
            entity.centro.as_deref(),
            entity.yearcohort.as_deref().and_then(cohort_year),
        ) else {
            continue;
        };
        earliest
            .entry(centro.to_string())
            .and_modify(|y| *y = (*y).min(year))
            .or_insert(year);
    }
    earliest
}

/// Fill a missing `yearcohort` from the entity's centre; returns rows filled
pub fn backfill_cohorts(entities: &mut [LinkedEntity]) -> usize {
    let earliest = earliest_cohorts(entities);
    for (centro, year) in &earliest {
        info!(centro = %centro, yearcohort = year, "Centre reference cohort");
    }

    let mut filled = 0usize;
    for entity in entities.iter_mut().filter(|e| e.yearcohort.is_none()) {
        if let Some(year) = entity.centro.as_ref().and_then(|c| earliest.get(c)) {
            entity.yearcohort = Some(year.to_string());
            filled += 1;
        }
    }
    filled
}
