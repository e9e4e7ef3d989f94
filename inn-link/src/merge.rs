//! Outer merge of the registry panel with the participant roster

use crate::panel::{PanelEntity, RegistryPanel};
use crate::pool::CoordinatePool;
use crate::records::{CoordinateRecord, Location, ParticipantRecord};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Which inputs an output row was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSource {
    Both,
    RegistryOnly,
    ParticipantOnly,
}

impl LinkSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkSource::Both => "both",
            LinkSource::RegistryOnly => "only_rues",
            LinkSource::ParticipantOnly => "only_zasca",
        }
    }
}

/// A participant joined to its geocoded address
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedParticipant {
    pub record: ParticipantRecord,
    pub location: Location,
}

/// One output row, keyed by `up_id`
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedEntity {
    pub up_id: String,
    /// Aligned with the panel columns; all `None` for participant-only rows
    pub panel_values: Vec<Option<String>>,
    /// Aligned with the participant attribute columns
    pub attributes: Vec<Option<String>>,
    pub industry: Option<String>,
    pub location: Location,
    pub city: Option<String>,
    pub centro: Option<String>,
    pub yearcohort: Option<String>,
    /// Enrolled participant (had a centre before assignment)
    pub treated: bool,
    pub source: LinkSource,
}

/// Inner join participants to their coordinates by internal id
///
/// Participants with no coordinate row are dropped. When the coordinate
/// table repeats an id, its first row is used.
pub fn attach_coordinates(
    participants: Vec<ParticipantRecord>,
    coordinates: &[CoordinateRecord],
) -> Vec<LocatedParticipant> {
    let mut by_id: HashMap<&str, &CoordinateRecord> = HashMap::new();
    for coordinate in coordinates {
        by_id.entry(coordinate.key()).or_insert(coordinate);
    }

    let total = participants.len();
    let located: Vec<LocatedParticipant> = participants
        .into_iter()
        .filter_map(|record| {
            let location = by_id.get(record.internal_id.as_str())?.location();
            Some(LocatedParticipant { record, location })
        })
        .collect();

    info!(
        participants = total,
        with_coordinates = located.len(),
        "Attached participant coordinates"
    );
    located
}

/// Registry coordinates first, then participant coordinates under their tax id
pub fn build_pool(
    registry_coordinates: &[CoordinateRecord],
    participants: &[LocatedParticipant],
) -> CoordinatePool {
    let mut pool = CoordinatePool::new();
    for coordinate in registry_coordinates {
        pool.insert(coordinate.key(), coordinate.location());
    }
    for participant in participants {
        pool.insert(participant.record.nit.clone(), participant.location.clone());
    }
    debug!(entries = pool.len(), "Built coordinate pool");
    pool
}

/// First letter upper case, the rest lower case
pub fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
        None => String::new(),
    }
}

fn coalesce_location(registry: Option<&Location>, participant: Option<&Location>) -> Location {
    let point = registry
        .and_then(|l| l.point)
        .or_else(|| participant.and_then(|l| l.point));
    let gmaps_address = registry
        .and_then(|l| l.gmaps_address.clone())
        .or_else(|| participant.and_then(|l| l.gmaps_address.clone()));
    Location {
        gmaps_address,
        point,
    }
}

/// Outer join on tax id, sorted by id
///
/// Shared fields prefer the registry value. A tax id claimed by several
/// participants keeps the first claim. Placeholder ids are dropped.
pub fn outer_merge(
    panel: RegistryPanel,
    participants: Vec<LocatedParticipant>,
    attribute_width: usize,
    placeholder_ids: &[String],
) -> Vec<LinkedEntity> {
    let panel_width = panel.width();
    let mut keyed: BTreeMap<String, (Option<PanelEntity>, Option<LocatedParticipant>)> =
        BTreeMap::new();

    for entity in panel.entities {
        let nit = entity.nit.clone();
        keyed.entry(nit).or_default().0 = Some(entity);
    }

    let mut duplicates = 0usize;
    for participant in participants {
        let slot = &mut keyed.entry(participant.record.nit.clone()).or_default().1;
        if slot.is_some() {
            duplicates += 1;
        } else {
            *slot = Some(participant);
        }
    }

    let mut placeholders = 0usize;
    let mut linked = Vec::with_capacity(keyed.len());
    for (nit, (registry, participant)) in keyed {
        if placeholder_ids.iter().any(|p| *p == nit) {
            placeholders += 1;
            continue;
        }

        let source = match (&registry, &participant) {
            (Some(_), Some(_)) => LinkSource::Both,
            (Some(_), None) => LinkSource::RegistryOnly,
            (None, _) => LinkSource::ParticipantOnly,
        };

        let location = coalesce_location(
            registry.as_ref().map(|r| &r.location),
            participant.as_ref().map(|p| &p.location),
        );
        let city = registry
            .as_ref()
            .and_then(|r| r.city.as_deref())
            .or_else(|| participant.as_ref().and_then(|p| p.record.city.as_deref()))
            .map(capitalize);

        let (panel_values, industry) = match registry {
            Some(r) => (r.values, r.industry),
            None => (vec![None; panel_width], None),
        };
        let (attributes, centro, yearcohort) = match participant {
            Some(p) => (p.record.attributes, p.record.centro, p.record.yearcohort),
            None => (vec![None; attribute_width], None, None),
        };

        linked.push(LinkedEntity {
            up_id: nit,
            panel_values,
            attributes,
            industry,
            location,
            city,
            treated: centro.is_some(),
            centro,
            yearcohort,
            source,
        });
    }

    info!(
        rows = linked.len(),
        both = linked.iter().filter(|e| e.source == LinkSource::Both).count(),
        duplicates,
        placeholders,
        "Merged registry and participants"
    );
    linked
}
