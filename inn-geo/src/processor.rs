//! Dataset-specific address preparation
//!
//! [`AddressProcessor`] turns a raw RUES or ZASCA table into
//! [`AddressRecord`]s, runs them through the [`BatchAnnotator`] and shapes the
//! compiled output into the standardized-address table.
//!
//! **RUES pre-filter** (when a participant table is supplied):
//! 1. Normalize city names on both sides (lower-case, trimmed, accents folded)
//! 2. Attach each participant's industry code from the registry by tax id
//! 3. Keep the `top_k_ciiu` most frequent codes per participant city
//! 4. Keep registry rows whose (city, code) pair is in that set
//! 5. If more than `target_n` remain, draw `target_n` without replacement,
//!    weighted by participant count / registry count for the row's city

use crate::annotator::{self, AnnotatorSettings, BatchAnnotator};
use crate::error::GeoResult;
use crate::llm::{GeminiClient, TextGenerator};
use crate::models::{AddressRecord, NormalizedAddress, NORMALIZED_COLUMNS};
use inn_common::config::{api_key_from_env, LlmConfig, SamplingConfig};
use inn_common::table::normalize_numeric_text;
use inn_common::{CorrectionTable, CsvTable, DataLayout, Dataset, Error, RateLimiter};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use unicode_normalization::UnicodeNormalization;

/// Weight given to cities without a participant count
const FALLBACK_WEIGHT: f64 = 1e-6;

/// Registry address column; older exports drop the accent
const REGISTRY_ADDRESS_COLUMNS: [&str; 2] = ["dirección_comercial", "direccion_comercial"];

/// Lower-case, trim, NFKD-decompose and keep only ASCII
pub fn normalise_city(city: &str) -> String {
    city.trim().to_lowercase().nfkd().filter(char::is_ascii).collect()
}

/// Registry row eligible for address normalization
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryCandidate {
    pub nit: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub ciiu: Option<String>,
    city_norm: String,
}

impl RegistryCandidate {
    /// `"{address}, {city}, {state}, CO"` with blanks for missing parts
    pub fn full_address(&self) -> String {
        format!(
            "{}, {}, {}, CO",
            self.address.as_deref().unwrap_or(""),
            self.city.as_deref().unwrap_or(""),
            self.state.as_deref().unwrap_or("")
        )
    }
}

/// Participant row as needed for normalization and the pre-filter
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantAddress {
    pub internal_id: String,
    pub nit: Option<String>,
    pub city: Option<String>,
    pub full_address: Option<String>,
    pub in_rues: Option<String>,
}

fn parse_year(value: &str) -> Option<i32> {
    value.trim().parse::<f64>().ok().map(|y| y as i32)
}

/// Adapt a registry table; rows outside `year` are skipped when a
/// `source_year` column exists
pub fn registry_candidates(table: &CsvTable, year: Option<i32>) -> GeoResult<Vec<RegistryCandidate>> {
    table.require_column("nit")?;
    let address_column = REGISTRY_ADDRESS_COLUMNS
        .iter()
        .copied()
        .find(|c| table.has_column(c))
        .ok_or_else(|| Error::MissingColumn {
            table: table.name.clone(),
            column: REGISTRY_ADDRESS_COLUMNS[0].to_string(),
        })?;

    let year_filter = match year {
        Some(y) if table.has_column("source_year") => Some(y),
        Some(y) => {
            warn!(year = y, table = %table.name, "No source_year column, using all rows");
            None
        }
        None => None,
    };

    let mut candidates = Vec::new();
    for row in &table.rows {
        if let Some(y) = year_filter {
            if table.get(row, "source_year").and_then(parse_year) != Some(y) {
                continue;
            }
        }
        let Some(nit) = table.get(row, "nit") else {
            continue;
        };
        let city = table.get(row, "city").map(str::to_string);
        candidates.push(RegistryCandidate {
            nit: normalize_numeric_text(nit).to_string(),
            address: table.get(row, address_column).map(str::to_string),
            city_norm: normalise_city(city.as_deref().unwrap_or("")),
            city,
            state: table.get(row, "state").map(str::to_string),
            ciiu: table
                .get(row, "ciiu_principal")
                .map(|c| normalize_numeric_text(c).to_string()),
        });
    }

    debug!(rows = candidates.len(), year = ?year_filter, "Adapted registry rows");
    Ok(candidates)
}

/// Adapt a participant table
pub fn participant_addresses(table: &CsvTable) -> GeoResult<Vec<ParticipantAddress>> {
    table.require_column("numberid_emp1")?;
    table.require_column("full_address")?;

    Ok(table
        .rows
        .iter()
        .filter_map(|row| {
            let internal_id = normalize_numeric_text(table.get(row, "numberid_emp1")?).to_string();
            Some(ParticipantAddress {
                internal_id,
                nit: table.get(row, "nit").map(|n| normalize_numeric_text(n).to_string()),
                city: table.get(row, "city").map(str::to_string),
                full_address: table.get(row, "full_address").map(str::to_string),
                in_rues: table.get(row, "in_rues").map(str::to_string),
            })
        })
        .collect())
}

/// Most frequent industry codes per normalized participant city
///
/// Ties on count are broken by code so the selection is deterministic.
pub fn top_codes_per_city(
    participants: &[(String, Option<String>)],
    top_k: usize,
) -> HashSet<(String, String)> {
    let mut counts: HashMap<(&str, &str), usize> = HashMap::new();
    for (city, code) in participants {
        if let Some(code) = code {
            if !city.is_empty() {
                *counts.entry((city.as_str(), code.as_str())).or_default() += 1;
            }
        }
    }

    let mut per_city: HashMap<&str, Vec<(&str, usize)>> = HashMap::new();
    for ((city, code), count) in counts {
        per_city.entry(city).or_default().push((code, count));
    }

    let mut selected = HashSet::new();
    for (city, mut codes) in per_city {
        codes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        for (code, _) in codes.into_iter().take(top_k) {
            selected.insert((city.to_string(), code.to_string()));
        }
    }
    info!(
        top_k,
        pairs = selected.len(),
        "Identified top industry codes per participant city"
    );
    selected
}

/// Restrict and sample registry rows against participant cities/industries
pub fn filter_registry_against_participants(
    registry: Vec<RegistryCandidate>,
    participants: &[ParticipantAddress],
    sampling: &SamplingConfig,
    corrections: &CorrectionTable,
) -> Vec<RegistryCandidate> {
    let mut registry_codes: HashMap<&str, Vec<&str>> = HashMap::new();
    for candidate in &registry {
        if let Some(code) = candidate.ciiu.as_deref() {
            registry_codes.entry(candidate.nit.as_str()).or_default().push(code);
        }
    }

    // Participant city -> enriched industry codes (one entry per registry match)
    let mut participant_city_counts: HashMap<String, usize> = HashMap::new();
    let mut enriched: Vec<(String, Option<String>)> = Vec::new();
    for participant in participants {
        let city = participant
            .city
            .as_deref()
            .map(|c| normalise_city(&corrections.fix_city(c)))
            .unwrap_or_default();
        *participant_city_counts.entry(city.clone()).or_default() += 1;

        match participant
            .nit
            .as_deref()
            .and_then(|nit| registry_codes.get(nit))
        {
            Some(codes) => {
                for code in codes {
                    enriched.push((city.clone(), Some(code.to_string())));
                }
            }
            None => enriched.push((city, None)),
        }
    }

    let valid = top_codes_per_city(&enriched, sampling.top_k_ciiu);

    let total = registry.len();
    let filtered: Vec<RegistryCandidate> = registry
        .into_iter()
        .filter(|c| {
            c.ciiu
                .as_ref()
                .map(|code| valid.contains(&(c.city_norm.clone(), code.clone())))
                .unwrap_or(false)
        })
        .collect();
    info!(
        from = total,
        to = filtered.len(),
        "Filtered registry using city-specific industry codes"
    );

    sample_by_city_weight(filtered, &participant_city_counts, sampling.target_n, sampling.seed)
}

/// Weighted sample without replacement, keeping input order
pub fn sample_by_city_weight(
    candidates: Vec<RegistryCandidate>,
    participant_city_counts: &HashMap<String, usize>,
    target_n: usize,
    seed: u64,
) -> Vec<RegistryCandidate> {
    if candidates.len() <= target_n {
        info!(
            available = candidates.len(),
            target_n, "Taking all available registry rows"
        );
        return candidates;
    }

    let mut registry_city_counts: HashMap<&str, usize> = HashMap::new();
    for c in &candidates {
        *registry_city_counts.entry(c.city_norm.as_str()).or_default() += 1;
    }

    let weights: Vec<(usize, f64)> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let participants = participant_city_counts.get(&c.city_norm).copied().unwrap_or(0);
            let registry = registry_city_counts.get(c.city_norm.as_str()).copied().unwrap_or(0);
            let weight = if participants > 0 && registry > 0 {
                participants as f64 / registry as f64
            } else {
                FALLBACK_WEIGHT
            };
            (i, weight)
        })
        .collect();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut chosen: Vec<usize> = match weights.choose_multiple_weighted(&mut rng, target_n, |w| w.1) {
        Ok(picked) => picked.map(|w| w.0).collect(),
        Err(e) => {
            error!(error = %e, "Invalid sampling weights, taking the first rows");
            (0..target_n).collect()
        }
    };
    chosen.sort_unstable();

    let available = candidates.len();
    let chosen: HashSet<usize> = chosen.into_iter().collect();
    let sampled: Vec<RegistryCandidate> = candidates
        .into_iter()
        .enumerate()
        .filter(|(i, _)| chosen.contains(i))
        .map(|(_, c)| c)
        .collect();

    info!(
        sampled = sampled.len(),
        available, "Sampled registry rows by city weight"
    );
    sampled
}

/// Standardized-address table: id column, then [`NORMALIZED_COLUMNS`]
pub fn normalized_table(dataset: Dataset, rows: &[NormalizedAddress]) -> CsvTable {
    let mut headers = vec![dataset.id_column().to_string()];
    headers.extend(NORMALIZED_COLUMNS.iter().map(|c| c.to_string()));
    let mut table = CsvTable::new(format!("{}_addresses.csv", dataset), headers);
    for row in rows {
        let mut cells = vec![row.id.clone()];
        cells.extend(row.cells());
        table.push_row(cells);
    }
    table
}

/// Join compiled participant addresses back to the roster
///
/// Inner join on the internal id; adds `nit` and `in_rues`; one row per id.
pub fn attach_participant_keys(rows: &[NormalizedAddress], participants: &CsvTable) -> GeoResult<CsvTable> {
    participants.require_column("numberid_emp1")?;

    let mut keys: HashMap<String, (String, String)> = HashMap::new();
    for row in &participants.rows {
        let Some(id) = participants.get(row, "numberid_emp1") else {
            continue;
        };
        keys.entry(normalize_numeric_text(id).to_string()).or_insert_with(|| {
            (
                participants
                    .get(row, "nit")
                    .map(|n| normalize_numeric_text(n).to_string())
                    .unwrap_or_default(),
                participants.get(row, "in_rues").unwrap_or_default().to_string(),
            )
        });
    }

    let mut headers = vec![Dataset::Zasca.id_column().to_string()];
    headers.extend(NORMALIZED_COLUMNS.iter().map(|c| c.to_string()));
    headers.extend(["nit".to_string(), "in_rues".to_string()]);
    let mut table = CsvTable::new("zasca_addresses.csv", headers);

    let mut seen = HashSet::new();
    let mut unmatched = 0usize;
    for row in rows {
        let id = normalize_numeric_text(&row.id).to_string();
        let Some((nit, in_rues)) = keys.get(&id) else {
            unmatched += 1;
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }
        let mut cells = vec![id];
        cells.extend(row.cells());
        cells.push(nit.clone());
        cells.push(in_rues.clone());
        table.push_row(cells);
    }

    if unmatched > 0 {
        warn!(unmatched, "Compiled ids without a roster row were dropped");
    }
    Ok(table)
}

/// Per-dataset driver for address normalization
pub struct AddressProcessor {
    dataset: Dataset,
    layout: DataLayout,
    batch_dir: PathBuf,
    sampling: SamplingConfig,
    corrections: CorrectionTable,
}

impl AddressProcessor {
    pub fn new(dataset: Dataset, layout: DataLayout) -> GeoResult<Self> {
        let batch_dir = layout.batch_dir(dataset);
        std::fs::create_dir_all(&batch_dir)?;
        debug!(dataset = %dataset, dir = %batch_dir.display(), "Initialised address processor");

        Ok(Self {
            dataset,
            layout,
            batch_dir,
            sampling: SamplingConfig::default(),
            corrections: CorrectionTable::default(),
        })
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_corrections(mut self, corrections: CorrectionTable) -> Self {
        self.corrections = corrections;
        self
    }

    pub fn dataset(&self) -> Dataset {
        self.dataset
    }

    pub fn batch_dir(&self) -> &Path {
        &self.batch_dir
    }

    /// Delete existing batch files for this dataset
    pub fn clear_batches(&self) -> GeoResult<usize> {
        annotator::clear_batches(&self.batch_dir)
    }

    /// Adapt `table` into records for the annotator
    ///
    /// For RUES, `filter_against` (the participant table) enables the
    /// city/industry pre-filter and sampling.
    pub fn build_records(
        &self,
        table: &CsvTable,
        filter_against: Option<&CsvTable>,
    ) -> GeoResult<Vec<AddressRecord>> {
        match self.dataset {
            Dataset::Rues => {
                let mut candidates = registry_candidates(table, Some(self.sampling.registry_year))?;
                if let Some(participant_table) = filter_against {
                    let participants = participant_addresses(participant_table)?;
                    candidates = filter_registry_against_participants(
                        candidates,
                        &participants,
                        &self.sampling,
                        &self.corrections,
                    );
                }
                Ok(candidates
                    .iter()
                    .map(|c| AddressRecord::new(c.nit.clone(), c.full_address()))
                    .collect())
            }
            Dataset::Zasca => Ok(participant_addresses(table)?
                .into_iter()
                .filter_map(|p| Some(AddressRecord::new(p.internal_id, p.full_address?)))
                .collect()),
        }
    }

    /// Normalize the table's addresses with the configured model
    ///
    /// Returns `Ok(None)` when the API key is absent or nothing compiled.
    pub async fn process_addresses(
        &self,
        table: &CsvTable,
        prompt: &str,
        filter_against: Option<&CsvTable>,
        llm: &LlmConfig,
    ) -> GeoResult<Option<Vec<NormalizedAddress>>> {
        let records = self.build_records(table, filter_against)?;
        let Some(api_key) = api_key_from_env(&llm.api_key_env) else {
            return Ok(None);
        };

        let generator: Arc<dyn TextGenerator> = Arc::new(GeminiClient::new(
            api_key,
            llm.model.clone(),
            Duration::from_secs(llm.timeout_secs),
        )?);
        let rate_limiter = Arc::new(RateLimiter::new(llm.calls_per_second)?);

        self.annotate(
            generator,
            rate_limiter,
            prompt,
            &records,
            AnnotatorSettings::from_config(llm),
        )
        .await
    }

    /// Run the annotator over `records` and compile every success file
    pub async fn annotate(
        &self,
        generator: Arc<dyn TextGenerator>,
        rate_limiter: Arc<RateLimiter>,
        prompt: &str,
        records: &[AddressRecord],
        settings: AnnotatorSettings,
    ) -> GeoResult<Option<Vec<NormalizedAddress>>> {
        info!(dataset = %self.dataset, records = records.len(), "Starting address processing");

        let annotator = BatchAnnotator::new(generator, rate_limiter, prompt, &self.batch_dir, settings)?;
        annotator.run(records).await?;

        info!("Compiling results");
        let compiled = annotator::compile_results(&self.batch_dir)?;
        if compiled.is_empty() {
            warn!("No results to compile");
            return Ok(None);
        }
        Ok(Some(compiled))
    }

    /// Write the standardized-address table for this dataset
    pub fn save_results(&self, table: &CsvTable) -> GeoResult<PathBuf> {
        let path = self.layout.addresses_csv(self.dataset);
        table.write(&path)?;
        info!(rows = table.len(), path = %path.display(), "Saved standardized addresses");
        Ok(path)
    }
}
