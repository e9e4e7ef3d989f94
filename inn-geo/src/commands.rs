//! Subcommand drivers for the `inn-geo` binary
//!
//! Configuration and input problems are logged and mapped to exit code 1;
//! anything else propagates as an error.

use crate::compare::run_comparison;
use crate::geocoder::{
    geocode_batch, requests_from_table, write_coordinates, AddressGeocoder, BatchGeocodeSettings,
    CoordinateMap, GoogleGeocoder,
};
use crate::nominatim::{NominatimGeocoder, NOMINATIM_CALLS_PER_SECOND};
use crate::processor::{attach_participant_keys, normalized_table, AddressProcessor};
use crate::prompts::template_for;
use anyhow::{Context as _, Result};
use inn_common::config::{api_key_from_env, TomlConfig};
use inn_common::{CorrectionTable, CsvTable, DataLayout, Dataset, RateLimiter};
use std::collections::HashSet;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Geocoding provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Service {
    Google,
    Nominatim,
}

/// Resolved run context shared by every subcommand
pub struct Context {
    pub config: TomlConfig,
    pub layout: DataLayout,
    pub corrections: CorrectionTable,
}

impl Context {
    pub fn new(config: TomlConfig, layout: DataLayout) -> Result<Self> {
        let corrections = match &config.linkage.corrections {
            Some(path) => CorrectionTable::from_file(path)
                .with_context(|| format!("Failed to load corrections {}", path.display()))?,
            None => CorrectionTable::default(),
        };
        Ok(Self {
            config,
            layout,
            corrections,
        })
    }
}

fn read_input(path: &Path) -> Option<CsvTable> {
    match CsvTable::read(path) {
        Ok(table) => {
            info!(path = %path.display(), rows = table.len(), "Loaded input table");
            Some(table)
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read input file");
            None
        }
    }
}

/// Normalize one dataset's addresses through the text-generation model
pub async fn normalize(
    ctx: &Context,
    dataset: Dataset,
    target: Option<usize>,
    clear: bool,
) -> Result<ExitCode> {
    let mut sampling = ctx.config.sampling.clone();
    if let Some(target_n) = target {
        sampling.target_n = target_n;
    }

    let processor = AddressProcessor::new(dataset, ctx.layout.clone())?
        .with_sampling(sampling)
        .with_corrections(ctx.corrections.clone());

    if clear {
        info!(dir = %processor.batch_dir().display(), "Clearing existing batch files");
        processor.clear_batches()?;
    }

    let (input_path, filter_path) = match dataset {
        Dataset::Rues => (ctx.layout.rues_total(), Some(ctx.layout.zasca_total())),
        Dataset::Zasca => (ctx.layout.zasca_total(), None),
    };

    let Some(table) = read_input(&input_path) else {
        return Ok(ExitCode::FAILURE);
    };
    let filter = match filter_path {
        Some(path) if path.exists() => read_input(&path),
        Some(path) => {
            warn!(path = %path.display(), "Participant table not found, registry is not pre-filtered");
            None
        }
        None => None,
    };

    let compiled = processor
        .process_addresses(&table, template_for(dataset), filter.as_ref(), &ctx.config.llm)
        .await?;

    let Some(rows) = compiled else {
        error!("No results were generated");
        return Ok(ExitCode::FAILURE);
    };

    let output = match dataset {
        Dataset::Rues => normalized_table(dataset, &rows),
        Dataset::Zasca => attach_participant_keys(&rows, &table)?,
    };
    let path = processor.save_results(&output)?;
    info!(
        dataset = %dataset,
        rows = output.len(),
        path = %path.display(),
        "Successfully processed addresses"
    );
    Ok(ExitCode::SUCCESS)
}

/// Geocode a dataset's standardized addresses
pub async fn geocode(
    ctx: &Context,
    dataset: Dataset,
    service: Service,
    retry_failed: bool,
) -> Result<ExitCode> {
    let geo = &ctx.config.geocoding;
    let timeout = Duration::from_secs(geo.timeout_secs);

    let (geocoder, checkpoint, output, address_column): (Box<dyn AddressGeocoder>, _, _, _) =
        match service {
            Service::Google => {
                let Some(api_key) = api_key_from_env(&geo.api_key_env) else {
                    return Ok(ExitCode::FAILURE);
                };
                let limiter = Arc::new(RateLimiter::new(geo.calls_per_second)?);
                (
                    Box::new(GoogleGeocoder::new(api_key, limiter, timeout)?),
                    ctx.layout.coordinates_checkpoint(dataset),
                    ctx.layout.coordinates_csv(dataset),
                    "gmaps_address",
                )
            }
            Service::Nominatim => {
                let limiter = Arc::new(RateLimiter::new(NOMINATIM_CALLS_PER_SECOND)?);
                (
                    Box::new(NominatimGeocoder::new(&geo.nominatim_user_agent, limiter, timeout)?),
                    ctx.layout.nominatim_checkpoint(dataset),
                    ctx.layout.nominatim_coordinates_csv(dataset),
                    "nominatim_address",
                )
            }
        };

    let input_path = ctx.layout.addresses_csv(dataset);
    let Some(table) = read_input(&input_path) else {
        return Ok(ExitCode::FAILURE);
    };
    let requests = requests_from_table(&table)?;

    let mut settings = BatchGeocodeSettings::from_config(geo).with_checkpoint(checkpoint);
    settings.retry_failed = retry_failed;

    let results = geocode_batch(geocoder.as_ref(), &requests, &settings).await?;

    let wanted: HashSet<&str> = requests.iter().map(|(id, _)| id.as_str()).collect();
    let current: CoordinateMap = results
        .into_iter()
        .filter(|(id, _)| wanted.contains(id.as_str()))
        .collect();

    write_coordinates(&output, address_column, &current)?;
    Ok(ExitCode::SUCCESS)
}

/// Compare Google and Nominatim coordinates for participant addresses
pub fn compare(ctx: &Context) -> Result<ExitCode> {
    let dataset = Dataset::Zasca;
    let inputs = [
        ctx.layout.addresses_csv(dataset),
        ctx.layout.coordinates_csv(dataset),
        ctx.layout.nominatim_coordinates_csv(dataset),
    ];
    if let Some(missing) = inputs.iter().find(|p| !p.exists()) {
        error!(path = %missing.display(), "Required file not found");
        return Ok(ExitCode::FAILURE);
    }

    run_comparison(&inputs[0], &inputs[1], &inputs[2], &ctx.layout.comparison_csv())?;
    Ok(ExitCode::SUCCESS)
}
