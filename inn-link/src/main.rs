//! inn-link - merge geocoded RUES and ZASCA records
//!
//! Reads the registry and participant tables with their coordinate tables and
//! writes `02_processed/geolocation/data_with_coords.csv`.

use anyhow::{Context, Result};
use clap::Parser;
use inn_common::config::{resolve_data_dir, TomlConfig};
use inn_common::logging::init_tracing;
use inn_common::{CorrectionTable, DataLayout};
use inn_link::{LinkInputs, RecordLinker};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// Command-line arguments for inn-link
#[derive(Parser, Debug)]
#[command(name = "inn-link")]
#[command(about = "Link geocoded RUES and ZASCA records by tax id")]
#[command(version)]
struct Args {
    /// TOML configuration file (overrides INNPULSA_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory (overrides INNPULSA_DATA_DIR and the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Correction/reference table (overrides linkage.corrections)
    #[arg(long)]
    corrections: Option<PathBuf>,
}

fn run(args: Args, config: TomlConfig) -> Result<ExitCode> {
    let data_dir = resolve_data_dir(args.data_dir.as_deref(), &config);
    info!("Data directory: {}", data_dir.display());
    let layout = DataLayout::new(data_dir);

    let Some(corrections_path) = args.corrections.or_else(|| config.linkage.corrections.clone()) else {
        error!("No correction table configured; pass --corrections or set linkage.corrections");
        return Ok(ExitCode::FAILURE);
    };
    let corrections = CorrectionTable::from_file(&corrections_path)
        .with_context(|| format!("Failed to load corrections {}", corrections_path.display()))?;

    let missing = LinkInputs::missing(&layout);
    if !missing.is_empty() {
        for path in &missing {
            error!(path = %path.display(), "Required file not found");
        }
        return Ok(ExitCode::FAILURE);
    }

    let linker = RecordLinker::new(corrections, &config.linkage)?;
    let linked = linker.run(&layout)?;
    info!(rows = linked.len(), "Linkage complete");
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match TomlConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("inn-link: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("inn-link: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting inn-link v{}", env!("CARGO_PKG_VERSION"));

    match run(args, config) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
