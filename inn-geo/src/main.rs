//! inn-geo - address normalization and geocoding
//!
//! ```text
//! inn-geo normalize --dataset rues --target 520 --clear
//! inn-geo geocode --dataset zasca --service google
//! inn-geo compare
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use inn_common::config::{resolve_data_dir, TomlConfig};
use inn_common::logging::init_tracing;
use inn_common::{DataLayout, Dataset};
use inn_geo::commands::{self, Context, Service};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// Command-line arguments for inn-geo
#[derive(Parser, Debug)]
#[command(name = "inn-geo")]
#[command(about = "Normalize and geocode RUES/ZASCA addresses")]
#[command(version)]
struct Args {
    /// TOML configuration file (overrides INNPULSA_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory (overrides INNPULSA_DATA_DIR and the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Standardize raw addresses with the text-generation model
    Normalize {
        #[arg(long)]
        dataset: Dataset,

        /// Registry sample size (overrides sampling.target_n)
        #[arg(long)]
        target: Option<usize>,

        /// Delete existing batch files before processing
        #[arg(long)]
        clear: bool,
    },

    /// Resolve standardized addresses to coordinates
    Geocode {
        #[arg(long)]
        dataset: Dataset,

        #[arg(long, value_enum, default_value = "google")]
        service: Service,

        /// Re-submit addresses the checkpoint records as unresolved
        #[arg(long)]
        retry_failed: bool,
    },

    /// Compare Google and Nominatim coordinates for participant addresses
    Compare,
}

async fn run(args: Args, config: TomlConfig) -> Result<ExitCode> {
    let data_dir = resolve_data_dir(args.data_dir.as_deref(), &config);
    info!("Data directory: {}", data_dir.display());

    let ctx = Context::new(config, DataLayout::new(data_dir))?;

    match args.command {
        Command::Normalize {
            dataset,
            target,
            clear,
        } => commands::normalize(&ctx, dataset, target, clear).await,
        Command::Geocode {
            dataset,
            service,
            retry_failed,
        } => commands::geocode(&ctx, dataset, service, retry_failed).await,
        Command::Compare => commands::compare(&ctx),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match TomlConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("inn-geo: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("inn-geo: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting inn-geo v{}", env!("CARGO_PKG_VERSION"));

    match run(args, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
