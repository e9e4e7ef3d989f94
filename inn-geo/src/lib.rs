//! # inn-geo
//!
//! Address resolution for the business-registry (RUES) and programme
//! participant (ZASCA) datasets:
//!
//! 1. [`processor`] adapts raw tables into address records, pre-filtering and
//!    sampling the registry against participant cities and industries
//! 2. [`annotator`] sends batches of raw addresses to a text-generation model
//!    and persists one result file per batch
//! 3. [`geocoder`] / [`nominatim`] resolve normalized addresses to coordinates
//!    with checkpointing
//! 4. [`compare`] cross-checks the two geocoding providers

pub mod annotator;
pub mod commands;
pub mod compare;
pub mod error;
pub mod geocoder;
pub mod llm;
pub mod models;
pub mod nominatim;
pub mod processor;
pub mod prompts;

pub use annotator::{BatchAnnotator, BatchResult, BatchStatus, BatchSummary};
pub use error::{GeoError, GeoResult};
pub use geocoder::{geocode_batch, AddressGeocoder, GeocodeOutcome, GoogleGeocoder};
pub use llm::{GeminiClient, TextGenerator};
pub use models::{AddressRecord, GeocodeRequest, NormalizedAddress};
pub use nominatim::NominatimGeocoder;
pub use processor::AddressProcessor;
