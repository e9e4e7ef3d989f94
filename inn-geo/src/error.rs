//! Error types for the address-resolution pipeline

use thiserror::Error;

/// Result type for pipeline stages
pub type GeoResult<T> = std::result::Result<T, GeoError>;

/// Fatal pipeline errors
///
/// Per-batch and per-address provider failures are recorded in the batch
/// files and coordinate tables instead of surfacing here.
#[derive(Debug, Error)]
pub enum GeoError {
    #[error(transparent)]
    Common(#[from] inn_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("LLM client error: {0}")]
    Llm(#[from] crate::llm::LlmError),

    #[error("Geocoder error: {0}")]
    Geocode(#[from] crate::geocoder::GeocodeError),

    #[error("Prompt template is missing the {0} placeholder")]
    Template(&'static str),

    #[error("Checkpoint {path} is unreadable: {reason}")]
    Checkpoint { path: String, reason: String },
}
