//! Error types for record linkage

use thiserror::Error;

/// Result type for the linkage stage
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Fatal linkage errors
///
/// Ambiguities in the data (duplicate tax ids, equidistant centres) are
/// resolved by fixed rules and never surface here.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Common(#[from] inn_common::Error),

    #[error("Coordinate table {path}: {source}")]
    Coordinates {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("Correction table defines no training centres")]
    NoCenters,
}
