//! # Innpulsa Common Library
//!
//! Shared code for the address-resolution and record-linkage binaries:
//! - Error type and result alias
//! - TOML bootstrap configuration and data directory resolution
//! - Tracing subscriber setup
//! - Rate limiting and exponential-backoff retry for external providers
//! - CSV table I/O and the canonical data layout
//! - Versioned correction/reference table

pub mod config;
pub mod corrections;
pub mod error;
pub mod layout;
pub mod logging;
pub mod rate_limiter;
pub mod retry;
pub mod table;

pub use corrections::{CorrectionTable, TrainingCenter};
pub use error::{Error, Result};
pub use layout::{DataLayout, Dataset};
pub use rate_limiter::RateLimiter;
pub use retry::{retry_with_backoff, RetryPolicy};
pub use table::CsvTable;
