//! # inn-link
//!
//! Links geocoded registry (RUES) and participant (ZASCA) records into one
//! canonical row per tax id:
//!
//! 1. [`records`] adapts the input tables and reconciles participant tax ids
//!    ([`ids`])
//! 2. [`panel`] flattens the registry's yearly observations
//! 3. [`merge`] outer-joins both sources, coalescing shared fields
//! 4. [`centers`] assigns control units to training centres and backfills
//!    their cohort
//!
//! [`linker::RecordLinker`] runs the whole sequence.

pub mod centers;
pub mod error;
pub mod geo;
pub mod ids;
pub mod linker;
pub mod merge;
pub mod panel;
pub mod pool;
pub mod records;

pub use error::{LinkError, LinkResult};
pub use geo::{haversine_km, Point};
pub use ids::reconcile_nit;
pub use linker::{LinkInputs, LinkedTable, RecordLinker};
pub use merge::{LinkSource, LinkedEntity};
