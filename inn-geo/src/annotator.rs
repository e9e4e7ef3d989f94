//! Batch address annotation
//!
//! Raw addresses are grouped into fixed-size batches, each batch is sent to
//! the text-generation model under the shared [`RateLimiter`], and the
//! outcome is persisted as one JSON file per batch:
//!
//! ```text
//! batch_0000_success.json
//! batch_0001_error.json
//! ```
//!
//! Files are written to a temporary name and renamed, so a reader never sees
//! a partial batch. A rerun skips ids already present in success files and
//! numbers new batches after the highest existing id.

use crate::error::{GeoError, GeoResult};
use crate::llm::{LlmError, TextGenerator};
use crate::models::{AddressRecord, NormalizedAddress};
use crate::prompts::{check_template, fill_template};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use inn_common::config::LlmConfig;
use inn_common::{retry_with_backoff, RateLimiter, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Success,
    Error,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Success => "success",
            BatchStatus::Error => "error",
        }
    }
}

/// Persisted record of one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: usize,
    pub status: BatchStatus,
    /// id -> raw address as submitted
    pub input_addresses: BTreeMap<String, String>,
    /// Validated JSON text returned by the model (success only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Failure description (error only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of addresses processed; 0 for failed batches
    pub processed_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchResult {
    fn success(batch_id: usize, input_addresses: BTreeMap<String, String>, response: String) -> Self {
        let processed_count = input_addresses.len();
        Self {
            batch_id,
            status: BatchStatus::Success,
            input_addresses,
            response: Some(response),
            error: None,
            processed_count,
            completed_at: Some(Utc::now()),
        }
    }

    fn failure(batch_id: usize, input_addresses: BTreeMap<String, String>, error: String) -> Self {
        Self {
            batch_id,
            status: BatchStatus::Error,
            input_addresses,
            response: None,
            error: Some(error),
            processed_count: 0,
            completed_at: Some(Utc::now()),
        }
    }

    pub fn file_name(&self) -> String {
        format!("batch_{:04}_{}.json", self.batch_id, self.status.as_str())
    }
}

/// Counters returned by [`BatchAnnotator::run`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total_batches: usize,
    pub successful_batches: usize,
    pub failed_batches: usize,
    /// Ids skipped because an earlier run already succeeded for them
    pub skipped_ids: usize,
}

/// Batch size and retry schedule for the annotator
#[derive(Debug, Clone)]
pub struct AnnotatorSettings {
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl AnnotatorSettings {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.initial_delay_ms),
                config.backoff_multiplier,
                config.jitter,
            ),
        }
    }
}

/// Split records into batches of at most `batch_size`
///
/// Blank addresses are dropped. Each id lands in at most one batch; a
/// repeated id keeps its first address.
pub fn create_batches(records: &[AddressRecord], batch_size: usize) -> Vec<BTreeMap<String, String>> {
    let batch_size = batch_size.max(1);
    let mut seen = HashSet::new();
    let mut duplicates = 0usize;

    let mut usable: Vec<(&str, &str)> = Vec::with_capacity(records.len());
    for record in records {
        if record.address.trim().is_empty() || record.id.trim().is_empty() {
            continue;
        }
        if seen.insert(record.id.as_str()) {
            usable.push((record.id.as_str(), record.address.as_str()));
        } else {
            duplicates += 1;
        }
    }

    if duplicates > 0 {
        warn!(duplicates, "Repeated ids in address input, keeping first occurrence");
    }

    let batches: Vec<BTreeMap<String, String>> = usable
        .chunks(batch_size)
        .map(|chunk| {
            chunk
                .iter()
                .map(|(id, addr)| (id.to_string(), addr.to_string()))
                .collect()
        })
        .collect();

    info!(
        batches = batches.len(),
        addresses = usable.len(),
        "Created address batches"
    );
    batches
}

/// Pretty-printed JSON object of the batch, non-ASCII kept as-is
pub fn format_addresses_for_prompt(addresses: &BTreeMap<String, String>) -> String {
    // A map of strings always serializes
    serde_json::to_string_pretty(addresses).unwrap_or_default()
}

/// Strip markdown fences and whitespace, then require valid JSON
pub fn clean_json_response(text: &str) -> Result<String, serde_json::Error> {
    let cleaned = text.replace("```json", "").replace("```", "");
    let cleaned = cleaned.trim();
    serde_json::from_str::<serde_json::Value>(cleaned)?;
    Ok(cleaned.to_string())
}

/// Write a batch file atomically, returning its final path
pub fn save_batch_result(result: &BatchResult, output_dir: &Path) -> GeoResult<PathBuf> {
    std::fs::create_dir_all(output_dir)?;

    let final_path = output_dir.join(result.file_name());
    let temp_path = output_dir.join(format!(".{}.tmp", result.file_name()));

    std::fs::write(&temp_path, serde_json::to_string_pretty(result)?)?;
    std::fs::rename(&temp_path, &final_path)?;

    debug!(batch_id = result.batch_id, path = %final_path.display(), "Saved batch result");
    Ok(final_path)
}

fn batch_files(output_dir: &Path) -> GeoResult<Vec<PathBuf>> {
    if !output_dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(output_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("batch_") && n.ends_with(".json"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

fn batch_id_from_name(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix("batch_")?
        .split('_')
        .next()?
        .parse()
        .ok()
}

fn is_success_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with("_success.json"))
        .unwrap_or(false)
}

/// State of an existing batch directory
#[derive(Debug, Default)]
pub struct BatchScan {
    /// Ids already covered by a success file
    pub completed_ids: HashSet<String>,
    /// First unused batch id
    pub next_batch_id: usize,
}

/// Inspect previously written batch files
pub fn scan_batches(output_dir: &Path) -> GeoResult<BatchScan> {
    let mut scan = BatchScan::default();

    for path in batch_files(output_dir)? {
        if let Some(id) = batch_id_from_name(&path) {
            scan.next_batch_id = scan.next_batch_id.max(id + 1);
        }
        if !is_success_file(&path) {
            continue;
        }
        match std::fs::read_to_string(&path)
            .map_err(GeoError::from)
            .and_then(|text| serde_json::from_str::<BatchResult>(&text).map_err(GeoError::from))
        {
            Ok(batch) => scan.completed_ids.extend(batch.input_addresses.into_keys()),
            Err(e) => warn!(path = %path.display(), error = %e, "Unreadable batch file ignored"),
        }
    }

    Ok(scan)
}

/// Delete every batch file in `output_dir`
pub fn clear_batches(output_dir: &Path) -> GeoResult<usize> {
    let files = batch_files(output_dir)?;
    for path in &files {
        std::fs::remove_file(path)?;
    }
    info!(removed = files.len(), dir = %output_dir.display(), "Cleared batch files");
    Ok(files.len())
}

/// Flatten all success files into normalized addresses
///
/// Malformed files or entries are logged and skipped. An id already taken
/// from an earlier file is not repeated.
pub fn compile_results(output_dir: &Path) -> GeoResult<Vec<NormalizedAddress>> {
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let success_files: Vec<PathBuf> = batch_files(output_dir)?
        .into_iter()
        .filter(|p| is_success_file(p))
        .collect();

    debug!(files = success_files.len(), "Compiling batch results");

    for path in success_files {
        let batch: BatchResult = match std::fs::read_to_string(&path)
            .map_err(GeoError::from)
            .and_then(|text| serde_json::from_str(&text).map_err(GeoError::from))
        {
            Ok(batch) => batch,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Invalid batch file");
                continue;
            }
        };

        let Some(response) = batch.response.as_deref() else {
            error!(path = %path.display(), "Missing response field in batch file");
            continue;
        };

        let parsed: serde_json::Value = match serde_json::from_str(response) {
            Ok(value) => value,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Response is not valid JSON");
                continue;
            }
        };

        let Some(entries) = parsed.as_object() else {
            error!(path = %path.display(), "Response is not a JSON object");
            continue;
        };

        for (id, entry) in entries {
            let raw = batch.input_addresses.get(id).map(String::as_str);
            match NormalizedAddress::from_model_entry(id, raw, entry) {
                Some(address) => {
                    if seen.insert(address.id.clone()) {
                        records.push(address);
                    } else {
                        warn!(id = %id, path = %path.display(), "Id already compiled, skipping");
                    }
                }
                None => warn!(id = %id, path = %path.display(), "Skipping non-object result"),
            }
        }
    }

    if records.is_empty() {
        warn!("No valid records found in batch files");
    } else {
        info!(records = records.len(), "Compiled batch results");
    }
    Ok(records)
}

/// Sends address batches to a [`TextGenerator`] and persists the outcomes
pub struct BatchAnnotator {
    generator: Arc<dyn TextGenerator>,
    rate_limiter: Arc<RateLimiter>,
    template: String,
    output_dir: PathBuf,
    settings: AnnotatorSettings,
}

impl BatchAnnotator {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        rate_limiter: Arc<RateLimiter>,
        template: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        settings: AnnotatorSettings,
    ) -> GeoResult<Self> {
        let template = template.into();
        check_template(&template)?;
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;

        Ok(Self {
            generator,
            rate_limiter,
            template,
            output_dir,
            settings,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Annotate every record not already covered by a success file
    ///
    /// Batches run concurrently; admission to the model is serialized by the
    /// rate limiter. Each outcome is written as soon as its batch finishes.
    pub async fn run(&self, records: &[AddressRecord]) -> GeoResult<BatchSummary> {
        let scan = scan_batches(&self.output_dir)?;
        let pending: Vec<AddressRecord> = records
            .iter()
            .filter(|r| !scan.completed_ids.contains(&r.id))
            .cloned()
            .collect();
        let skipped_ids = records.len() - pending.len();
        if skipped_ids > 0 {
            info!(skipped_ids, "Resuming: ids with existing results skipped");
        }

        let batches = create_batches(&pending, self.settings.batch_size);
        let mut summary = BatchSummary {
            total_batches: batches.len(),
            skipped_ids,
            ..Default::default()
        };

        if batches.is_empty() {
            warn!("No addresses found to process");
            return Ok(summary);
        }

        info!(
            batches = batches.len(),
            first_batch_id = scan.next_batch_id,
            model = self.generator.model(),
            min_interval_ms = self.rate_limiter.min_interval().as_millis() as u64,
            "Processing address batches"
        );

        let mut in_flight: FuturesUnordered<_> = batches
            .into_iter()
            .enumerate()
            .map(|(offset, batch)| self.process_batch(scan.next_batch_id + offset, batch))
            .collect();

        while let Some(result) = in_flight.next().await {
            if let Err(e) = save_batch_result(&result, &self.output_dir) {
                // Keep draining so the other batches still get written
                error!(batch_id = result.batch_id, error = %e, "Failed to save batch result");
                summary.failed_batches += 1;
                continue;
            }
            match result.status {
                BatchStatus::Success => summary.successful_batches += 1,
                BatchStatus::Error => summary.failed_batches += 1,
            }
        }

        info!(
            successful = summary.successful_batches,
            failed = summary.failed_batches,
            total = summary.total_batches,
            "Completed address batches"
        );
        Ok(summary)
    }

    async fn process_batch(&self, batch_id: usize, addresses: BTreeMap<String, String>) -> BatchResult {
        debug!(batch_id, addresses = addresses.len(), "Processing batch");

        let prompt = fill_template(&self.template, &format_addresses_for_prompt(&addresses));
        let operation = format!("llm batch {}", batch_id);

        let generator = self.generator.as_ref();
        let limiter = self.rate_limiter.as_ref();
        let prompt = prompt.as_str();

        let response = retry_with_backoff(
            &operation,
            &self.settings.retry,
            LlmError::is_retryable,
            move || async move {
                let _permit = limiter.permit().await;
                generator.generate(prompt).await
            },
        )
        .await;

        match response {
            Ok(text) => match clean_json_response(&text) {
                Ok(cleaned) => {
                    debug!(batch_id, "Batch succeeded");
                    BatchResult::success(batch_id, addresses, cleaned)
                }
                Err(e) => {
                    error!(batch_id, error = %e, "Model returned invalid JSON");
                    BatchResult::failure(batch_id, addresses, format!("invalid JSON response: {}", e))
                }
            },
            Err(e) => {
                error!(batch_id, error = %e, "Batch failed");
                BatchResult::failure(batch_id, addresses, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn records(pairs: &[(&str, &str)]) -> Vec<AddressRecord> {
        pairs.iter().map(|(id, a)| AddressRecord::new(*id, *a)).collect()
    }

    #[test]
    fn test_create_batches_drops_blank_and_repeated() {
        let input = records(&[
            ("1", "Calle 1"),
            ("2", "   "),
            ("3", "Calle 3"),
            ("1", "Calle 1 bis"),
            ("4", "Calle 4"),
        ]);
        let batches = create_batches(&input, 2);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[0].get("1").map(String::as_str), Some("Calle 1"));
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_format_keeps_non_ascii() {
        let mut batch = BTreeMap::new();
        batch.insert("7".to_string(), "Cra 5, Ibagué".to_string());
        let text = format_addresses_for_prompt(&batch);
        assert!(text.contains("Ibagué"));
        assert!(text.contains('\n'));
    }

    #[test]
    fn test_clean_json_response() {
        let raw = "```json\n{\"1\": {\"city\": \"Cali\"}}\n```\n";
        let cleaned = clean_json_response(raw).unwrap();
        assert_eq!(cleaned, "{\"1\": {\"city\": \"Cali\"}}");
        // Idempotent
        assert_eq!(clean_json_response(&cleaned).unwrap(), cleaned);

        assert!(clean_json_response("Sure! Here is the JSON").is_err());
    }

    #[test]
    fn test_batch_file_naming_and_scan() {
        let temp_dir = TempDir::new().unwrap();
        let mut input = BTreeMap::new();
        input.insert("9001".to_string(), "Calle 1".to_string());

        let ok = BatchResult::success(3, input.clone(), "{}".to_string());
        let failed = BatchResult::failure(7, input, "boom".to_string());
        assert_eq!(ok.file_name(), "batch_0003_success.json");
        assert_eq!(failed.file_name(), "batch_0007_error.json");

        save_batch_result(&ok, temp_dir.path()).unwrap();
        save_batch_result(&failed, temp_dir.path()).unwrap();

        let scan = scan_batches(temp_dir.path()).unwrap();
        assert_eq!(scan.next_batch_id, 8);
        assert!(scan.completed_ids.contains("9001"));

        // No temp files left behind
        let leftovers = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);

        assert_eq!(clear_batches(temp_dir.path()).unwrap(), 2);
        assert_eq!(scan_batches(temp_dir.path()).unwrap().next_batch_id, 0);
    }

    #[test]
    fn test_compile_skips_malformed_files() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();

        let mut input = BTreeMap::new();
        input.insert("1".to_string(), "cra 7 45 10 bogota".to_string());
        input.insert("2".to_string(), "una tienda".to_string());
        let response = r#"{
            "1": {"formatted_address": "Carrera 7 #45-10", "country": "CO", "area": "Cundinamarca", "city": "Bogotá"},
            "2": {"formatted_address": null, "country": null, "area": null, "city": null},
            "3": "not an object"
        }"#;
        save_batch_result(&BatchResult::success(0, input, response.to_string()), dir).unwrap();

        // Not JSON at all
        std::fs::write(dir.join("batch_0001_success.json"), "{{{").unwrap();
        // Success file without response
        std::fs::write(
            dir.join("batch_0002_success.json"),
            r#"{"batch_id":2,"status":"success","input_addresses":{},"processed_count":0}"#,
        )
        .unwrap();
        // Error files are ignored
        save_batch_result(&BatchResult::failure(3, BTreeMap::new(), "x".into()), dir).unwrap();

        let compiled = compile_results(dir).unwrap();
        assert_eq!(compiled.len(), 2);

        let first = compiled.iter().find(|a| a.id == "1").unwrap();
        assert_eq!(first.raw_address.as_deref(), Some("cra 7 45 10 bogota"));
        assert_eq!(first.city.as_deref(), Some("Bogotá"));

        let second = compiled.iter().find(|a| a.id == "2").unwrap();
        assert!(!second.is_resolved());
    }
}
