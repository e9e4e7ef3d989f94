//! Address geocoding
//!
//! [`AddressGeocoder`] resolves one structured address to a provider-formatted
//! address and a coordinate pair. [`geocode_batch`] runs many of them
//! concurrently with retry, checkpointing the results map to JSON every
//! `save_every` completions and once at the end.
//!
//! A provider answering "no result" is not an error: it yields an unresolved
//! [`GeocodeOutcome`]. Transport failures and malformed payloads are errors
//! and are retried.

use crate::error::{GeoError, GeoResult};
use crate::models::GeocodeRequest;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use inn_common::config::GeocodingConfig;
use inn_common::{retry_with_backoff, CsvTable, RateLimiter, RetryPolicy};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const GOOGLE_GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

/// Geocoding client errors
#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("API error {0}: {1}")]
    ApiError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    /// Provider-level transient status (e.g. OVER_QUERY_LIMIT)
    #[error("Provider status {0}")]
    ProviderStatus(String),
}

impl GeocodeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GeocodeError::ApiError(status, _) => !matches!(status, 400 | 401 | 403 | 404),
            _ => true,
        }
    }
}

/// Result of geocoding one address
///
/// Serialized shape is the checkpoint entry:
/// `{"gmaps_address": ..., "coords": [lat, lon] | null}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GeocodeOutcome {
    pub gmaps_address: Option<String>,
    pub coords: Option<[f64; 2]>,
}

impl GeocodeOutcome {
    pub fn unresolved() -> Self {
        Self::default()
    }

    pub fn resolved(address: Option<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            gmaps_address: address,
            coords: Some([latitude, longitude]),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.coords.is_some()
    }

    pub fn latitude(&self) -> Option<f64> {
        self.coords.map(|c| c[0])
    }

    pub fn longitude(&self) -> Option<f64> {
        self.coords.map(|c| c[1])
    }
}

/// Single-address geocoding provider
#[async_trait]
pub trait AddressGeocoder: Send + Sync {
    /// Provider name for logging
    fn service(&self) -> &'static str;

    async fn geocode(&self, request: &GeocodeRequest) -> Result<GeocodeOutcome, GeocodeError>;
}

/// Google component filter: country fixed to Colombia
pub fn components_filter(area: &str, city: &str) -> String {
    format!("country:CO|administrative_area:{}|locality:{}", area, city)
}

/// Request URL for a complete address, `None` otherwise
pub fn build_geocode_url(base_url: &str, request: &GeocodeRequest, api_key: &str) -> Option<Url> {
    let (Some(address), Some(_), Some(area), Some(city)) = (
        request.formatted_address.as_deref(),
        request.country.as_deref(),
        request.area.as_deref(),
        request.city.as_deref(),
    ) else {
        return None;
    };

    let components = components_filter(area, city);
    Url::parse_with_params(
        base_url,
        &[
            ("address", address),
            ("components", components.as_str()),
            ("key", api_key),
        ],
    )
    .ok()
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    status: String,
    #[serde(default)]
    results: Vec<GoogleResult>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleResult {
    formatted_address: Option<String>,
    geometry: GoogleGeometry,
}

#[derive(Debug, Deserialize)]
struct GoogleGeometry {
    location: GoogleLocation,
}

#[derive(Debug, Deserialize)]
struct GoogleLocation {
    lat: f64,
    lng: f64,
}

impl GoogleResponse {
    fn into_outcome(self) -> Result<GeocodeOutcome, GeocodeError> {
        match self.status.as_str() {
            "OK" => Ok(self
                .results
                .into_iter()
                .next()
                .map(|r| {
                    GeocodeOutcome::resolved(
                        r.formatted_address,
                        r.geometry.location.lat,
                        r.geometry.location.lng,
                    )
                })
                .unwrap_or_default()),
            "OVER_QUERY_LIMIT" | "UNKNOWN_ERROR" => Err(GeocodeError::ProviderStatus(self.status)),
            other => {
                warn!(
                    status = other,
                    message = self.error_message.as_deref().unwrap_or(""),
                    "Geocoding failed"
                );
                Ok(GeocodeOutcome::unresolved())
            }
        }
    }
}

/// Google Geocoding API client
pub struct GoogleGeocoder {
    http_client: reqwest::Client,
    api_key: String,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
}

impl GoogleGeocoder {
    pub fn new(
        api_key: String,
        rate_limiter: Arc<RateLimiter>,
        timeout: Duration,
    ) -> Result<Self, GeocodeError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("inn-geo/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| GeocodeError::NetworkError(e.to_string()))?;

        Ok(Self {
            http_client,
            api_key,
            base_url: GOOGLE_GEOCODE_URL.to_string(),
            rate_limiter,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl AddressGeocoder for GoogleGeocoder {
    fn service(&self) -> &'static str {
        "google"
    }

    async fn geocode(&self, request: &GeocodeRequest) -> Result<GeocodeOutcome, GeocodeError> {
        let Some(url) = build_geocode_url(&self.base_url, request, &self.api_key) else {
            return Ok(GeocodeOutcome::unresolved());
        };

        let _permit = self.rate_limiter.permit().await;

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| GeocodeError::NetworkError(e.to_string()))?;

        let status = response.status();

        if status == 429 {
            return Err(GeocodeError::RateLimitExceeded);
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(GeocodeError::ApiError(status.as_u16(), error_text));
        }

        let body: GoogleResponse = response
            .json()
            .await
            .map_err(|e| GeocodeError::ParseError(e.to_string()))?;

        body.into_outcome()
    }
}

/// id -> outcome, ordered by id
pub type CoordinateMap = BTreeMap<String, GeocodeOutcome>;

/// Concurrency, retry and checkpoint settings for [`geocode_batch`]
#[derive(Debug, Clone)]
pub struct BatchGeocodeSettings {
    pub max_concurrent: usize,
    pub save_every: usize,
    pub retry: RetryPolicy,
    pub checkpoint: Option<PathBuf>,
    /// Re-submit ids whose checkpointed outcome is unresolved
    pub retry_failed: bool,
}

impl BatchGeocodeSettings {
    /// `max_retries` retries after the first attempt, doubling from the
    /// initial delay without jitter
    pub fn from_config(config: &GeocodingConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent.max(1),
            save_every: config.save_every.max(1),
            retry: RetryPolicy::new(
                config.max_retries + 1,
                Duration::from_millis(config.initial_delay_ms),
                2.0,
                0.0,
            ),
            checkpoint: None,
            retry_failed: false,
        }
    }

    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }
}

/// Load a checkpoint; a missing file is an empty map
pub fn load_checkpoint(path: &Path) -> GeoResult<CoordinateMap> {
    if !path.exists() {
        return Ok(CoordinateMap::new());
    }
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| GeoError::Checkpoint {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Overwrite the checkpoint atomically
pub fn write_checkpoint(path: &Path, results: &CoordinateMap) -> GeoResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, serde_json::to_string_pretty(results)?)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Geocode every request not already settled by the checkpoint
///
/// Incomplete requests are recorded as unresolved without a provider call.
/// Results are collected by a single consumer as tasks finish; retries that
/// run out produce an unresolved outcome rather than an error.
pub async fn geocode_batch(
    geocoder: &dyn AddressGeocoder,
    requests: &[(String, GeocodeRequest)],
    settings: &BatchGeocodeSettings,
) -> GeoResult<CoordinateMap> {
    let mut results = match &settings.checkpoint {
        Some(path) => load_checkpoint(path)?,
        None => CoordinateMap::new(),
    };
    if !results.is_empty() {
        info!(entries = results.len(), "Resuming from geocoding checkpoint");
    }

    let mut pending = Vec::new();
    let mut incomplete = 0usize;
    for (id, request) in requests {
        match results.get(id) {
            Some(outcome) if outcome.is_resolved() || !settings.retry_failed => continue,
            _ => {}
        }
        if request.is_complete() {
            pending.push((id, request));
        } else {
            incomplete += 1;
            results.insert(id.clone(), GeocodeOutcome::unresolved());
        }
    }

    info!(
        service = geocoder.service(),
        pending = pending.len(),
        incomplete,
        total = requests.len(),
        max_concurrent = settings.max_concurrent,
        "Starting geocoding"
    );

    let semaphore = Semaphore::new(settings.max_concurrent.max(1));
    let semaphore = &semaphore;
    let retry = &settings.retry;
    let total_pending = pending.len();

    let mut in_flight: FuturesUnordered<_> = pending
        .into_iter()
        .map(|(id, request)| async move {
            let _slot = semaphore.acquire().await.ok();
            let operation = format!("geocode {}", id);
            let outcome = match retry_with_backoff(
                &operation,
                retry,
                GeocodeError::is_retryable,
                || geocoder.geocode(request),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(id = %id, error = %e, "All retries failed, recording as unresolved");
                    GeocodeOutcome::unresolved()
                }
            };
            (id, outcome)
        })
        .collect();

    let save_every = settings.save_every.max(1);
    let mut processed = 0usize;

    while let Some((id, outcome)) = in_flight.next().await {
        results.insert(id.clone(), outcome);
        processed += 1;

        if processed % save_every == 0 {
            info!(processed, total = total_pending, "Geocoding progress");
            if let Some(path) = &settings.checkpoint {
                match write_checkpoint(path, &results) {
                    Ok(()) => debug!(processed, path = %path.display(), "Checkpoint saved"),
                    Err(e) => warn!(error = %e, "Failed to write checkpoint"),
                }
            }
        }
    }

    if let Some(path) = &settings.checkpoint {
        match write_checkpoint(path, &results) {
            Ok(()) => info!(path = %path.display(), "Final checkpoint saved"),
            Err(e) => warn!(error = %e, "Failed to write final checkpoint"),
        }
    }

    let resolved = requests
        .iter()
        .filter(|(id, _)| results.get(id).map(GeocodeOutcome::is_resolved).unwrap_or(false))
        .count();
    info!(
        "Geocoding completed: {}/{} addresses successfully geocoded",
        resolved,
        requests.len()
    );

    Ok(results)
}

/// Build geocoding requests from a standardized-address table
///
/// The id column is `id` when present, otherwise `nit`.
pub fn requests_from_table(table: &CsvTable) -> GeoResult<Vec<(String, GeocodeRequest)>> {
    let id_column = if table.has_column("id") { "id" } else { "nit" };
    table.require_column(id_column)?;
    for column in ["formatted_address", "country", "area", "city"] {
        table.require_column(column)?;
    }

    Ok(table
        .rows
        .iter()
        .filter_map(|row| {
            let id = table.get(row, id_column)?.to_string();
            let request = GeocodeRequest {
                formatted_address: table.get(row, "formatted_address").map(str::to_string),
                country: table.get(row, "country").map(str::to_string),
                area: table.get(row, "area").map(str::to_string),
                city: table.get(row, "city").map(str::to_string),
            };
            Some((id, request))
        })
        .collect())
}

/// Write `id, {address_column}, latitude, longitude`
pub fn write_coordinates(path: &Path, address_column: &str, results: &CoordinateMap) -> GeoResult<()> {
    let mut table = CsvTable::new(
        path.display().to_string(),
        vec![
            "id".to_string(),
            address_column.to_string(),
            "latitude".to_string(),
            "longitude".to_string(),
        ],
    );
    for (id, outcome) in results {
        table.push_row(vec![
            id.clone(),
            outcome.gmaps_address.clone().unwrap_or_default(),
            outcome.latitude().map(|v| v.to_string()).unwrap_or_default(),
            outcome.longitude().map(|v| v.to_string()).unwrap_or_default(),
        ]);
    }
    table.write(path)?;
    info!(rows = table.len(), path = %path.display(), "Saved coordinates");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(city: Option<&str>) -> GeocodeRequest {
        GeocodeRequest {
            formatted_address: Some("Calle 4 #10-22, Centro".to_string()),
            country: Some("CO".to_string()),
            area: Some("Tolima".to_string()),
            city: city.map(str::to_string),
        }
    }

    #[test]
    fn test_components_filter() {
        assert_eq!(
            components_filter("Tolima", "Ibagué"),
            "country:CO|administrative_area:Tolima|locality:Ibagué"
        );
    }

    #[test]
    fn test_build_url_requires_all_components() {
        assert!(build_geocode_url(GOOGLE_GEOCODE_URL, &request(None), "k").is_none());

        let url = build_geocode_url(GOOGLE_GEOCODE_URL, &request(Some("Ibagué")), "k").unwrap();
        let params: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(params["address"], "Calle 4 #10-22, Centro");
        assert_eq!(params["components"], "country:CO|administrative_area:Tolima|locality:Ibagué");
        assert_eq!(params["key"], "k");
        assert!(!url.as_str().contains(' '));
    }

    #[test]
    fn test_response_interpretation() {
        let ok: GoogleResponse = serde_json::from_str(
            r#"{"status":"OK","results":[{"formatted_address":"Cl. 4 #10-22, Ibagué, Tolima, Colombia",
                "geometry":{"location":{"lat":4.4389,"lng":-75.2322}}}]}"#,
        )
        .unwrap();
        let outcome = ok.into_outcome().unwrap();
        assert_eq!(outcome.coords, Some([4.4389, -75.2322]));
        assert!(outcome.gmaps_address.unwrap().contains("Ibagué"));

        let zero: GoogleResponse =
            serde_json::from_str(r#"{"status":"ZERO_RESULTS","results":[]}"#).unwrap();
        assert_eq!(zero.into_outcome().unwrap(), GeocodeOutcome::unresolved());

        let busy: GoogleResponse =
            serde_json::from_str(r#"{"status":"OVER_QUERY_LIMIT"}"#).unwrap();
        assert!(matches!(busy.into_outcome(), Err(GeocodeError::ProviderStatus(_))));
    }

    #[test]
    fn test_checkpoint_entry_shape() {
        let mut map = CoordinateMap::new();
        map.insert("1".to_string(), GeocodeOutcome::resolved(Some("A".into()), 1.5, -2.5));
        map.insert("2".to_string(), GeocodeOutcome::unresolved());
        let json: serde_json::Value = serde_json::to_value(&map).unwrap();
        assert_eq!(json["1"]["coords"][0], 1.5);
        assert!(json["2"]["coords"].is_null());
        assert!(json["2"]["gmaps_address"].is_null());
    }

    #[test]
    fn test_requests_from_table_prefers_id_column() {
        let mut table = CsvTable::new(
            "rues_addresses.csv",
            ["nit", "formatted_address", "country", "area", "city"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        table.push_row(
            ["900", "Calle 1", "Colombia", "Quindío", "Armenia"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        table.push_row(vec!["901".to_string()]);

        let requests = requests_from_table(&table).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, "900");
        assert!(requests[0].1.is_complete());
        assert!(!requests[1].1.is_complete());
    }
}
