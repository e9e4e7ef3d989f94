//! OpenStreetMap Nominatim geocoder
//!
//! Free-text search used as a cross-check for the Google results. The public
//! instance allows one request per second and requires an identifying
//! User-Agent.

use crate::geocoder::{AddressGeocoder, GeocodeError, GeocodeOutcome};
use crate::models::GeocodeRequest;
use async_trait::async_trait;
use inn_common::RateLimiter;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const NOMINATIM_SEARCH_URL: &str = "https://nominatim.openstreetmap.org/search";

/// Nominatim allows one request per second
pub const NOMINATIM_CALLS_PER_SECOND: f64 = 1.0;

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    display_name: Option<String>,
    lat: String,
    lon: String,
}

/// `"{formatted}, {country}, {area}, {city}"`, skipping absent parts
///
/// `None` without a formatted address.
pub fn search_query(request: &GeocodeRequest) -> Option<String> {
    let address = request.formatted_address.as_deref()?;
    let parts: Vec<&str> = [
        Some(address),
        request.country.as_deref(),
        request.area.as_deref(),
        request.city.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect();
    Some(parts.join(", "))
}

fn place_outcome(place: NominatimPlace) -> Result<GeocodeOutcome, GeocodeError> {
    let lat: f64 = place
        .lat
        .parse()
        .map_err(|_| GeocodeError::ParseError(format!("invalid latitude '{}'", place.lat)))?;
    let lon: f64 = place
        .lon
        .parse()
        .map_err(|_| GeocodeError::ParseError(format!("invalid longitude '{}'", place.lon)))?;
    Ok(GeocodeOutcome::resolved(place.display_name, lat, lon))
}

/// Nominatim search client
pub struct NominatimGeocoder {
    http_client: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
}

impl NominatimGeocoder {
    pub fn new(
        user_agent: &str,
        rate_limiter: Arc<RateLimiter>,
        timeout: Duration,
    ) -> Result<Self, GeocodeError> {
        let http_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| GeocodeError::NetworkError(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: NOMINATIM_SEARCH_URL.to_string(),
            rate_limiter,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl AddressGeocoder for NominatimGeocoder {
    fn service(&self) -> &'static str {
        "nominatim"
    }

    async fn geocode(&self, request: &GeocodeRequest) -> Result<GeocodeOutcome, GeocodeError> {
        let Some(query) = search_query(request) else {
            return Ok(GeocodeOutcome::unresolved());
        };

        let _permit = self.rate_limiter.permit().await;

        tracing::debug!(query = %query, "Querying Nominatim");

        let response = self
            .http_client
            .get(&self.base_url)
            .query(&[
                ("q", query.as_str()),
                ("format", "jsonv2"),
                ("limit", "1"),
                ("countrycodes", "co"),
            ])
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

        let places: Vec<NominatimPlace> = response
            .json()
            .await
            .map_err(|e| GeocodeError::ParseError(e.to_string()))?;

        match places.into_iter().next() {
            Some(place) => place_outcome(place),
            None => Ok(GeocodeOutcome::unresolved()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_query() {
        let request = GeocodeRequest {
            formatted_address: Some("Carrera 18 #55-37".to_string()),
            country: Some("Colombia".to_string()),
            area: None,
            city: Some("Armenia".to_string()),
        };
        assert_eq!(
            search_query(&request).as_deref(),
            Some("Carrera 18 #55-37, Colombia, Armenia")
        );
        assert_eq!(search_query(&GeocodeRequest::default()), None);
    }

    #[test]
    fn test_place_parsing() {
        let places: Vec<NominatimPlace> = serde_json::from_str(
            r#"[{"display_name":"Armenia, Quindío, Colombia","lat":"4.5339","lon":"-75.6811"}]"#,
        )
        .unwrap();
        let outcome = place_outcome(places.into_iter().next().unwrap()).unwrap();
        assert_eq!(outcome.coords, Some([4.5339, -75.6811]));

        let bad = NominatimPlace {
            display_name: None,
            lat: "north".to_string(),
            lon: "0".to_string(),
        };
        assert!(matches!(place_outcome(bad), Err(GeocodeError::ParseError(_))));
    }

    #[test]
    fn test_client_creation() {
        let limiter = Arc::new(RateLimiter::new(NOMINATIM_CALLS_PER_SECOND).unwrap());
        let client = NominatimGeocoder::new("inn-geo-test", limiter, Duration::from_secs(10));
        assert!(client.is_ok());
        assert_eq!(client.unwrap().service(), "nominatim");
    }
}
