//! Integration tests for concurrent geocoding with checkpoints

use async_trait::async_trait;
use inn_common::{CsvTable, RetryPolicy};
use inn_geo::geocoder::{
    load_checkpoint, write_checkpoint, write_coordinates, BatchGeocodeSettings, CoordinateMap,
    GeocodeError,
};
use inn_geo::{geocode_batch, AddressGeocoder, GeocodeOutcome, GeocodeRequest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// Resolves known cities to fixed points, everything else to no match
struct CityGeocoder {
    points: HashMap<&'static str, (f64, f64)>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Cities that fail with a retryable error this many times before answering
    flaky: Mutex<HashMap<String, usize>>,
    delay: Duration,
}

impl CityGeocoder {
    fn new() -> Self {
        let points = HashMap::from([
            ("Bogotá", (4.711, -74.0721)),
            ("Medellín", (6.2442, -75.5812)),
            ("Cali", (3.4516, -76.532)),
        ]);
        Self {
            points,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            flaky: Mutex::new(HashMap::new()),
            delay: Duration::from_millis(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressGeocoder for CityGeocoder {
    fn service(&self) -> &'static str {
        "city-table"
    }

    async fn geocode(&self, request: &GeocodeRequest) -> Result<GeocodeOutcome, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let city = request.city.clone().unwrap_or_default();
        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(&city) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(GeocodeError::ProviderStatus("UNKNOWN_ERROR".to_string()));
                }
            }
        }

        Ok(match self.points.get(city.as_str()) {
            Some((lat, lon)) => GeocodeOutcome::resolved(
                request.formatted_address.as_ref().map(|a| format!("{}, {}, Colombia", a, city)),
                *lat,
                *lon,
            ),
            None => GeocodeOutcome::unresolved(),
        })
    }
}

fn request(city: &str) -> GeocodeRequest {
    GeocodeRequest {
        formatted_address: Some("Calle 10 #5-20".to_string()),
        country: Some("CO".to_string()),
        area: Some("Somewhere".to_string()),
        city: Some(city.to_string()),
    }
}

fn settings(max_concurrent: usize) -> BatchGeocodeSettings {
    BatchGeocodeSettings {
        max_concurrent,
        save_every: 2,
        retry: RetryPolicy::new(3, Duration::from_millis(1), 2.0, 0.0),
        checkpoint: None,
        retry_failed: false,
    }
}

#[tokio::test]
async fn test_complete_requests_resolved_and_checkpointed() {
    let temp_dir = TempDir::new().unwrap();
    let checkpoint = temp_dir.path().join("checkpoint.json");
    let geocoder = CityGeocoder::new();

    let mut incomplete = request("Cali");
    incomplete.area = None;
    let requests = vec![
        ("1".to_string(), request("Bogotá")),
        ("2".to_string(), request("Medellín")),
        ("3".to_string(), request("Atlantis")),
        ("4".to_string(), incomplete),
    ];

    let results = geocode_batch(&geocoder, &requests, &settings(4).with_checkpoint(&checkpoint))
        .await
        .unwrap();

    assert_eq!(results.len(), 4);
    assert_eq!(results["1"].coords, Some([4.711, -74.0721]));
    assert!(results["2"].is_resolved());
    assert!(!results["3"].is_resolved());
    assert_eq!(results["4"], GeocodeOutcome::unresolved());
    // Incomplete request never reaches the provider
    assert_eq!(geocoder.calls(), 3);

    let saved = load_checkpoint(&checkpoint).unwrap();
    assert_eq!(saved, results);
}

#[tokio::test]
async fn test_resume_skips_settled_ids() {
    let temp_dir = TempDir::new().unwrap();
    let checkpoint = temp_dir.path().join("checkpoint.json");

    let mut previous = CoordinateMap::new();
    previous.insert("1".to_string(), GeocodeOutcome::resolved(None, 1.0, 2.0));
    previous.insert("2".to_string(), GeocodeOutcome::unresolved());
    write_checkpoint(&checkpoint, &previous).unwrap();

    let requests = vec![
        ("1".to_string(), request("Bogotá")),
        ("2".to_string(), request("Cali")),
        ("3".to_string(), request("Medellín")),
    ];

    let geocoder = CityGeocoder::new();
    let results = geocode_batch(&geocoder, &requests, &settings(2).with_checkpoint(&checkpoint))
        .await
        .unwrap();

    // Only the new id is submitted
    assert_eq!(geocoder.calls(), 1);
    assert_eq!(results["1"].coords, Some([1.0, 2.0]));
    assert!(!results["2"].is_resolved());
    assert!(results["3"].is_resolved());

    let geocoder = CityGeocoder::new();
    let mut retry = settings(2).with_checkpoint(&checkpoint);
    retry.retry_failed = true;
    let results = geocode_batch(&geocoder, &requests, &retry).await.unwrap();

    assert_eq!(geocoder.calls(), 1);
    assert_eq!(results["2"].coords, Some([3.4516, -76.532]));
    assert_eq!(results["1"].coords, Some([1.0, 2.0]));
}

#[tokio::test]
async fn test_in_flight_requests_bounded() {
    let geocoder = CityGeocoder {
        delay: Duration::from_millis(20),
        ..CityGeocoder::new()
    };
    let requests: Vec<(String, GeocodeRequest)> =
        (0..12).map(|i| (i.to_string(), request("Cali"))).collect();

    let results = geocode_batch(&geocoder, &requests, &settings(3)).await.unwrap();

    assert_eq!(results.len(), 12);
    assert_eq!(geocoder.calls(), 12);
    let peak = geocoder.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {} exceeded bound", peak);
    assert!(peak >= 2, "requests did not overlap");
}

#[tokio::test]
async fn test_retryable_errors_then_exhaustion() {
    let geocoder = CityGeocoder::new();
    geocoder
        .flaky
        .lock()
        .unwrap()
        .extend([("Cali".to_string(), 1), ("Bogotá".to_string(), 10)]);

    let requests = vec![
        ("cali".to_string(), request("Cali")),
        ("bogota".to_string(), request("Bogotá")),
    ];
    let results = geocode_batch(&geocoder, &requests, &settings(1)).await.unwrap();

    assert!(results["cali"].is_resolved());
    assert_eq!(results["bogota"], GeocodeOutcome::unresolved());
    // 2 attempts for Cali, 3 for Bogotá
    assert_eq!(geocoder.calls(), 5);
}

#[tokio::test]
async fn test_coordinates_csv_columns() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("coords.csv");

    let mut results = CoordinateMap::new();
    results.insert(
        "7".to_string(),
        GeocodeOutcome::resolved(Some("Cra 1, Pasto".to_string()), 1.2136, -77.2811),
    );
    results.insert("8".to_string(), GeocodeOutcome::unresolved());
    write_coordinates(&path, "gmaps_address", &results).unwrap();

    let table = CsvTable::read(&path).unwrap();
    assert_eq!(table.headers, vec!["id", "gmaps_address", "latitude", "longitude"]);
    assert_eq!(table.len(), 2);
    assert_eq!(table.get(&table.rows[0], "latitude"), Some("1.2136"));
    assert_eq!(table.get(&table.rows[0], "gmaps_address"), Some("Cra 1, Pasto"));
    assert_eq!(table.get(&table.rows[1], "latitude"), None);
}
