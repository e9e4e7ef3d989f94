//! Cross-check of Google and Nominatim coordinates

use crate::error::GeoResult;
use inn_common::CsvTable;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Degrees within which two coordinates count as the same point
pub const COORD_TOLERANCE: f64 = 1e-4;

/// Provider columns appended to the address table
const COMPARISON_COLUMNS: [&str; 7] = [
    "google_lat",
    "google_lng",
    "google_address",
    "nom_lat",
    "nom_lng",
    "nom_address",
    "coord_match",
];

#[derive(Debug, Clone, Default, PartialEq)]
struct ProviderPoint {
    latitude: Option<f64>,
    longitude: Option<f64>,
    address: Option<String>,
}

impl ProviderPoint {
    fn coords(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }
}

fn parse_number(value: Option<&str>) -> Option<f64> {
    value.and_then(|v| v.parse::<f64>().ok()).filter(|v| v.is_finite())
}

fn index_points(table: &CsvTable, address_column: &str) -> GeoResult<HashMap<String, ProviderPoint>> {
    table.require_column("id")?;
    let mut points = HashMap::new();
    for row in &table.rows {
        let Some(id) = table.get(row, "id") else {
            continue;
        };
        points.entry(id.to_string()).or_insert_with(|| ProviderPoint {
            latitude: parse_number(table.get(row, "latitude")),
            longitude: parse_number(table.get(row, "longitude")),
            address: table.get(row, address_column).map(str::to_string),
        });
    }
    Ok(points)
}

/// Both pairs present and within [`COORD_TOLERANCE`] on each axis
pub fn coordinates_match(a: Option<(f64, f64)>, b: Option<(f64, f64)>) -> bool {
    match (a, b) {
        (Some((lat_a, lng_a)), Some((lat_b, lng_b))) => {
            (lat_a - lat_b).abs() < COORD_TOLERANCE && (lng_a - lng_b).abs() < COORD_TOLERANCE
        }
        _ => false,
    }
}

fn format_number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Left-join both coordinate tables onto the addresses by `id`
///
/// Returns the merged table and the number of matching rows.
pub fn compare_coordinates(
    addresses: &CsvTable,
    google: &CsvTable,
    nominatim: &CsvTable,
) -> GeoResult<(CsvTable, usize)> {
    addresses.require_column("id")?;
    let google_points = index_points(google, "gmaps_address")?;
    let nominatim_points = index_points(nominatim, "nominatim_address")?;

    let mut headers = addresses.headers.clone();
    headers.extend(COMPARISON_COLUMNS.iter().map(|c| c.to_string()));
    let mut merged = CsvTable::new("comparison", headers);

    let missing = ProviderPoint::default();
    let mut matches = 0usize;

    for row in &addresses.rows {
        let id = addresses.get(row, "id").unwrap_or_default();
        let g = google_points.get(id).unwrap_or(&missing);
        let n = nominatim_points.get(id).unwrap_or(&missing);

        let is_match = coordinates_match(g.coords(), n.coords());
        if is_match {
            matches += 1;
        }

        let mut cells = row.clone();
        cells.extend([
            format_number(g.latitude),
            format_number(g.longitude),
            g.address.clone().unwrap_or_default(),
            format_number(n.latitude),
            format_number(n.longitude),
            n.address.clone().unwrap_or_default(),
            if is_match { "True" } else { "False" }.to_string(),
        ]);
        merged.push_row(cells);
    }

    info!(
        "{}/{} addresses have matching coordinates (±{} deg)",
        matches,
        merged.len(),
        COORD_TOLERANCE
    );
    Ok((merged, matches))
}

/// Read the three tables, compare and write the result
pub fn run_comparison(
    addresses_path: &Path,
    google_path: &Path,
    nominatim_path: &Path,
    output_path: &Path,
) -> GeoResult<usize> {
    let addresses = CsvTable::read(addresses_path)?;
    let google = CsvTable::read(google_path)?;
    let nominatim = CsvTable::read(nominatim_path)?;

    let (merged, matches) = compare_coordinates(&addresses, &google, &nominatim)?;
    merged.write(output_path)?;
    info!(path = %output_path.display(), "Merged comparison saved");
    Ok(matches)
}
