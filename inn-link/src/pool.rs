//! Combined coordinate pool keyed by tax id

use crate::records::Location;
use std::collections::HashMap;

/// Locations from every geocoded source, one per tax id
///
/// Sources are inserted in priority order. A later insert only replaces an
/// existing entry that has no coordinates.
#[derive(Debug, Clone, Default)]
pub struct CoordinatePool {
    locations: HashMap<String, Location>,
}

impl CoordinatePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, nit: impl Into<String>, location: Location) {
        let nit = nit.into();
        match self.locations.get(&nit) {
            Some(existing) if existing.has_point() || !location.has_point() => {}
            _ => {
                self.locations.insert(nit, location);
            }
        }
    }

    pub fn get(&self, nit: &str) -> Option<&Location> {
        self.locations.get(nit)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Point;

    fn located(lat: f64) -> Location {
        Location {
            gmaps_address: Some(format!("at {}", lat)),
            point: Some(Point::new(lat, -74.0)),
        }
    }

    #[test]
    fn test_first_located_entry_wins() {
        let mut pool = CoordinatePool::new();
        pool.insert("9", located(1.0));
        pool.insert("9", located(2.0));
        assert_eq!(pool.get("9"), Some(&located(1.0)));
    }

    #[test]
    fn test_unlocated_entry_is_upgraded() {
        let mut pool = CoordinatePool::new();
        pool.insert("9", Location::default());
        pool.insert("9", located(2.0));
        assert_eq!(pool.get("9"), Some(&located(2.0)));
        assert_eq!(pool.len(), 1);
    }
}
