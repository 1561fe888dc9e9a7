//! Human-readable region labels for cells.
//!
//! The table is static configuration. Boxes may overlap; the first matching
//! entry wins, so narrower regions are listed before the broad ones.

use crate::geohash::GeoCell;

/// Label used when no region matches.
pub const GLOBAL_LABEL: &str = "Global";

/// A named bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub name: &'static str,
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Region {
    const fn new(name: &'static str, min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            name,
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}

/// Ordered region table, highest priority first.
pub static REGIONS: &[Region] = &[
    Region::new("Arctic", 75.0, 90.0, -180.0, 180.0),
    Region::new("Antarctica", -90.0, -60.0, -180.0, 180.0),
    Region::new("Middle East", 12.0, 42.0, 25.0, 63.0),
    Region::new("Central America & Caribbean", 5.0, 25.0, -120.0, -58.0),
    Region::new("North America", 15.0, 75.0, -170.0, -50.0),
    Region::new("South America", -60.0, 15.0, -92.0, -30.0),
    Region::new("Europe", 35.0, 75.0, -25.0, 45.0),
    Region::new("Africa", -40.0, 37.0, -20.0, 55.0),
    Region::new("South Asia", 5.0, 38.0, 60.0, 92.0),
    Region::new("Southeast Asia", -11.0, 23.0, 92.0, 141.0),
    Region::new("East Asia", 18.0, 55.0, 92.0, 150.0),
    Region::new("Central Asia & Russia", 35.0, 75.0, 45.0, 180.0),
    Region::new("Oceania", -50.0, -10.0, 110.0, 180.0),
    Region::new("Pacific", -60.0, 60.0, 150.0, 180.0),
    Region::new("Pacific", -60.0, 60.0, -180.0, -120.0),
    Region::new("Atlantic", -60.0, 60.0, -50.0, -20.0),
    Region::new("Indian Ocean", -60.0, 5.0, 55.0, 110.0),
];

/// Region name for a coordinate.
pub fn label_for_point(lat: f64, lon: f64) -> &'static str {
    REGIONS
        .iter()
        .find(|region| region.contains(lat, lon))
        .map(|region| region.name)
        .unwrap_or(GLOBAL_LABEL)
}

/// Region name for a cell, matched on the cell's centre.
pub fn label_for(cell: &GeoCell) -> &'static str {
    let (lat, lon) = cell.center();
    label_for_point(lat, lon)
}
