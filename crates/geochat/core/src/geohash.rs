//! Geohash codec for spatial channel identifiers.
//!
//! A cell is built by recursively bisecting the longitude and latitude ranges,
//! longitude first, and packing five decisions into each base-32 symbol. Every
//! cell is therefore a prefix of the cells of the same point at finer
//! precisions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Base-32 alphabet used by geohash (no `a`, `i`, `l`, `o`).
pub const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Finest precision supported. Beyond this, f64 bisection stops adding information.
pub const MAX_PRECISION: usize = 12;

/// Default channel precision (roughly 20-40 km cells).
pub const DEFAULT_PRECISION: usize = 4;

/// Errors produced while parsing a geohash string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeohashError {
    #[error("geohash is empty")]
    Empty,

    #[error("geohash has {0} symbols, at most {MAX_PRECISION} are supported")]
    TooLong(usize),

    #[error("invalid geohash symbol {symbol:?} at position {position}")]
    InvalidSymbol { symbol: char, position: usize },
}

/// A fixed-precision geohash cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GeoCell(String);

/// Rectangular latitude/longitude region covered by a cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Midpoint of the box as `(lat, lon)`.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }

    /// Inclusive containment test.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    /// Height and width in degrees.
    pub fn size(&self) -> (f64, f64) {
        (self.max_lat - self.min_lat, self.max_lon - self.min_lon)
    }
}

fn symbol_index(symbol: u8) -> Option<u8> {
    BASE32.iter().position(|&s| s == symbol).map(|i| i as u8)
}

/// Encode a coordinate into a cell of the given precision.
///
/// Latitude must lie in `[-90, 90]` and longitude in `[-180, 180]`; anything
/// else is a caller bug. Precision is clamped to `1..=MAX_PRECISION`.
pub fn encode(lat: f64, lon: f64, precision: usize) -> GeoCell {
    debug_assert!((-90.0..=90.0).contains(&lat), "latitude out of range: {lat}");
    debug_assert!((-180.0..=180.0).contains(&lon), "longitude out of range: {lon}");

    let precision = precision.clamp(1, MAX_PRECISION);
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut out = String::with_capacity(precision);
    let mut even = true;
    let mut bits = 0;
    let mut symbol = 0usize;

    while out.len() < precision {
        let (range, value) = if even {
            (&mut lon_range, lon)
        } else {
            (&mut lat_range, lat)
        };
        let mid = (range.0 + range.1) / 2.0;
        symbol <<= 1;
        if value >= mid {
            symbol |= 1;
            range.0 = mid;
        } else {
            range.1 = mid;
        }
        even = !even;

        bits += 1;
        if bits == 5 {
            out.push(BASE32[symbol] as char);
            bits = 0;
            symbol = 0;
        }
    }

    GeoCell(out)
}

/// Bounding box covered by a cell.
pub fn bounds(cell: &GeoCell) -> BoundingBox {
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut even = true;

    for byte in cell.0.bytes() {
        // GeoCell only holds alphabet symbols.
        let index = symbol_index(byte).unwrap_or(0);
        for shift in (0..5).rev() {
            let range = if even {
                &mut lon_range
            } else {
                &mut lat_range
            };
            let mid = (range.0 + range.1) / 2.0;
            if (index >> shift) & 1 == 1 {
                range.0 = mid;
            } else {
                range.1 = mid;
            }
            even = !even;
        }
    }

    BoundingBox {
        min_lat: lat_range.0,
        max_lat: lat_range.1,
        min_lon: lon_range.0,
        max_lon: lon_range.1,
    }
}

/// Centre point `(lat, lon)` of a cell. Lossy: this is not the encoded input.
pub fn decode(cell: &GeoCell) -> (f64, f64) {
    bounds(cell).center()
}

/// Parse and decode a raw geohash string of any length.
///
/// Every symbol is validated, but only the first `MAX_PRECISION` are decoded;
/// later symbols move the centre by less than a few centimetres.
pub fn decode_str(geohash: &str) -> Result<(f64, f64), GeohashError> {
    let trimmed = geohash.trim();
    let Some((cut, _)) = trimmed.char_indices().nth(MAX_PRECISION) else {
        return Ok(decode(&GeoCell::parse(trimmed)?));
    };
    for (offset, symbol) in trimmed[cut..].chars().enumerate() {
        let lower = symbol.to_ascii_lowercase();
        if !lower.is_ascii() || symbol_index(lower as u8).is_none() {
            return Err(GeohashError::InvalidSymbol {
                symbol: lower,
                position: MAX_PRECISION + offset,
            });
        }
    }
    Ok(decode(&GeoCell::parse(&trimmed[..cut])?))
}

impl GeoCell {
    /// Parse a geohash string, normalising to lowercase.
    pub fn parse(geohash: &str) -> Result<Self, GeohashError> {
        let normalized = geohash.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(GeohashError::Empty);
        }
        if normalized.len() > MAX_PRECISION {
            return Err(GeohashError::TooLong(normalized.chars().count()));
        }
        for (position, symbol) in normalized.chars().enumerate() {
            if !symbol.is_ascii() || symbol_index(symbol as u8).is_none() {
                return Err(GeohashError::InvalidSymbol { symbol, position });
            }
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of symbols in the cell.
    pub fn precision(&self) -> usize {
        self.0.len()
    }

    /// The enclosing cell one precision coarser, if any.
    pub fn parent(&self) -> Option<GeoCell> {
        if self.0.len() <= 1 {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_string()))
    }

    /// All coarser enclosing cells, finest first.
    pub fn ancestors(&self) -> Vec<GeoCell> {
        (1..self.0.len())
            .rev()
            .map(|len| Self(self.0[..len].to_string()))
            .collect()
    }

    /// Truncate to a coarser precision; finer requests return the cell unchanged.
    pub fn truncate(&self, precision: usize) -> GeoCell {
        let precision = precision.clamp(1, self.0.len());
        Self(self.0[..precision].to_string())
    }

    /// Whether `other` lies inside this cell.
    pub fn contains(&self, other: &GeoCell) -> bool {
        other.0.starts_with(&self.0)
    }

    pub fn bounds(&self) -> BoundingBox {
        bounds(self)
    }

    pub fn center(&self) -> (f64, f64) {
        decode(self)
    }
}

impl fmt::Display for GeoCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GeoCell {
    type Err = GeohashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for GeoCell {
    type Error = GeohashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<GeoCell> for String {
    fn from(cell: GeoCell) -> Self {
        cell.0
    }
}

impl AsRef<str> for GeoCell {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
