//! Channel routing: which cells a client listens on.

use crate::config::GeoChatConfig;
use geochat_core::{GeoCell, MAX_PRECISION, encode, label_for};

/// The cells a joined channel covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRoute {
    /// The client's own cell; also the channel key
    pub key: GeoCell,
    /// Cells whose events belong to the channel, `key` first
    pub cells: Vec<GeoCell>,
}

impl ChannelRoute {
    pub fn cell_strings(&self) -> Vec<String> {
        self.cells.iter().map(|c| c.as_str().to_string()).collect()
    }

    /// Region name for display.
    pub fn label(&self) -> &'static str {
        label_for(&self.key)
    }
}

/// Maps a position to a channel route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRouter {
    default_precision: usize,
    include_ancestors: bool,
}

impl ChannelRouter {
    pub fn new(default_precision: usize, include_ancestors: bool) -> Self {
        Self {
            default_precision: default_precision.clamp(1, MAX_PRECISION),
            include_ancestors,
        }
    }

    pub fn from_config(config: &GeoChatConfig) -> Self {
        Self::new(config.default_precision, config.include_ancestor_cells)
    }

    pub fn default_precision(&self) -> usize {
        self.default_precision
    }

    /// Route a coordinate at `precision`, or the default precision.
    pub fn route(&self, lat: f64, lon: f64, precision: Option<usize>) -> ChannelRoute {
        let precision = precision.unwrap_or(self.default_precision);
        self.route_cell(encode(lat, lon, precision))
    }

    pub fn route_cell(&self, key: GeoCell) -> ChannelRoute {
        let mut cells = vec![key.clone()];
        if self.include_ancestors {
            cells.extend(key.ancestors());
        }
        ChannelRoute { key, cells }
    }
}

impl Default for ChannelRouter {
    fn default() -> Self {
        Self::new(geochat_core::DEFAULT_PRECISION, false)
    }
}
