//! Tiled elevation data: one file per 1°×1° cell, loaded a column at a time.

mod source;
mod store;
mod tile;

pub use source::{parse_tile_name, tile_cell, tile_name, ElevationSource, SrtmResolution, SrtmSource};
pub use store::{ElevationStore, StoreLevel, StoreStats, DEFAULT_HANDLE_BUDGET};
pub use tile::{ElevationTile, ElevationWindow};

use crate::geo::LatLon;

/// Post value meaning "no data".
pub const NO_DATA: i16 = -32767;

pub const SRTM3_SIZE: usize = 1201;
pub const SRTM1_SIZE: usize = 3601;

/// Identifies one tile: the integer southwest corner of its cell and the
/// resolution level it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub level: usize,
    pub lat: i32,
    pub lon: i32,
}

impl TileKey {
    pub fn new(level: usize, lat: i32, lon: i32) -> Self {
        Self { level, lat, lon }
    }

    /// Key of the cell containing `loc`.
    pub fn containing(loc: LatLon, level: usize) -> Self {
        Self {
            level,
            lat: loc.latitude.floor() as i32,
            lon: loc.longitude.floor() as i32,
        }
    }

    pub fn southwest(&self) -> LatLon {
        LatLon::new(self.lat as f64, self.lon as f64)
    }
}

/// Which resolution level to read and whether to interpolate between posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Precision {
    pub level: usize,
    pub interpolate: bool,
}

impl Precision {
    pub const fn nearest(level: usize) -> Self {
        Self { level, interpolate: false }
    }

    pub const fn interpolated(level: usize) -> Self {
        Self { level, interpolate: true }
    }
}
