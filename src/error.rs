//! Error types for terrain access and scan configuration.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while locating, opening or reading elevation tiles.
///
/// Most of these never reach a scan: the store degrades them to "no data".
#[derive(Debug, Error)]
pub enum TerrainError {
    /// No backing file exists for the requested cell.
    #[error("No tile found for cell ({lat}, {lon})")]
    TileNotFound { lat: i32, lon: i32 },

    /// A column could not be read from the backing file.
    #[error("Failed to read column {column} of {path:?}: {source}")]
    TileRead {
        path: PathBuf,
        column: usize,
        #[source]
        source: std::io::Error,
    },

    /// Query coordinate lies outside the addressed tile.
    #[error("Coordinate ({lat}, {lon}) is outside tile with SW corner ({sw_lat}, {sw_lon})")]
    OutOfBounds {
        lat: f64,
        lon: f64,
        sw_lat: i32,
        sw_lon: i32,
    },

    /// File length is not `2 * D * D` for an accepted dimension.
    #[error("Unexpected tile file size {len} for {path:?}")]
    InvalidTileSize { path: PathBuf, len: u64 },

    #[error("Invalid tile filename: {0}")]
    InvalidFilename(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-time failures. These are the only errors that stop a scan
/// from starting.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::InvalidConfiguration(msg.into())
    }
}
