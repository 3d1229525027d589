use std::fmt;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::{SRTM1_SIZE, SRTM3_SIZE};
use crate::error::TerrainError;

/// Where tiles of one resolution level come from.
///
/// The store asks a source for the file backing a cell; everything after
/// that (opening, column reads) is format independent.
pub trait ElevationSource: Send + Sync + fmt::Debug {
    /// Path of the file whose southwest corner is (`lat`, `lon`), if present.
    fn locate(&self, lat: i32, lon: i32) -> Option<PathBuf>;

    /// Post count per side every tile of this source must have. `None`
    /// infers it from the file length.
    fn dimension(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtmResolution {
    /// 1 arc-second
    Srtm1,
    /// 3 arc-second
    Srtm3,
}

impl SrtmResolution {
    pub fn samples(&self) -> usize {
        match self {
            SrtmResolution::Srtm1 => SRTM1_SIZE,
            SrtmResolution::Srtm3 => SRTM3_SIZE,
        }
    }
}

/// A flat directory of `N22E116.hgt` style files.
#[derive(Debug, Clone)]
pub struct SrtmSource {
    root: PathBuf,
    resolution: Option<SrtmResolution>,
}

impl SrtmSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            resolution: None,
        }
    }

    pub fn with_resolution(mut self, resolution: SrtmResolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Southwest corners of every tile in the directory, sorted. Files are
    /// not opened.
    pub fn available_tiles(&self) -> Result<Vec<(i32, i32)>, TerrainError> {
        let mut cells = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_hgt = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("hgt"));
            if !is_hgt {
                continue;
            }
            match tile_cell(&path) {
                Ok(cell) => cells.push(cell),
                Err(e) => warn!(?path, error = %e, "skipping unrecognized tile file"),
            }
        }
        cells.sort_unstable();
        cells.dedup();
        Ok(cells)
    }
}

impl ElevationSource for SrtmSource {
    fn locate(&self, lat: i32, lon: i32) -> Option<PathBuf> {
        let name = tile_name(lat, lon);
        [
            format!("{name}.hgt"),
            format!("{name}.HGT"),
            format!("{}.hgt", name.to_lowercase()),
        ]
        .into_iter()
        .map(|file| self.root.join(file))
        .find(|path| path.is_file())
    }

    fn dimension(&self) -> Option<usize> {
        self.resolution.map(|r| r.samples())
    }
}

/// File stem for the cell with southwest corner (`lat`, `lon`), e.g. `S01W075`.
pub fn tile_name(lat: i32, lon: i32) -> String {
    format!(
        "{}{:02}{}{:03}",
        if lat >= 0 { "N" } else { "S" },
        lat.abs(),
        if lon >= 0 { "E" } else { "W" },
        lon.abs()
    )
}

/// Southwest corner encoded in a tile file name. Case-insensitive; anything
/// after the first seven characters (extension, suffixes) is ignored.
pub fn parse_tile_name(filename: &str) -> Option<(i32, i32)> {
    let name = filename.get(..7)?;
    if !name.is_ascii() {
        return None;
    }
    let name = name.to_ascii_uppercase();

    let lat_sign = match &name[0..1] {
        "N" => 1,
        "S" => -1,
        _ => return None,
    };
    let lon_sign = match &name[3..4] {
        "E" => 1,
        "W" => -1,
        _ => return None,
    };
    let lat_digits = &name[1..3];
    let lon_digits = &name[4..7];
    if !lat_digits.bytes().chain(lon_digits.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let lat: i32 = lat_digits.parse().ok()?;
    let lon: i32 = lon_digits.parse().ok()?;
    Some((lat * lat_sign, lon * lon_sign))
}

/// Southwest corner of the tile stored at `path`, from its file name.
pub fn tile_cell(path: &Path) -> Result<(i32, i32), TerrainError> {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    parse_tile_name(name).ok_or_else(|| TerrainError::InvalidFilename(path.display().to_string()))
}

/// Post count per side for a file of `len` bytes: `len = 2 * D * D`.
pub(crate) fn dimension_from_len(len: u64) -> Option<usize> {
    if len % 2 != 0 {
        return None;
    }
    let posts = len / 2;
    let side = (posts as f64).sqrt().round() as u64;
    (side >= 2 && side * side == posts).then_some(side as usize)
}
