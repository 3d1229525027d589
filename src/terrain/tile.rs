use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::warn;

use super::source::dimension_from_len;
use super::{TileKey, NO_DATA};
use crate::cache::{lock, Closable, HandlePool};
use crate::error::TerrainError;

/// One cell's worth of elevation posts.
///
/// The backing file holds `dimension` columns (west to east) of `dimension`
/// big-endian `i16` posts (south to north). Columns are read on first use and
/// kept for the tile's lifetime; the file handle itself may be closed by the
/// [`HandlePool`] at any time and is reopened on the next column read.
#[derive(Debug)]
pub struct ElevationTile {
    key: TileKey,
    path: PathBuf,
    dimension: usize,
    columns: Vec<OnceLock<Box<[i16]>>>,
    // Columns whose read failed; not retried until `clear_failures`.
    failed: Vec<AtomicBool>,
    file: Mutex<Option<File>>,
    valid: AtomicBool,
    columns_loaded: AtomicU64,
    read_failures: AtomicU64,
    reopens: AtomicU64,
}

/// Column-major copy of a rectangular block of posts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElevationWindow {
    /// Column index (from the west edge) of `posts[0]`.
    pub first_column: usize,
    /// Row index (from the south edge) of `posts[_][0]`.
    pub first_row: usize,
    pub posts: Vec<Vec<i16>>,
}

impl ElevationWindow {
    pub fn columns(&self) -> usize {
        self.posts.len()
    }

    pub fn rows(&self) -> usize {
        self.posts.first().map_or(0, Vec::len)
    }

    /// Post at window-relative (`column`, `row`), `None` if out of range or
    /// no data.
    pub fn get(&self, column: usize, row: usize) -> Option<i16> {
        self.posts
            .get(column)
            .and_then(|c| c.get(row))
            .copied()
            .filter(|&v| v != NO_DATA)
    }
}

impl ElevationTile {
    /// Open the backing file and validate its size. The file handle stays
    /// open; callers account for it in their [`HandlePool`].
    pub fn open(
        key: TileKey,
        path: impl AsRef<Path>,
        expected_dimension: Option<usize>,
    ) -> Result<Self, TerrainError> {
        let path = path.as_ref().to_path_buf();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TerrainError::TileNotFound { lat: key.lat, lon: key.lon });
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        let dimension = match (dimension_from_len(len), expected_dimension) {
            (Some(found), Some(expected)) if found == expected => found,
            (Some(found), None) => found,
            _ => return Err(TerrainError::InvalidTileSize { path, len }),
        };

        Ok(Self {
            key,
            path,
            dimension,
            columns: (0..dimension).map(|_| OnceLock::new()).collect(),
            failed: (0..dimension).map(|_| AtomicBool::new(false)).collect(),
            file: Mutex::new(Some(file)),
            valid: AtomicBool::new(true),
            columns_loaded: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            reopens: AtomicU64::new(0),
        })
    }

    pub fn key(&self) -> TileKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Degrees between adjacent posts.
    pub fn post_spacing(&self) -> f64 {
        1.0 / (self.dimension - 1) as f64
    }

    /// False once the backing file has disappeared; unloaded columns can no
    /// longer be served.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        lock(&self.file).is_some()
    }

    pub fn is_column_loaded(&self, index: usize) -> bool {
        self.columns.get(index).is_some_and(|c| c.get().is_some())
    }

    pub fn columns_loaded(&self) -> u64 {
        self.columns_loaded.load(Ordering::Relaxed)
    }

    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }

    pub fn reopens(&self) -> u64 {
        self.reopens.load(Ordering::Relaxed)
    }

    /// Nearest post to (`lat`, `lon`).
    pub fn elevation_at(
        self: &Arc<Self>,
        lat: f64,
        lon: f64,
        pool: &HandlePool<TileKey>,
    ) -> Result<Option<i16>, TerrainError> {
        self.check_bounds(lat, lon)?;
        let last = self.dimension - 1;
        let row = (((lat - self.key.lat as f64) * last as f64).round() as usize).min(last);
        let column = (((lon - self.key.lon as f64) * last as f64).round() as usize).min(last);

        let posts = self.load_column(column, pool)?;
        Ok(Some(posts[row]).filter(|&v| v != NO_DATA))
    }

    /// Bilinear blend of the four posts surrounding (`lat`, `lon`). Any
    /// no-data corner makes the result `None`.
    pub fn interpolated_elevation_at(
        self: &Arc<Self>,
        lat: f64,
        lon: f64,
        pool: &HandlePool<TileKey>,
    ) -> Result<Option<f64>, TerrainError> {
        self.check_bounds(lat, lon)?;
        let last = self.dimension - 1;
        let y = (lat - self.key.lat as f64) * last as f64;
        let x = (lon - self.key.lon as f64) * last as f64;

        let col0 = (x.floor() as usize).min(last);
        let row0 = (y.floor() as usize).min(last);
        let col1 = (col0 + 1).min(last);
        let row1 = (row0 + 1).min(last);
        let u = x - col0 as f64;
        let v = y - row0 as f64;

        let west = self.load_column(col0, pool)?;
        let east = self.load_column(col1, pool)?;

        let ll = west[row0];
        let ul = west[row1];
        let lr = east[row0];
        let ur = east[row1];
        if [ll, ul, lr, ur].contains(&NO_DATA) {
            return Ok(None);
        }

        let lower = lerp(ll as f64, lr as f64, u);
        let upper = lerp(ul as f64, ur as f64, u);
        Ok(Some(lerp(lower, upper, v)))
    }

    /// Posts inside the given bounds. Bounds may come in either order and
    /// are clamped to post indices `0..=dimension - 2`.
    pub fn window(
        self: &Arc<Self>,
        upper_lat: f64,
        left_lon: f64,
        lower_lat: f64,
        right_lon: f64,
        pool: &HandlePool<TileKey>,
    ) -> Result<ElevationWindow, TerrainError> {
        if ![upper_lat, left_lon, lower_lat, right_lon].iter().all(|v| v.is_finite()) {
            return Err(TerrainError::OutOfBounds {
                lat: upper_lat,
                lon: left_lon,
                sw_lat: self.key.lat,
                sw_lon: self.key.lon,
            });
        }
        let (upper, lower) = if lower_lat > upper_lat {
            (lower_lat, upper_lat)
        } else {
            (upper_lat, lower_lat)
        };
        let (left, right) = if left_lon > right_lon {
            (right_lon, left_lon)
        } else {
            (left_lon, right_lon)
        };

        let last = (self.dimension - 1) as f64;
        let max_index = (self.dimension - 2) as f64;
        let to_index = |value: f64, origin: i32| -> usize {
            ((value - origin as f64) * last).round().clamp(0.0, max_index) as usize
        };

        let first_column = to_index(left, self.key.lon);
        let last_column = to_index(right, self.key.lon);
        let first_row = to_index(lower, self.key.lat);
        let last_row = to_index(upper, self.key.lat);

        let posts = (first_column..=last_column)
            .map(|column| {
                self.load_column(column, pool)
                    .map(|posts| posts[first_row..=last_row].to_vec())
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ElevationWindow {
            first_column,
            first_row,
            posts,
        })
    }

    /// Read every column now. Keeps going past failures and reports the
    /// first one.
    pub fn load_all(self: &Arc<Self>, pool: &HandlePool<TileKey>) -> Result<(), TerrainError> {
        let mut first_error = None;
        for column in 0..self.dimension {
            if let Err(e) = self.load_column(column, pool) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Posts of one column, reading them from the file if needed.
    pub fn load_column(
        self: &Arc<Self>,
        index: usize,
        pool: &HandlePool<TileKey>,
    ) -> Result<&[i16], TerrainError> {
        let Some(slot) = self.columns.get(index) else {
            return Err(self.read_error(
                index,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "column index out of range"),
            ));
        };
        if let Some(posts) = slot.get() {
            return Ok(&posts[..]);
        }
        if self.failed[index].load(Ordering::Relaxed) {
            return Err(self.read_error(index, std::io::Error::other("column previously failed to load")));
        }

        // Fast path: the handle is still open. The pool is only touched after
        // our file lock is released.
        let attempt = {
            let mut file = lock(&self.file);
            file.as_mut().map(|f| read_column(f, index, self.dimension))
        };
        let result = match attempt {
            Some(result) => {
                pool.touch(&self.key);
                result
            }
            None => self.reopen_and_read(index, pool),
        };

        match result {
            Ok(posts) => {
                self.columns_loaded.fetch_add(1, Ordering::Relaxed);
                Ok(&slot.get_or_init(|| posts)[..])
            }
            Err(e) => {
                self.failed[index].store(true, Ordering::Relaxed);
                self.read_failures.fetch_add(1, Ordering::Relaxed);
                warn!(path = ?self.path, column = index, error = %e, "failed to read elevation column");
                Err(self.read_error(index, e))
            }
        }
    }

    /// Re-arm columns whose read failed so the next query tries again.
    pub fn clear_failures(&self) {
        for flag in &self.failed {
            flag.store(false, Ordering::Relaxed);
        }
    }

    fn reopen_and_read(
        self: &Arc<Self>,
        index: usize,
        pool: &HandlePool<TileKey>,
    ) -> std::io::Result<Box<[i16]>> {
        let mut lease = pool.lease();
        lease.make_room_for(&self.key);

        let mut guard = lock(&self.file);
        let mut file = match guard.take() {
            Some(file) => file,
            None => match File::open(&self.path) {
                Ok(file) => {
                    self.reopens.fetch_add(1, Ordering::Relaxed);
                    file
                }
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        self.valid.store(false, Ordering::Relaxed);
                    }
                    return Err(e);
                }
            },
        };
        let result = read_column(&mut file, index, self.dimension);
        *guard = Some(file);
        drop(guard);

        let holder: Arc<dyn Closable> = self.clone();
        lease.register(self.key, holder);
        result
    }

    fn check_bounds(&self, lat: f64, lon: f64) -> Result<(), TerrainError> {
        let south = self.key.lat as f64;
        let west = self.key.lon as f64;
        if (south..=south + 1.0).contains(&lat) && (west..=west + 1.0).contains(&lon) {
            Ok(())
        } else {
            Err(TerrainError::OutOfBounds {
                lat,
                lon,
                sw_lat: self.key.lat,
                sw_lon: self.key.lon,
            })
        }
    }

    fn read_error(&self, column: usize, source: std::io::Error) -> TerrainError {
        TerrainError::TileRead {
            path: self.path.clone(),
            column,
            source,
        }
    }
}

impl Closable for ElevationTile {
    fn close(&self) {
        lock(&self.file).take();
    }
}

fn read_column(file: &mut File, index: usize, dimension: usize) -> std::io::Result<Box<[i16]>> {
    let mut buffer = vec![0u8; 2 * dimension];
    file.seek(SeekFrom::Start((index * 2 * dimension) as u64))?;
    file.read_exact(&mut buffer)?;

    Ok(buffer
        .chunks_exact(2)
        .map(|chunk| i16::from_be_bytes([chunk[0], chunk[1]]))
        .collect())
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use itertools::Itertools;

    /// Write a column-major tile file named after its southwest corner.
    pub(crate) fn write_tile(
        dir: &Path,
        lat: i32,
        lon: i32,
        dimension: usize,
        post: impl Fn(usize, usize) -> i16,
    ) -> PathBuf {
        let mut bytes = Vec::with_capacity(2 * dimension * dimension);
        for column in 0..dimension {
            for row in 0..dimension {
                bytes.extend_from_slice(&post(column, row).to_be_bytes());
            }
        }
        let path = dir.join(format!("{}.hgt", crate::terrain::tile_name(lat, lon)));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn open_tile(path: &Path, lat: i32, lon: i32) -> Arc<ElevationTile> {
        Arc::new(ElevationTile::open(TileKey::new(0, lat, lon), path, None).unwrap())
    }

    #[test]
    fn test_nearest_post_indexing() {
        let dir = tempfile::tempdir().unwrap();
        // 11 posts per side: 0.1 degree spacing. Encode column*100 + row.
        let path = write_tile(dir.path(), 10, 20, 11, |c, r| (c * 100 + r) as i16);
        let tile = open_tile(&path, 10, 20);
        let pool = HandlePool::new(4);

        assert_eq!(tile.dimension(), 11);
        assert_eq!(tile.elevation_at(10.0, 20.0, &pool).unwrap(), Some(0));
        assert_eq!(tile.elevation_at(10.3, 20.7, &pool).unwrap(), Some(703));
        assert_eq!(tile.elevation_at(10.34, 20.66, &pool).unwrap(), Some(703));
        assert_eq!(tile.elevation_at(11.0, 21.0, &pool).unwrap(), Some(1010));
        assert!(tile.is_column_loaded(7));
        assert!(!tile.is_column_loaded(5));
    }

    #[test]
    fn test_nearest_post_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tile(dir.path(), 0, 0, 11, |c, r| (c as i16 - r as i16) * 7);
        let tile = open_tile(&path, 0, 0);
        let pool = HandlePool::new(1);

        let first = tile.elevation_at(0.42, 0.77, &pool).unwrap();
        let loads = tile.columns_loaded();
        let second = tile.elevation_at(0.42, 0.77, &pool).unwrap();
        assert_eq!(first, second);
        assert_eq!(tile.columns_loaded(), loads);
    }

    #[test]
    fn test_out_of_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tile(dir.path(), 10, 20, 11, |_, _| 5);
        let tile = open_tile(&path, 10, 20);
        let pool = HandlePool::new(1);

        assert!(matches!(
            tile.elevation_at(9.5, 20.5, &pool),
            Err(TerrainError::OutOfBounds { .. })
        ));
        assert!(matches!(
            tile.interpolated_elevation_at(10.5, 21.5, &pool),
            Err(TerrainError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_interpolation_within_corner_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let post = |c: usize, r: usize| ((c * 37 + r * 91) % 400) as i16 + 10;
        let path = write_tile(dir.path(), 0, 0, 11, post);
        let tile = open_tile(&path, 0, 0);
        let pool = HandlePool::new(1);

        for (lat, lon) in [(0.05, 0.05), (0.33, 0.71), (0.99, 0.01), (0.57, 0.23)] {
            let value = tile.interpolated_elevation_at(lat, lon, &pool).unwrap().unwrap();
            let (c0, r0) = ((lon * 10.0).floor() as usize, (lat * 10.0).floor() as usize);
            let corners = [post(c0, r0), post(c0 + 1, r0), post(c0, r0 + 1), post(c0 + 1, r0 + 1)];
            let (min, max) = corners.iter().copied().minmax().into_option().unwrap();
            assert!(
                value >= min as f64 - 1e-9 && value <= max as f64 + 1e-9,
                "{value} outside [{min}, {max}] at ({lat}, {lon})"
            );
        }
    }

    #[test]
    fn test_interpolation_is_symmetric_bilinear() {
        let dir = tempfile::tempdir().unwrap();
        // Plane: 10 m per column, 1 m per row. Bilinear reproduces it exactly.
        let path = write_tile(dir.path(), 0, 0, 11, |c, r| (c * 10 + r) as i16);
        let tile = open_tile(&path, 0, 0);
        let pool = HandlePool::new(1);

        let value = tile.interpolated_elevation_at(0.25, 0.35, &pool).unwrap().unwrap();
        assert_relative_eq!(value, 35.0 + 2.5, epsilon = 1e-9);

        let on_post = tile.interpolated_elevation_at(0.3, 0.4, &pool).unwrap().unwrap();
        assert_relative_eq!(on_post, 43.0, epsilon = 1e-9);

        let corner = tile.interpolated_elevation_at(1.0, 1.0, &pool).unwrap().unwrap();
        assert_relative_eq!(corner, 110.0, epsilon = 1e-9);
    }

    #[test]
    fn test_interpolation_propagates_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tile(dir.path(), 0, 0, 11, |c, r| if (c, r) == (4, 6) { NO_DATA } else { 100 });
        let tile = open_tile(&path, 0, 0);
        let pool = HandlePool::new(1);

        // (4, 6) is the upper-left corner of this cell.
        assert_eq!(tile.interpolated_elevation_at(0.55, 0.45, &pool).unwrap(), None);
        assert_eq!(tile.elevation_at(0.6, 0.4, &pool).unwrap(), None);
        // Neighboring cell without the void.
        assert_eq!(tile.interpolated_elevation_at(0.75, 0.75, &pool).unwrap(), Some(100.0));
    }

    #[test]
    fn test_window_reorders_and_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tile(dir.path(), 0, 0, 11, |c, r| (c * 100 + r) as i16);
        let tile = open_tile(&path, 0, 0);
        let pool = HandlePool::new(1);

        // Bounds given swapped: lower/upper and left/right reversed.
        let window = tile.window(0.2, 0.5, 0.4, 0.3, &pool).unwrap();
        assert_eq!(window.first_column, 3);
        assert_eq!(window.first_row, 2);
        assert_eq!(window.columns(), 3);
        assert_eq!(window.rows(), 3);
        assert_eq!(window.get(0, 0), Some(302));
        assert_eq!(window.get(2, 2), Some(504));

        // Clamped to [0, D - 2].
        let full = tile.window(2.0, -1.0, -1.0, 2.0, &pool).unwrap();
        assert_eq!(full.columns(), 10);
        assert_eq!(full.rows(), 10);
        assert_eq!(full.get(9, 9), Some(909));
    }

    #[test]
    fn test_window_rejects_non_finite_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tile(dir.path(), 0, 0, 11, |c, r| (c * 100 + r) as i16);
        let tile = open_tile(&path, 0, 0);
        let pool = HandlePool::new(1);

        for bounds in [
            (f64::NAN, 0.1, 0.5, 0.3),
            (0.5, 0.1, 0.1, f64::INFINITY),
            (0.5, f64::NEG_INFINITY, 0.1, 0.3),
        ] {
            let (upper, left, lower, right) = bounds;
            assert!(matches!(
                tile.window(upper, left, lower, right, &pool),
                Err(TerrainError::OutOfBounds { .. })
            ));
        }
        assert!(!tile.is_column_loaded(1));
    }

    #[test]
    fn test_truncated_file_fails_column_softly() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tile(dir.path(), 0, 0, 11, |_, _| 42);
        let tile = open_tile(&path, 0, 0);
        let pool = HandlePool::new(1);

        assert_eq!(tile.elevation_at(0.0, 0.0, &pool).unwrap(), Some(42));
        // Cut the file after the first three columns.
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len((3 * 2 * 11) as u64).unwrap();

        assert!(matches!(
            tile.elevation_at(0.0, 0.9, &pool),
            Err(TerrainError::TileRead { column: 9, .. })
        ));
        // Not retried: the failure count stays at one.
        assert!(tile.elevation_at(0.0, 0.9, &pool).is_err());
        assert_eq!(tile.read_failures(), 1);
        // Other columns are unaffected.
        assert_eq!(tile.elevation_at(0.5, 0.1, &pool).unwrap(), Some(42));
    }

    #[test]
    fn test_close_is_idempotent_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tile(dir.path(), 0, 0, 11, |c, _| c as i16);
        let tile = open_tile(&path, 0, 0);
        let pool = HandlePool::new(2);

        tile.close();
        tile.close();
        assert!(!tile.is_open());

        assert_eq!(tile.elevation_at(0.5, 0.5, &pool).unwrap(), Some(5));
        assert!(tile.is_open());
        assert_eq!(tile.reopens(), 1);
        assert!(pool.is_open(&tile.key()));
    }

    #[test]
    fn test_rejects_unexpected_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tile(dir.path(), 0, 0, 11, |_, _| 1);
        assert!(matches!(
            ElevationTile::open(TileKey::new(0, 0, 0), &path, Some(1201)),
            Err(TerrainError::InvalidTileSize { .. })
        ));
        assert!(matches!(
            ElevationTile::open(TileKey::new(0, 5, 5), dir.path().join("N05E005.hgt"), None),
            Err(TerrainError::TileNotFound { lat: 5, lon: 5 })
        ));
    }
}
