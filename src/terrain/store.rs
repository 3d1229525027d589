use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error, warn};

use super::tile::{ElevationTile, ElevationWindow};
use super::{ElevationSource, Precision, TileKey};
use crate::cache::HandlePool;
use crate::error::TerrainError;
use crate::geo::LatLon;
use crate::physics::los::TerrainProvider;

/// Default number of tile files kept open at once.
pub const DEFAULT_HANDLE_BUDGET: usize = 64;

#[derive(Debug)]
enum Cell {
    Tile(Arc<ElevationTile>),
    // No file, or a file that could not be opened as a tile.
    Unavailable,
}

/// Counters describing store activity so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub tiles_opened: u64,
    pub missing_cells: u64,
    pub columns_loaded: u64,
    pub read_failures: u64,
    pub reopens: u64,
    pub handle_evictions: u64,
    pub open_handles: usize,
}

/// Elevation lookups across every tile of one or more resolution levels.
///
/// Tiles are created the first time a query touches their cell and are
/// owned by the store for its lifetime. At most `handle_budget` backing files
/// are open at once; older ones are closed (not discarded) as new ones open.
///
/// Every query fails softly: a cell without a readable tile answers `None`.
pub struct ElevationStore {
    sources: Vec<Box<dyn ElevationSource>>,
    cells: RwLock<HashMap<TileKey, Cell>>,
    pool: HandlePool<TileKey>,
    tiles_opened: AtomicU64,
    missing_cells: AtomicU64,
}

impl ElevationStore {
    /// `sources[i]` serves resolution level `i`.
    pub fn new(sources: Vec<Box<dyn ElevationSource>>, handle_budget: usize) -> Self {
        Self {
            sources,
            cells: RwLock::new(HashMap::new()),
            pool: HandlePool::new(handle_budget),
            tiles_opened: AtomicU64::new(0),
            missing_cells: AtomicU64::new(0),
        }
    }

    /// Single-level store.
    pub fn with_source(source: impl ElevationSource + 'static, handle_budget: usize) -> Self {
        Self::new(vec![Box::new(source)], handle_budget)
    }

    pub fn levels(&self) -> usize {
        self.sources.len()
    }

    /// View of one resolution level, usable wherever terrain is needed.
    pub fn level(&self, level: usize) -> StoreLevel<'_> {
        StoreLevel { store: self, level }
    }

    /// Nearest-post elevation, `None` where no valid data exists.
    pub fn elevation_at(&self, loc: LatLon, level: usize) -> Option<i16> {
        let tile = self.tile(TileKey::containing(loc, level))?;
        let result = tile.elevation_at(loc.latitude, loc.longitude, &self.pool);
        self.soften(result)
    }

    /// Bilinear elevation, `None` if any surrounding post is missing.
    pub fn interpolated_elevation_at(&self, loc: LatLon, level: usize) -> Option<f64> {
        let tile = self.tile(TileKey::containing(loc, level))?;
        let result = tile.interpolated_elevation_at(loc.latitude, loc.longitude, &self.pool);
        self.soften(result)
    }

    pub fn elevation(&self, loc: LatLon, precision: Precision) -> Option<f64> {
        if precision.interpolate {
            self.interpolated_elevation_at(loc, precision.level)
        } else {
            self.elevation_at(loc, precision.level).map(f64::from)
        }
    }

    /// Posts between the given bounds, taken from the tile containing the
    /// southwest corner of the area. Parts of the area beyond that tile are
    /// clamped to its edge.
    pub fn window(
        &self,
        upper_lat: f64,
        left_lon: f64,
        lower_lat: f64,
        right_lon: f64,
        level: usize,
    ) -> Option<ElevationWindow> {
        let southwest = LatLon::new(upper_lat.min(lower_lat), left_lon.min(right_lon));
        let tile = self.tile(TileKey::containing(southwest, level))?;
        let result = tile.window(upper_lat, left_lon, lower_lat, right_lon, &self.pool);
        self.soften(result.map(Some))
    }

    /// Read the whole tile containing `loc` into memory. Returns false if
    /// there is no tile or some column could not be read.
    pub fn preload(&self, loc: LatLon, level: usize) -> bool {
        self.tile(TileKey::containing(loc, level))
            .is_some_and(|tile| tile.load_all(&self.pool).is_ok())
    }

    /// Allow columns that failed to load to be read again.
    pub fn clear_failures(&self) {
        for cell in self.read_cells().values() {
            if let Cell::Tile(tile) = cell {
                tile.clear_failures();
            }
        }
    }

    /// Tile covering `loc`, if one could be opened.
    pub fn tile_at(&self, loc: LatLon, level: usize) -> Option<Arc<ElevationTile>> {
        self.tile(TileKey::containing(loc, level))
    }

    pub fn tile_count(&self) -> usize {
        self.read_cells()
            .values()
            .filter(|cell| matches!(cell, Cell::Tile(_)))
            .count()
    }

    pub fn open_handles(&self) -> usize {
        self.pool.open_count()
    }

    pub fn handle_budget(&self) -> usize {
        self.pool.budget()
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            tiles_opened: self.tiles_opened.load(Ordering::Relaxed),
            missing_cells: self.missing_cells.load(Ordering::Relaxed),
            handle_evictions: self.pool.evictions(),
            open_handles: self.pool.open_count(),
            ..StoreStats::default()
        };
        for cell in self.read_cells().values() {
            if let Cell::Tile(tile) = cell {
                stats.columns_loaded += tile.columns_loaded();
                stats.read_failures += tile.read_failures();
                stats.reopens += tile.reopens();
            }
        }
        stats
    }

    /// Close every backing file. Loaded posts stay available; further reads
    /// reopen files as needed.
    pub fn close_all(&self) {
        self.pool.close_all();
    }

    fn tile(&self, key: TileKey) -> Option<Arc<ElevationTile>> {
        if let Some(cell) = self.read_cells().get(&key) {
            return match cell {
                Cell::Tile(tile) => Some(tile.clone()),
                Cell::Unavailable => None,
            };
        }

        let Some(source) = self.sources.get(key.level) else {
            debug!(level = key.level, "no elevation source configured for level");
            return None;
        };

        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        // Another thread may have created it while we waited.
        if let Some(cell) = cells.get(&key) {
            return match cell {
                Cell::Tile(tile) => Some(tile.clone()),
                Cell::Unavailable => None,
            };
        }

        let Some(path) = source.locate(key.lat, key.lon) else {
            debug!(?key, "no elevation tile for cell");
            self.missing_cells.fetch_add(1, Ordering::Relaxed);
            cells.insert(key, Cell::Unavailable);
            return None;
        };

        let mut lease = self.pool.lease();
        lease.make_room_for(&key);
        match ElevationTile::open(key, &path, source.dimension()) {
            Ok(tile) => {
                let tile = Arc::new(tile);
                lease.register(key, tile.clone());
                self.tiles_opened.fetch_add(1, Ordering::Relaxed);
                debug!(?key, dimension = tile.dimension(), ?path, "opened elevation tile");
                cells.insert(key, Cell::Tile(tile.clone()));
                Some(tile)
            }
            Err(e) => {
                warn!(?key, ?path, error = %e, "elevation tile unavailable");
                if matches!(e, TerrainError::TileNotFound { .. }) {
                    self.missing_cells.fetch_add(1, Ordering::Relaxed);
                }
                cells.insert(key, Cell::Unavailable);
                None
            }
        }
    }

    fn read_cells(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TileKey, Cell>> {
        self.cells.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn soften<T>(&self, result: Result<Option<T>, TerrainError>) -> Option<T> {
        match result {
            Ok(value) => value,
            Err(e @ TerrainError::OutOfBounds { .. }) => {
                // Routing picked the wrong tile; this is a bug, not missing data.
                error!(error = %e, "elevation query routed to the wrong tile");
                None
            }
            // Read failures are logged by the tile when they happen.
            Err(_) => None,
        }
    }
}

impl Drop for ElevationStore {
    fn drop(&mut self) {
        self.pool.close_all();
    }
}

impl std::fmt::Debug for ElevationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElevationStore")
            .field("sources", &self.sources)
            .field("tiles", &self.tile_count())
            .field("open_handles", &self.open_handles())
            .finish()
    }
}

/// One resolution level of an [`ElevationStore`].
#[derive(Debug, Clone, Copy)]
pub struct StoreLevel<'a> {
    store: &'a ElevationStore,
    level: usize,
}

impl StoreLevel<'_> {
    pub fn level(&self) -> usize {
        self.level
    }
}

impl TerrainProvider for StoreLevel<'_> {
    fn elevation_at(&self, loc: LatLon) -> Option<i16> {
        self.store.elevation_at(loc, self.level)
    }

    fn interpolated_elevation_at(&self, loc: LatLon) -> Option<f64> {
        self.store.interpolated_elevation_at(loc, self.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::tile::tests::write_tile;
    use crate::terrain::SrtmSource;

    fn store_with_tiles(cells: &[(i32, i32)], budget: usize) -> (tempfile::TempDir, ElevationStore) {
        let dir = tempfile::tempdir().unwrap();
        for &(lat, lon) in cells {
            write_tile(dir.path(), lat, lon, 11, move |c, r| {
                (lat * 1000 + lon * 100) as i16 + (c * 10 + r) as i16
            });
        }
        let store = ElevationStore::with_source(SrtmSource::new(dir.path()), budget);
        (dir, store)
    }

    #[test]
    fn test_routes_to_owning_tile() {
        let (_dir, store) = store_with_tiles(&[(0, 0), (0, 1), (-1, 0)], 8);
        assert_eq!(store.elevation_at(LatLon::new(0.5, 0.5), 0), Some(55));
        assert_eq!(store.elevation_at(LatLon::new(0.5, 1.5), 0), Some(155));
        assert_eq!(store.elevation_at(LatLon::new(-0.5, 0.5), 0), Some(-1000 + 55));
        assert_eq!(store.tile_count(), 3);
    }

    #[test]
    fn test_missing_tile_is_no_data() {
        let (_dir, store) = store_with_tiles(&[(0, 0)], 8);
        assert_eq!(store.elevation_at(LatLon::new(5.5, 5.5), 0), None);
        assert_eq!(store.interpolated_elevation_at(LatLon::new(5.5, 5.5), 0), None);
        assert_eq!(store.window(5.9, 5.1, 5.1, 5.9, 0), None);
        // Unconfigured level.
        assert_eq!(store.elevation_at(LatLon::new(0.5, 0.5), 3), None);
        assert_eq!(store.stats().missing_cells, 1);
        assert_eq!(store.tile_count(), 0);
    }

    #[test]
    fn test_corrupt_tile_is_no_data() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("N00E000.hgt"), [0u8; 7]).unwrap();
        let store = ElevationStore::with_source(SrtmSource::new(dir.path()), 4);
        assert_eq!(store.elevation_at(LatLon::new(0.5, 0.5), 0), None);
        assert_eq!(store.open_handles(), 0);
    }

    #[test]
    fn test_precision_selects_mode_and_level() {
        let coarse = tempfile::tempdir().unwrap();
        let fine = tempfile::tempdir().unwrap();
        write_tile(coarse.path(), 0, 0, 3, |_, _| 100);
        write_tile(fine.path(), 0, 0, 11, |c, _| (c * 10) as i16);

        let store = ElevationStore::new(
            vec![
                Box::new(SrtmSource::new(coarse.path())),
                Box::new(SrtmSource::new(fine.path())),
            ],
            4,
        );
        let loc = LatLon::new(0.5, 0.25);
        assert_eq!(store.elevation(loc, Precision::nearest(0)), Some(100.0));
        assert_eq!(store.elevation(loc, Precision::nearest(1)), Some(30.0));
        let interpolated = store.elevation(loc, Precision::interpolated(1)).unwrap();
        assert!((interpolated - 25.0).abs() < 1e-9);
        assert_eq!(store.levels(), 2);
    }

    #[test]
    fn test_handle_budget_is_respected() {
        let cells: Vec<(i32, i32)> = (0..6).map(|i| (0, i)).collect();
        let (_dir, store) = store_with_tiles(&cells, 2);

        for (i, &(lat, lon)) in cells.iter().enumerate() {
            let loc = LatLon::new(lat as f64 + 0.5, lon as f64 + 0.5);
            assert!(store.elevation_at(loc, 0).is_some());
            assert!(store.open_handles() <= 2);

            let open_tiles = cells[..=i]
                .iter()
                .filter_map(|&(la, lo)| store.tile_at(LatLon::new(la as f64 + 0.5, lo as f64 + 0.5), 0))
                .filter(|t| t.is_open())
                .count();
            assert!(open_tiles <= 2, "{open_tiles} tiles hold open files");
        }
        assert_eq!(store.stats().handle_evictions, 4);

        // Already-loaded posts of an evicted tile are served from memory.
        let first = store.tile_at(LatLon::new(0.5, 0.5), 0).unwrap();
        assert!(!first.is_open());
        assert_eq!(store.elevation_at(LatLon::new(0.5, 0.5), 0), Some(55));
        assert!(!first.is_open());

        // An unloaded column transparently reopens the file.
        assert_eq!(store.elevation_at(LatLon::new(0.2, 0.9), 0), Some(92));
        assert!(first.is_open());
        assert!(store.open_handles() <= 2);
        assert_eq!(store.stats().reopens, 1);
    }

    #[test]
    fn test_window_and_preload() {
        let (_dir, store) = store_with_tiles(&[(0, 0)], 2);
        let window = store.window(0.3, 0.1, 0.1, 0.3, 0).unwrap();
        assert_eq!(window.columns(), 3);
        assert_eq!(window.get(0, 0), Some(11));

        assert_eq!(store.window(f64::NAN, 0.1, 0.5, 0.3, 0), None);

        assert!(store.preload(LatLon::new(0.5, 0.5), 0));
        let tile = store.tile_at(LatLon::new(0.5, 0.5), 0).unwrap();
        assert!((0..11).all(|c| tile.is_column_loaded(c)));
        assert!(!store.preload(LatLon::new(3.5, 3.5), 0));
    }

    #[test]
    fn test_close_all_keeps_data() {
        let (_dir, store) = store_with_tiles(&[(0, 0), (1, 1)], 4);
        assert_eq!(store.elevation_at(LatLon::new(0.5, 0.5), 0), Some(55));
        assert_eq!(store.open_handles(), 1);
        store.close_all();
        assert_eq!(store.open_handles(), 0);
        assert_eq!(store.elevation_at(LatLon::new(0.5, 0.5), 0), Some(55));
        assert_eq!(store.open_handles(), 0);
    }

    #[test]
    fn test_concurrent_readers() {
        let cells: Vec<(i32, i32)> = (0..4).map(|i| (i, 0)).collect();
        let (_dir, store) = store_with_tiles(&cells, 2);

        std::thread::scope(|scope| {
            for t in 0..4 {
                let store = &store;
                scope.spawn(move || {
                    for i in 0..200 {
                        let lat = ((t + i) % 4) as f64 + 0.05 * (i % 20) as f64;
                        let value = store.elevation_at(LatLon::new(lat, 0.5), 0);
                        assert!(value.is_some());
                        assert!(store.open_handles() <= 2);
                    }
                });
            }
        });
        assert_eq!(store.tile_count(), 4);
    }
}
