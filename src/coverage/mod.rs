//! Multi-viewpoint visibility scan over a geographic window.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use itertools::iproduct;
use rayon::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::error::ConfigError;
use crate::geo::{horizon_distance_rad, km_to_radians, GeoWindow, LatLon, MapProjection};
use crate::physics::los::{AltitudeReference, LosSolver, TerrainProvider, Viewpoint};

pub const DEFAULT_ALTITUDE_M: f64 = 500.0;
pub const DEFAULT_MAX_RANGE_KM: f64 = 200.0;
/// Grid spacing in screen pixels when the window comes from a map view.
pub const DEFAULT_PIXEL_STRIDE: u32 = 4;
/// Screen pixels covered by one ray sample.
pub const DEFAULT_PIXELS_PER_SAMPLE: f64 = 5.0;
/// Ray sample spacing when no map view drives the scan; about one SRTM3 post.
pub const DEFAULT_SAMPLE_SPACING_M: f64 = 90.0;
/// Largest number of test points a single scan may cover.
pub const MAX_GRID_POINTS: usize = 50_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// At least one viewpoint has an unobstructed line of sight.
    Seen,
    NotSeen,
    /// No usable ground: missing data, sea level or below.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScanPoint {
    pub location: LatLon,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub checked: u64,
    pub seen: u64,
    pub not_seen: u64,
    pub skipped: u64,
    /// Viewpoint/point pairs dropped by the range cutoff.
    pub broadphase_rejections: u64,
    /// Line-of-sight tests actually run.
    pub los_evaluations: u64,
    pub cancelled: bool,
}

impl ScanStats {
    fn absorb(&mut self, other: &ScanStats) {
        self.checked += other.checked;
        self.seen += other.seen;
        self.not_seen += other.not_seen;
        self.skipped += other.skipped;
        self.broadphase_rejections += other.broadphase_rejections;
        self.los_evaluations += other.los_evaluations;
        self.cancelled |= other.cancelled;
    }

    fn report(&self) {
        info!(
            skipped = self.skipped,
            los_evaluations = self.los_evaluations,
            broadphase_rejections = self.broadphase_rejections,
            cancelled = self.cancelled,
            "scan finished, {}/{} points seen",
            self.seen,
            self.checked
        );
    }
}

/// How many samples a line-of-sight ray gets.
#[derive(Clone)]
pub enum SampleSpacing {
    /// Same count for every ray.
    Fixed(usize),
    /// One sample per this many meters of ground distance.
    Meters(f64),
    /// One sample per `pixels_per_sample` pixels of on-screen distance
    /// between viewpoint and target.
    ScreenPixels {
        projection: Arc<dyn MapProjection + Send + Sync>,
        pixels_per_sample: f64,
    },
}

impl SampleSpacing {
    pub fn sample_count(&self, from: LatLon, to: LatLon) -> usize {
        match self {
            SampleSpacing::Fixed(n) => *n,
            SampleSpacing::Meters(spacing) => (from.distance_m(to) / spacing).ceil() as usize,
            SampleSpacing::ScreenPixels {
                projection,
                pixels_per_sample,
            } => {
                let (x0, y0) = projection.forward(from);
                let (x1, y1) = projection.forward(to);
                ((x1 - x0).hypot(y1 - y0) / pixels_per_sample) as usize
            }
        }
    }
}

impl fmt::Debug for SampleSpacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleSpacing::Fixed(n) => f.debug_tuple("Fixed").field(n).finish(),
            SampleSpacing::Meters(m) => f.debug_tuple("Meters").field(m).finish(),
            SampleSpacing::ScreenPixels {
                pixels_per_sample, ..
            } => f
                .debug_struct("ScreenPixels")
                .field("pixels_per_sample", pixels_per_sample)
                .finish_non_exhaustive(),
        }
    }
}

/// What to scan and with which sensor parameters.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub window: GeoWindow,
    pub lon_step: f64,
    pub lat_step: f64,
    pub altitude_m: f64,
    pub reference: AltitudeReference,
    pub max_range_km: f64,
    pub target_height_m: f64,
    pub samples: SampleSpacing,
}

impl ScanRequest {
    pub fn new(window: GeoWindow, lon_step: f64, lat_step: f64) -> Self {
        Self {
            window,
            lon_step,
            lat_step,
            altitude_m: DEFAULT_ALTITUDE_M,
            reference: AltitudeReference::MeanSeaLevel,
            max_range_km: DEFAULT_MAX_RANGE_KM,
            target_height_m: 0.0,
            samples: SampleSpacing::Meters(DEFAULT_SAMPLE_SPACING_M),
        }
    }

    /// Grid of one test point every `pixel_stride` pixels of the view, with
    /// ray samples sized from on-screen distance.
    pub fn from_projection(
        projection: Arc<dyn MapProjection + Send + Sync>,
        pixel_stride: u32,
        pixels_per_sample: f64,
    ) -> Self {
        let window = projection.window();
        let stride = pixel_stride.max(1);
        let across = (projection.width() / stride).max(1) as f64;
        let down = (projection.height() / stride).max(1) as f64;
        let lon_step = (window.east() - window.west()) / across;
        let lat_step = (window.north() - window.south()) / down;
        Self {
            samples: SampleSpacing::ScreenPixels {
                projection,
                pixels_per_sample,
            },
            ..Self::new(window, lon_step, lat_step)
        }
    }

    pub fn with_altitude(mut self, altitude_m: f64, reference: AltitudeReference) -> Self {
        self.altitude_m = altitude_m;
        self.reference = reference;
        self
    }

    pub fn with_max_range_km(mut self, max_range_km: f64) -> Self {
        self.max_range_km = max_range_km;
        self
    }

    pub fn with_target_height(mut self, target_height_m: f64) -> Self {
        self.target_height_m = target_height_m;
        self
    }

    pub fn with_samples(mut self, samples: SampleSpacing) -> Self {
        self.samples = samples;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.window;
        if ![w.north(), w.south(), w.east(), w.west()].iter().all(|v| v.is_finite()) {
            return Err(ConfigError::invalid("window bounds must be finite"));
        }
        if !(self.lon_step.is_finite() && self.lon_step > 0.0) {
            return Err(ConfigError::invalid(format!("longitude step must be positive, got {}", self.lon_step)));
        }
        if !(self.lat_step.is_finite() && self.lat_step > 0.0) {
            return Err(ConfigError::invalid(format!("latitude step must be positive, got {}", self.lat_step)));
        }
        if !(self.altitude_m.is_finite() && self.altitude_m >= 0.0) {
            return Err(ConfigError::invalid(format!("altitude must be non-negative, got {}", self.altitude_m)));
        }
        if !(self.max_range_km.is_finite() && self.max_range_km >= 0.0) {
            return Err(ConfigError::invalid(format!("max range must be non-negative, got {}", self.max_range_km)));
        }
        if !self.target_height_m.is_finite() {
            return Err(ConfigError::invalid("target height must be finite"));
        }
        let grid = ScanGrid::new(&self.window, self.lon_step, self.lat_step);
        if grid.columns.checked_mul(grid.rows).is_none_or(|n| n > MAX_GRID_POINTS) {
            return Err(ConfigError::invalid(format!(
                "grid of {} x {} points exceeds the limit of {MAX_GRID_POINTS}",
                grid.columns, grid.rows
            )));
        }
        match &self.samples {
            SampleSpacing::Meters(m) if !(m.is_finite() && *m > 0.0) => {
                Err(ConfigError::invalid(format!("sample spacing must be positive, got {m}")))
            }
            SampleSpacing::ScreenPixels {
                pixels_per_sample, ..
            } if !(pixels_per_sample.is_finite() && *pixels_per_sample > 0.0) => Err(ConfigError::invalid(
                format!("pixels per sample must be positive, got {pixels_per_sample}"),
            )),
            _ => Ok(()),
        }
    }
}

/// Geometric horizon distance in radians for an observer `altitude_m` above
/// the surface.
pub fn horizon_distance(altitude_m: f64) -> f64 {
    horizon_distance_rad(altitude_m)
}

/// Shared flag for stopping a scan from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Receives `(current, total)` column ticks while a scan runs.
pub trait ProgressSink: Send + Sync {
    fn update(&self, current: u32, total: u32);
}

#[derive(Debug, Default)]
pub struct AtomicProgress {
    pub current: Arc<AtomicU32>,
    total: AtomicU32,
}

impl AtomicProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u32 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn fraction(&self) -> f32 {
        match self.total() {
            0 => 0.0,
            total => self.current() as f32 / total as f32,
        }
    }
}

impl ProgressSink for AtomicProgress {
    fn update(&self, current: u32, total: u32) {
        self.total.store(total, Ordering::Relaxed);
        self.current.store(current, Ordering::Relaxed);
    }
}

/// Logs column ticks at roughly every tenth of a scan and on the last column.
#[derive(Debug, Clone, Copy)]
pub struct LogProgress {
    steps: u32,
}

impl Default for LogProgress {
    fn default() -> Self {
        Self { steps: 10 }
    }
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log `steps` times per scan instead of ten.
    pub fn with_steps(steps: u32) -> Self {
        Self { steps: steps.max(1) }
    }

    pub fn should_log(&self, current: u32, total: u32) -> bool {
        if total == 0 || current == 0 {
            return false;
        }
        current >= total || current % total.div_ceil(self.steps) == 0
    }
}

impl ProgressSink for LogProgress {
    fn update(&self, current: u32, total: u32) {
        if self.should_log(current, total) {
            info!(current, total, "Scan progress: column {current} of {total}");
        }
    }
}

fn progress_count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Test points of a window: `columns` longitudes from the west edge,
/// `rows` latitudes from the south edge. East and north edges are exclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanGrid {
    west: f64,
    south: f64,
    lon_step: f64,
    lat_step: f64,
    pub columns: usize,
    pub rows: usize,
}

impl ScanGrid {
    pub fn new(window: &GeoWindow, lon_step: f64, lat_step: f64) -> Self {
        let columns = steps(window.east() - window.west(), lon_step);
        let rows = steps(window.north() - window.south(), lat_step);
        let (columns, rows) = if columns == 0 || rows == 0 { (0, 0) } else { (columns, rows) };
        Self {
            west: window.west(),
            south: window.south(),
            lon_step,
            lat_step,
            columns,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.columns.saturating_mul(self.rows)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn point(&self, column: usize, row: usize) -> LatLon {
        LatLon::new(
            self.south + row as f64 * self.lat_step,
            self.west + column as f64 * self.lon_step,
        )
    }
}

fn steps(span: f64, step: f64) -> usize {
    if span <= 0.0 {
        return 0;
    }
    // Absorb rounding so an exact multiple does not gain a point on the edge.
    (span / step - 1e-6).ceil().max(0.0) as usize
}

/// Drives the per-point classification for one scan.
struct Classifier<'a, T: ?Sized> {
    terrain: &'a T,
    solver: LosSolver,
    viewpoints: Vec<Viewpoint>,
    request: ScanRequest,
    max_range_rad: f64,
    grid: ScanGrid,
}

impl<'a, T: TerrainProvider + ?Sized> Classifier<'a, T> {
    fn classify(&self, point: LatLon, stats: &mut ScanStats) -> Visibility {
        stats.checked += 1;

        if !matches!(self.terrain.elevation_at(point), Some(e) if e > 0) {
            stats.skipped += 1;
            return Visibility::Skipped;
        }

        for viewpoint in &self.viewpoints {
            if viewpoint.location.distance_rad(point) > self.max_range_rad {
                stats.broadphase_rejections += 1;
                continue;
            }
            let samples = self.request.samples.sample_count(viewpoint.location, point);
            stats.los_evaluations += 1;
            if self.solver.is_visible(
                viewpoint,
                point,
                self.request.target_height_m,
                samples,
                self.terrain,
            ) {
                stats.seen += 1;
                return Visibility::Seen;
            }
        }

        stats.not_seen += 1;
        Visibility::NotSeen
    }
}

pub struct MultiLosEngine<'a, T: ?Sized> {
    terrain: &'a T,
    solver: LosSolver,
    progress: Option<&'a dyn ProgressSink>,
}

impl<'a, T: TerrainProvider + ?Sized> MultiLosEngine<'a, T> {
    pub fn new(terrain: &'a T) -> Self {
        Self {
            terrain,
            solver: LosSolver::new(),
            progress: None,
        }
    }

    pub fn with_solver(mut self, solver: LosSolver) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }

    fn classifier(
        &self,
        viewpoints: &[LatLon],
        request: &ScanRequest,
    ) -> Result<Classifier<'a, T>, ConfigError> {
        request.validate()?;
        if let Some(bad) = viewpoints.iter().find(|vp| !is_valid_location(vp)) {
            return Err(ConfigError::invalid(format!(
                "viewpoint ({}, {}) is not a valid location",
                bad.latitude, bad.longitude
            )));
        }
        let viewpoints = viewpoints
            .iter()
            .map(|&location| Viewpoint {
                location,
                altitude_m: request.altitude_m,
                reference: request.reference,
            })
            .collect();
        Ok(Classifier {
            terrain: self.terrain,
            solver: self.solver,
            viewpoints,
            request: request.clone(),
            max_range_rad: km_to_radians(request.max_range_km),
            grid: ScanGrid::new(&request.window, request.lon_step, request.lat_step),
        })
    }

    /// Lazily classify every grid point of `request`, column by column from
    /// the west edge, each column from south to north.
    ///
    /// Only configuration problems are errors; terrain failures show up as
    /// `Skipped` points or non-blocking samples.
    pub fn scan(
        &self,
        viewpoints: &[LatLon],
        request: &ScanRequest,
        cancel: &CancelToken,
    ) -> Result<ScanIter<'a, T>, ConfigError> {
        let classifier = self.classifier(viewpoints, request)?;
        Ok(ScanIter {
            horizon_rad: horizon_distance(request.altitude_m),
            classifier,
            progress: self.progress,
            cancel: cancel.clone(),
            column: 0,
            row: 0,
            stats: ScanStats::default(),
            finished: false,
        })
    }

    /// Classify columns on the rayon pool and return them in scan order.
    ///
    /// After a cancellation the result ends at the first column that did not
    /// complete, so it is always a prefix of what [`scan`](Self::scan) yields.
    pub fn scan_parallel(
        &self,
        viewpoints: &[LatLon],
        request: &ScanRequest,
        cancel: &CancelToken,
    ) -> Result<ScanOutcome, ConfigError>
    where
        T: Sync,
    {
        let classifier = self.classifier(viewpoints, request)?;
        let grid = classifier.grid;
        let total = progress_count(grid.columns);
        let finished_columns = AtomicU32::new(0);

        let columns: Vec<ColumnScan> = (0..grid.columns)
            .into_par_iter()
            .map(|column| {
                let mut scan = ColumnScan::default();
                for row in 0..grid.rows {
                    if cancel.is_cancelled() {
                        scan.stats.cancelled = true;
                        return scan;
                    }
                    let location = grid.point(column, row);
                    let visibility = classifier.classify(location, &mut scan.stats);
                    scan.points.push(ScanPoint {
                        location,
                        visibility,
                    });
                }
                scan.complete = true;
                if let Some(sink) = self.progress {
                    let done = finished_columns.fetch_add(1, Ordering::Relaxed) + 1;
                    sink.update(done, total);
                }
                scan
            })
            .collect();

        let mut outcome = ScanOutcome {
            horizon_rad: horizon_distance(request.altitude_m),
            ..ScanOutcome::default()
        };
        for column in columns {
            outcome.stats.absorb(&column.stats);
            outcome.points.extend(column.points);
            if !column.complete {
                outcome.stats.cancelled = true;
                break;
            }
        }
        outcome.stats.report();
        Ok(outcome)
    }
}

fn is_valid_location(loc: &LatLon) -> bool {
    loc.latitude.is_finite()
        && loc.longitude.is_finite()
        && (-90.0..=90.0).contains(&loc.latitude)
        && (-180.0..=180.0).contains(&loc.longitude)
}

#[derive(Default)]
struct ColumnScan {
    points: Vec<ScanPoint>,
    stats: ScanStats,
    complete: bool,
}

/// Collected result of a parallel scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub points: Vec<ScanPoint>,
    pub stats: ScanStats,
    pub horizon_rad: f64,
}

/// Lazy, deterministic stream of classified points. Call
/// [`restart`](ScanIter::restart) to run the same scan again.
pub struct ScanIter<'a, T: ?Sized> {
    classifier: Classifier<'a, T>,
    progress: Option<&'a dyn ProgressSink>,
    cancel: CancelToken,
    horizon_rad: f64,
    column: usize,
    row: usize,
    stats: ScanStats,
    finished: bool,
}

impl<'a, T: TerrainProvider + ?Sized> ScanIter<'a, T> {
    /// Horizon distance of the scan's observer altitude, in radians.
    pub fn horizon_distance(&self) -> f64 {
        self.horizon_rad
    }

    pub fn grid(&self) -> ScanGrid {
        self.classifier.grid
    }

    pub fn viewpoints(&self) -> &[Viewpoint] {
        &self.classifier.viewpoints
    }

    /// Counters for the points yielded so far.
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn restart(&mut self) {
        self.column = 0;
        self.row = 0;
        self.stats = ScanStats::default();
        self.finished = false;
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.stats.report();
        }
    }
}

impl<'a, T: TerrainProvider + ?Sized> Iterator for ScanIter<'a, T> {
    type Item = ScanPoint;

    fn next(&mut self) -> Option<ScanPoint> {
        if self.finished {
            return None;
        }
        let grid = self.classifier.grid;
        if self.column >= grid.columns {
            self.finish();
            return None;
        }
        if self.cancel.is_cancelled() {
            self.stats.cancelled = true;
            self.finish();
            return None;
        }
        if self.row == 0 {
            if let Some(sink) = self.progress {
                sink.update(progress_count(self.column + 1), progress_count(grid.columns));
            }
        }

        let location = grid.point(self.column, self.row);
        let visibility = self.classifier.classify(location, &mut self.stats);

        self.row += 1;
        if self.row == grid.rows {
            self.row = 0;
            self.column += 1;
        }
        Some(ScanPoint {
            location,
            visibility,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.finished {
            return (0, Some(0));
        }
        let grid = self.classifier.grid;
        let done = self.column.saturating_mul(grid.rows).saturating_add(self.row);
        (0, Some(grid.len().saturating_sub(done)))
    }
}

/// Every grid point of `window` in scan order, without classification.
pub fn grid_points(window: &GeoWindow, lon_step: f64, lat_step: f64) -> impl Iterator<Item = LatLon> {
    let grid = ScanGrid::new(window, lon_step, lat_step);
    iproduct!(0..grid.columns, 0..grid.rows).map(move |(column, row)| grid.point(column, row))
}
