//! Scan configuration and the CSV hand-off to whatever draws the result.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::coverage::{
    horizon_distance, ScanPoint, ScanRequest, Visibility, DEFAULT_ALTITUDE_M,
    DEFAULT_MAX_RANGE_KM, DEFAULT_PIXELS_PER_SAMPLE, DEFAULT_PIXEL_STRIDE,
};
use crate::error::ConfigError;
use crate::geo::{radians_to_km, LatLon, WebMercatorView};
use crate::physics::los::AltitudeReference;
use crate::terrain::{ElevationSource, SrtmSource, DEFAULT_HANDLE_BUDGET};

/// Viewpoints either as the legacy `"lat,lon;lat,lon"` string or as a list
/// of `[lat, lon]` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ViewPoints {
    Legacy(String),
    List(Vec<[f64; 2]>),
}

impl Default for ViewPoints {
    fn default() -> Self {
        ViewPoints::List(Vec::new())
    }
}

impl ViewPoints {
    pub fn parse(&self) -> Result<Vec<LatLon>, ConfigError> {
        match self {
            ViewPoints::List(pairs) => Ok(pairs.iter().map(|[lat, lon]| LatLon::new(*lat, *lon)).collect()),
            ViewPoints::Legacy(text) => text
                .split(';')
                .map(str::trim)
                .filter(|pair| !pair.is_empty())
                .map(parse_pair)
                .collect(),
        }
    }
}

fn parse_pair(pair: &str) -> Result<LatLon, ConfigError> {
    let (lat, lon) = pair
        .split(',')
        .map(str::trim)
        .collect_tuple()
        .ok_or_else(|| ConfigError::invalid(format!("cannot parse \"{pair}\" into a single lat,lon pair")))?;
    let lat: f64 = lat
        .parse()
        .map_err(|_| ConfigError::invalid(format!("cannot parse \"{pair}\" numerically")))?;
    let lon: f64 = lon
        .parse()
        .map_err(|_| ConfigError::invalid(format!("cannot parse \"{pair}\" numerically")))?;
    Ok(LatLon::new(lat, lon))
}

/// Pixel extent and corners of the map view the scan covers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MapView {
    pub upper_left: LatLon,
    pub lower_right: LatLon,
    pub width_px: u32,
    pub height_px: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub altitude_m: f64,
    pub altitude_reference: AltitudeReference,
    pub max_range_km: f64,
    pub view_points: ViewPoints,
    pub show_horizons: bool,
    pub show_view_points: bool,
    /// `AARRGGBB` hex; `None` hides seen points.
    pub can_see_color: Option<String>,
    pub can_not_see_color: Option<String>,
    /// One directory of `.hgt` tiles per resolution level.
    pub elevation_dirs: Vec<PathBuf>,
    pub elevation_level: usize,
    pub view: MapView,
    pub pixel_stride: u32,
    pub pixels_per_sample: f64,
    pub handle_budget: usize,
    pub target_height_m: f64,
    pub parallel: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            altitude_m: DEFAULT_ALTITUDE_M,
            altitude_reference: AltitudeReference::MeanSeaLevel,
            max_range_km: DEFAULT_MAX_RANGE_KM,
            view_points: ViewPoints::default(),
            show_horizons: true,
            show_view_points: true,
            can_see_color: Some("6400ff00".to_string()),
            can_not_see_color: None,
            elevation_dirs: Vec::new(),
            elevation_level: 0,
            view: MapView::default(),
            pixel_stride: DEFAULT_PIXEL_STRIDE,
            pixels_per_sample: DEFAULT_PIXELS_PER_SAMPLE,
            handle_budget: DEFAULT_HANDLE_BUDGET,
            target_height_m: 0.0,
            parallel: false,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.altitude_m.is_finite() && self.altitude_m >= 0.0) {
            return Err(ConfigError::invalid(format!("altitude_m must be non-negative, got {}", self.altitude_m)));
        }
        if !(self.max_range_km.is_finite() && self.max_range_km >= 0.0) {
            return Err(ConfigError::invalid(format!(
                "max_range_km must be non-negative, got {}",
                self.max_range_km
            )));
        }
        if !self.target_height_m.is_finite() {
            return Err(ConfigError::invalid("target_height_m must be finite"));
        }
        let viewpoints = self.viewpoints()?;
        if viewpoints.is_empty() {
            return Err(ConfigError::invalid("no view points configured"));
        }
        if let Some(bad) = viewpoints
            .iter()
            .find(|p| !(-90.0..=90.0).contains(&p.latitude) || !(-180.0..=180.0).contains(&p.longitude))
        {
            return Err(ConfigError::invalid(format!(
                "view point ({}, {}) is out of range",
                bad.latitude, bad.longitude
            )));
        }
        let view = &self.view;
        if view.width_px == 0 || view.height_px == 0 {
            return Err(ConfigError::invalid("view must have a non-zero pixel size"));
        }
        if view.upper_left.latitude <= view.lower_right.latitude
            || view.upper_left.longitude >= view.lower_right.longitude
        {
            return Err(ConfigError::invalid("view corners do not enclose an area"));
        }
        if self.pixel_stride == 0 {
            return Err(ConfigError::invalid("pixel_stride must be at least 1"));
        }
        if !(self.pixels_per_sample.is_finite() && self.pixels_per_sample > 0.0) {
            return Err(ConfigError::invalid("pixels_per_sample must be positive"));
        }
        if self.handle_budget == 0 {
            return Err(ConfigError::invalid("handle_budget must be at least 1"));
        }
        if self.elevation_dirs.is_empty() {
            return Err(ConfigError::invalid("no elevation directories configured"));
        }
        if self.elevation_level >= self.elevation_dirs.len() {
            return Err(ConfigError::invalid(format!(
                "elevation_level {} has no directory ({} configured)",
                self.elevation_level,
                self.elevation_dirs.len()
            )));
        }
        Ok(())
    }

    pub fn viewpoints(&self) -> Result<Vec<LatLon>, ConfigError> {
        self.view_points.parse()
    }

    pub fn projection(&self) -> WebMercatorView {
        WebMercatorView::new(
            self.view.upper_left,
            self.view.lower_right,
            self.view.width_px,
            self.view.height_px,
        )
    }

    pub fn scan_request(&self) -> ScanRequest {
        ScanRequest::from_projection(Arc::new(self.projection()), self.pixel_stride, self.pixels_per_sample)
            .with_altitude(self.altitude_m, self.altitude_reference)
            .with_max_range_km(self.max_range_km)
            .with_target_height(self.target_height_m)
    }

    pub fn sources(&self) -> Vec<Box<dyn ElevationSource>> {
        self.elevation_dirs
            .iter()
            .map(|dir| Box::new(SrtmSource::new(dir.clone())) as Box<dyn ElevationSource>)
            .collect()
    }

    pub fn render_style(&self) -> RenderStyle {
        RenderStyle {
            can_see: color_setting("can_see_color", self.can_see_color.as_deref()),
            can_not_see: color_setting("can_not_see_color", self.can_not_see_color.as_deref()),
            show_view_points: self.show_view_points,
            horizon_km: self
                .show_horizons
                .then(|| radians_to_km(horizon_distance(self.altitude_m))),
        }
    }
}

fn color_setting(name: &str, value: Option<&str>) -> Option<Color> {
    let value = value?;
    let color = Color::parse(value);
    if color.is_none() {
        warn!(setting = name, value, "unrecognized color, points of this class will not be drawn");
    }
    color
}

pub fn load_config_from_json(path: impl AsRef<Path>) -> Result<ScanConfig, ConfigError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let config: ScanConfig = serde_json::from_reader(reader)?;
    config.validate()?;
    Ok(config)
}

/// ARGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub a: u8,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    /// Parse `AARRGGBB` or `RRGGBB` hex, with or without a leading `#`.
    pub fn parse(text: &str) -> Option<Color> {
        let hex = text.trim().trim_start_matches('#');
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let value = u32::from_str_radix(hex, 16).ok()?;
        let argb = match hex.len() {
            8 => value,
            6 => 0xff00_0000 | value,
            _ => return None,
        };
        let [a, r, g, b] = argb.to_be_bytes();
        Some(Color { a, r, g, b })
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}{:02x}", self.a, self.r, self.g, self.b)
    }
}

/// Which classes and overlays end up in the output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderStyle {
    pub can_see: Option<Color>,
    pub can_not_see: Option<Color>,
    pub show_view_points: bool,
    /// Horizon circle radius, drawn around each viewpoint when set.
    pub horizon_km: Option<f64>,
}

#[derive(Debug, Serialize)]
struct CsvRecord {
    kind: &'static str,
    latitude: f64,
    longitude: f64,
    color: Option<String>,
    radius_km: Option<f64>,
}

/// Write overlays and classified points as CSV. `Skipped` points and classes
/// without a color are left out. Returns the number of rows written.
pub fn write_points_csv<W: Write>(
    writer: W,
    points: impl IntoIterator<Item = ScanPoint>,
    viewpoints: &[LatLon],
    style: &RenderStyle,
) -> Result<usize, csv::Error> {
    let mut wtr = csv::Writer::from_writer(writer);
    let mut rows = 0;

    for vp in viewpoints {
        if let Some(radius_km) = style.horizon_km {
            wtr.serialize(CsvRecord {
                kind: "horizon",
                latitude: vp.latitude,
                longitude: vp.longitude,
                color: None,
                radius_km: Some(radius_km),
            })?;
            rows += 1;
        }
        if style.show_view_points {
            wtr.serialize(CsvRecord {
                kind: "view_point",
                latitude: vp.latitude,
                longitude: vp.longitude,
                color: None,
                radius_km: None,
            })?;
            rows += 1;
        }
    }

    for point in points {
        let (kind, color) = match point.visibility {
            Visibility::Seen => ("seen", style.can_see),
            Visibility::NotSeen => ("not_seen", style.can_not_see),
            Visibility::Skipped => continue,
        };
        let Some(color) = color else { continue };
        wtr.serialize(CsvRecord {
            kind,
            latitude: point.location.latitude,
            longitude: point.location.longitude,
            color: Some(color.to_string()),
            radius_km: None,
        })?;
        rows += 1;
    }

    wtr.flush()?;
    Ok(rows)
}
