use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// WGS84 equatorial radius, used for every meters <-> radians conversion.
pub const EARTH_RADIUS: f64 = 6378137.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatLon {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLon {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Great-circle distance to `other`, in radians.
    pub fn distance_rad(&self, other: LatLon) -> f64 {
        central_angle(*self, other)
    }

    pub fn distance_m(&self, other: LatLon) -> f64 {
        radians_to_meters(central_angle(*self, other))
    }
}

/// Spherical arc between two points (haversine form), in radians.
pub fn central_angle(p1: LatLon, p2: LatLon) -> f64 {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let dlat = (p2.latitude - p1.latitude).to_radians();
    let dlon = (p2.longitude - p1.longitude).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Point at `fraction` (0.0 = `from`, 1.0 = `to`) along the great circle
/// joining the two points.
pub fn great_circle_point(from: LatLon, to: LatLon, fraction: f64) -> LatLon {
    let d = central_angle(from, to);
    if d < 1e-12 {
        return from;
    }

    let lat1 = from.latitude.to_radians();
    let lon1 = from.longitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let lon2 = to.longitude.to_radians();

    let a = ((1.0 - fraction) * d).sin() / d.sin();
    let b = (fraction * d).sin() / d.sin();

    let x = a * lat1.cos() * lon1.cos() + b * lat2.cos() * lon2.cos();
    let y = a * lat1.cos() * lon1.sin() + b * lat2.cos() * lon2.sin();
    let z = a * lat1.sin() + b * lat2.sin();

    LatLon {
        latitude: z.atan2((x * x + y * y).sqrt()).to_degrees(),
        longitude: y.atan2(x).to_degrees(),
    }
}

pub fn meters_to_radians(meters: f64) -> f64 {
    meters / EARTH_RADIUS
}

pub fn radians_to_meters(radians: f64) -> f64 {
    radians * EARTH_RADIUS
}

pub fn km_to_radians(km: f64) -> f64 {
    meters_to_radians(km * 1000.0)
}

pub fn radians_to_km(radians: f64) -> f64 {
    radians_to_meters(radians) / 1000.0
}

/// Geometric horizon for an observer `altitude_m` above the surface,
/// `sqrt(2·R·h + h²)`, returned as an arc in radians.
pub fn horizon_distance_rad(altitude_m: f64) -> f64 {
    let altitude_m = altitude_m.max(0.0);
    let horizon_m = (2.0 * EARTH_RADIUS * altitude_m + altitude_m * altitude_m).sqrt();
    meters_to_radians(horizon_m)
}

/// Rectangular lat/lon area, as reported by a map view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoWindow {
    pub upper_left: LatLon,
    pub lower_right: LatLon,
}

impl GeoWindow {
    pub fn new(upper_left: LatLon, lower_right: LatLon) -> Self {
        Self { upper_left, lower_right }
    }

    pub fn north(&self) -> f64 {
        self.upper_left.latitude.max(self.lower_right.latitude)
    }

    pub fn south(&self) -> f64 {
        self.upper_left.latitude.min(self.lower_right.latitude)
    }

    pub fn west(&self) -> f64 {
        self.upper_left.longitude.min(self.lower_right.longitude)
    }

    pub fn east(&self) -> f64 {
        self.upper_left.longitude.max(self.lower_right.longitude)
    }

    pub fn center(&self) -> LatLon {
        LatLon::new(
            (self.north() + self.south()) / 2.0,
            (self.east() + self.west()) / 2.0,
        )
    }
}

/// Coordinate transform supplied by the map display.
pub trait MapProjection {
    fn upper_left(&self) -> LatLon;
    fn lower_right(&self) -> LatLon;
    /// View width in pixels.
    fn width(&self) -> u32;
    /// View height in pixels.
    fn height(&self) -> u32;
    /// Pixel position of `loc`, origin at the upper-left corner.
    fn forward(&self, loc: LatLon) -> (f64, f64);

    fn window(&self) -> GeoWindow {
        GeoWindow::new(self.upper_left(), self.lower_right())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WebMercator {
    pub x: f64,
    pub y: f64,
}

/// Convert Lat/Lon (WGS84) to Web Mercator (EPSG:3857)
pub fn latlon_to_webmercator(coord: LatLon) -> WebMercator {
    let x = coord.longitude * (PI / 180.0) * EARTH_RADIUS;
    let y = ((coord.latitude * PI / 360.0 + PI / 4.0).tan()).ln() * EARTH_RADIUS;
    WebMercator { x, y }
}

/// Convert Web Mercator (EPSG:3857) to Lat/Lon (WGS84)
pub fn webmercator_to_latlon(coord: WebMercator) -> LatLon {
    let longitude = (coord.x / EARTH_RADIUS) * (180.0 / PI);
    let latitude = (2.0 * (coord.y / EARTH_RADIUS).exp().atan() - PI / 2.0) * (180.0 / PI);
    LatLon { latitude, longitude }
}

/// A Web Mercator map view of fixed pixel size, standing in for the display's
/// own projection when running headless.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WebMercatorView {
    upper_left: LatLon,
    lower_right: LatLon,
    width: u32,
    height: u32,
    origin: WebMercator,
    scale_x: f64,
    scale_y: f64,
}

impl WebMercatorView {
    pub fn new(upper_left: LatLon, lower_right: LatLon, width: u32, height: u32) -> Self {
        let origin = latlon_to_webmercator(upper_left);
        let far = latlon_to_webmercator(lower_right);
        let span_x = (far.x - origin.x).abs().max(f64::EPSILON);
        let span_y = (origin.y - far.y).abs().max(f64::EPSILON);
        Self {
            upper_left,
            lower_right,
            width,
            height,
            origin,
            scale_x: width as f64 / span_x,
            scale_y: height as f64 / span_y,
        }
    }

    /// Inverse of [`MapProjection::forward`].
    pub fn inverse(&self, x: f64, y: f64) -> LatLon {
        webmercator_to_latlon(WebMercator {
            x: self.origin.x + x / self.scale_x,
            y: self.origin.y - y / self.scale_y,
        })
    }
}

impl MapProjection for WebMercatorView {
    fn upper_left(&self) -> LatLon {
        self.upper_left
    }

    fn lower_right(&self) -> LatLon {
        self.lower_right
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn forward(&self, loc: LatLon) -> (f64, f64) {
        let m = latlon_to_webmercator(loc);
        (
            (m.x - self.origin.x) * self.scale_x,
            (self.origin.y - m.y) * self.scale_y,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_central_angle_one_degree() {
        let d = central_angle(LatLon::new(0.0, 0.0), LatLon::new(1.0, 0.0));
        assert_relative_eq!(d, 1.0f64.to_radians(), epsilon = 1e-12);
    }

    #[test]
    fn test_great_circle_midpoint_on_equator() {
        let mid = great_circle_point(LatLon::new(0.0, 10.0), LatLon::new(0.0, 20.0), 0.5);
        assert_relative_eq!(mid.latitude, 0.0, epsilon = 1e-9);
        assert_relative_eq!(mid.longitude, 15.0, epsilon = 1e-9);
    }

    #[test]
    fn test_great_circle_endpoints() {
        let a = LatLon::new(22.3, 116.0);
        let b = LatLon::new(24.3, 119.7);
        let start = great_circle_point(a, b, 0.0);
        let end = great_circle_point(a, b, 1.0);
        assert_relative_eq!(start.latitude, a.latitude, epsilon = 1e-9);
        assert_relative_eq!(end.longitude, b.longitude, epsilon = 1e-9);
    }

    #[test]
    fn test_horizon_distance() {
        // 500 m altitude: sqrt(2 * 6378137 * 500 + 500^2) ~= 79.86 km
        let km = radians_to_km(horizon_distance_rad(500.0));
        assert!((km - 79.86).abs() < 0.05, "got {km}");
        assert_eq!(horizon_distance_rad(0.0), 0.0);
    }

    #[test]
    fn test_webmercator_view_corners() {
        let view = WebMercatorView::new(LatLon::new(25.0, 115.0), LatLon::new(21.0, 121.0), 600, 400);
        let (x0, y0) = view.forward(LatLon::new(25.0, 115.0));
        let (x1, y1) = view.forward(LatLon::new(21.0, 121.0));
        assert_relative_eq!(x0, 0.0, epsilon = 1e-6);
        assert_relative_eq!(y0, 0.0, epsilon = 1e-6);
        assert_relative_eq!(x1, 600.0, epsilon = 1e-6);
        assert_relative_eq!(y1, 400.0, epsilon = 1e-6);

        let back = view.inverse(x1, y1);
        assert_relative_eq!(back.latitude, 21.0, epsilon = 1e-9);
    }
}
