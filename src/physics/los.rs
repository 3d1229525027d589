use serde::{Deserialize, Serialize};

use crate::geo::{great_circle_point, LatLon};
use crate::physics::refraction::{curvature_drop, RefractionParams};

/// Terrain elevation lookups needed by the visibility code. `None` means no
/// valid data at that point.
pub trait TerrainProvider {
    /// Elevation of the nearest post, in meters.
    fn elevation_at(&self, loc: LatLon) -> Option<i16>;
    /// Elevation interpolated between posts, in meters.
    fn interpolated_elevation_at(&self, loc: LatLon) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AltitudeReference {
    /// Altitude is absolute, above mean sea level.
    #[default]
    MeanSeaLevel,
    /// Altitude is added to the terrain elevation under the observer.
    AboveGround,
}

/// An observer position. Immutable for the duration of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewpoint {
    pub location: LatLon,
    pub altitude_m: f64,
    #[serde(default)]
    pub reference: AltitudeReference,
}

impl Viewpoint {
    pub fn new(location: LatLon, altitude_m: f64) -> Self {
        Self {
            location,
            altitude_m,
            reference: AltitudeReference::MeanSeaLevel,
        }
    }

    pub fn above_ground(location: LatLon, altitude_m: f64) -> Self {
        Self {
            location,
            altitude_m,
            reference: AltitudeReference::AboveGround,
        }
    }

    /// Absolute height of the observer above mean sea level.
    pub fn absolute_height<T: TerrainProvider + ?Sized>(&self, terrain: &T) -> f64 {
        match self.reference {
            AltitudeReference::MeanSeaLevel => self.altitude_m,
            AltitudeReference::AboveGround => {
                terrain.interpolated_elevation_at(self.location).unwrap_or(0.0) + self.altitude_m
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LosResult {
    pub is_visible: bool,
    /// Ground distance from the observer to the first blocking sample.
    pub obstruction_dist_m: Option<f64>,
    /// Smallest height of the sight line above terrain over the samples
    /// examined, if any sample had data.
    pub min_clearance_m: Option<f64>,
}

/// Ray-march line-of-sight test against a terrain surface.
///
/// The sight line runs straight (in height) from the observer to the target
/// while its ground track follows the great circle. With refraction set, each
/// terrain sample is raised by the effective-earth bulge above that chord.
#[derive(Clone, Copy, Debug, Default)]
pub struct LosSolver {
    pub refraction: Option<RefractionParams>,
}

impl LosSolver {
    pub fn new() -> Self {
        Self { refraction: None }
    }

    pub fn with_refraction(refraction: RefractionParams) -> Self {
        Self {
            refraction: Some(refraction),
        }
    }

    /// True unless some terrain sample rises above the sight line.
    pub fn is_visible<T: TerrainProvider + ?Sized>(
        &self,
        observer: &Viewpoint,
        target: LatLon,
        target_height_agl: f64,
        sample_count: usize,
        terrain: &T,
    ) -> bool {
        self.check_visibility(observer, target, target_height_agl, sample_count, terrain)
            .is_visible
    }

    /// Split the path into `sample_count` equal steps and compare terrain to
    /// the sight line at every intermediate step. Samples without elevation
    /// data never block.
    pub fn check_visibility<T: TerrainProvider + ?Sized>(
        &self,
        observer: &Viewpoint,
        target: LatLon,
        target_height_agl: f64,
        sample_count: usize,
        terrain: &T,
    ) -> LosResult {
        let dist_m = observer.location.distance_m(target);
        let h_observer = observer.absolute_height(terrain);
        // Targets without data sit at sea level.
        let h_target = terrain.interpolated_elevation_at(target).unwrap_or(0.0) + target_height_agl;

        let mut min_clearance: Option<f64> = None;

        for i in 1..sample_count {
            let fraction = i as f64 / sample_count as f64;
            let pos = great_circle_point(observer.location, target, fraction);

            let Some(h_terrain) = terrain.interpolated_elevation_at(pos) else {
                continue;
            };
            let h_terrain = match self.refraction {
                Some(params) => {
                    let d = dist_m * fraction;
                    h_terrain + curvature_drop(d, dist_m - d, params)
                }
                None => h_terrain,
            };

            let h_sight = h_observer + (h_target - h_observer) * fraction;
            let clearance = h_sight - h_terrain;
            min_clearance = Some(min_clearance.map_or(clearance, |m| m.min(clearance)));

            if clearance < 0.0 {
                return LosResult {
                    is_visible: false,
                    obstruction_dist_m: Some(dist_m * fraction),
                    min_clearance_m: min_clearance,
                };
            }
        }

        LosResult {
            is_visible: true,
            obstruction_dist_m: None,
            min_clearance_m: min_clearance,
        }
    }
}
