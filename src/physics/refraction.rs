use serde::{Deserialize, Serialize};

use crate::geo::EARTH_RADIUS;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefractionParams {
    pub k_factor: f64,
}

impl Default for RefractionParams {
    fn default() -> Self {
        Self { k_factor: 4.0 / 3.0 }
    }
}

pub fn effective_earth_radius(params: RefractionParams) -> f64 {
    EARTH_RADIUS * params.k_factor
}

/// Height of the surface above the chord joining two points, at a spot `d1`
/// and `d2` meters of ground distance from either end.
pub fn curvature_drop(d1: f64, d2: f64, params: RefractionParams) -> f64 {
    (d1 * d2) / (2.0 * effective_earth_radius(params))
}
