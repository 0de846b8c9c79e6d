//! Routing seam. A real deployment plugs a directions service in here;
//! when the provider fails (or none is configured) the fare engine falls
//! back to the haversine estimate, so a quote is always produced.

use crate::error::DispatchResult;
use crate::fare::{GeometrySource, TripGeometry};
use crate::spatial::haversine_km;
use crate::types::GeoPoint;

pub trait DirectionsProvider {
    /// Road distance and duration between two points.
    fn route(&self, origin: GeoPoint, destination: GeoPoint) -> DispatchResult<TripGeometry>;
}

/// Default provider: straight-line distance at a configured average speed.
/// Same arithmetic as the fare engine's fallback, and tagged as an estimate
/// so breakdowns are honest about where the geometry came from.
pub struct HaversineDirections {
    pub avg_speed_kmh: f64,
}

impl DirectionsProvider for HaversineDirections {
    fn route(&self, origin: GeoPoint, destination: GeoPoint) -> DispatchResult<TripGeometry> {
        let distance_km = haversine_km(origin, destination);
        let duration_min = if self.avg_speed_kmh > 0.0 {
            distance_km / self.avg_speed_kmh * 60.0
        } else {
            0.0
        };
        Ok(TripGeometry {
            distance_km,
            duration_min,
            source: GeometrySource::Estimated,
        })
    }
}
