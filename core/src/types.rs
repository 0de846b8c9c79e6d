//! Shared primitive types used across the matching core.

use serde::{Deserialize, Serialize};

/// A stable, unique identifier for a ride.
pub type RideId = String;
/// A stable, unique identifier for a captain (driver).
pub type CaptainId = String;
/// A stable, unique identifier for an offer.
pub type OfferId = String;
/// A stable, unique identifier for a rider.
pub type RiderId = String;

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Requested vehicle class. Stored as snake_case text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    Bike,
    Auto,
    Car,
}

impl VehicleClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bike => "bike",
            Self::Auto => "auto",
            Self::Car => "car",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bike" => Some(Self::Bike),
            "auto" => Some(Self::Auto),
            "car" => Some(Self::Car),
            _ => None,
        }
    }
}
