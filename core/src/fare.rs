//! Fare engine — pure computation from trip geometry to a fare breakdown.
//!
//! Formula: `subtotal = base + distance_km * per_km + duration_min * per_min`,
//! surge (≥ 1) applies to the subtotal before the minimum-fare floor, promos
//! discount the floored total and are clamped to a non-negative fare. A promo
//! that fails validation never fails the estimate — the rejection reason is
//! carried on the breakdown instead.
//!
//! Monetary fields stay unrounded internally; `rounded()` produces the
//! display view at minor-unit precision so the base/distance/time split
//! reconciles against a receipt without compounding rounding error.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{FareClassConfig, PromoConfig, PromoDiscount};
use crate::spatial::haversine_km;
use crate::types::{GeoPoint, VehicleClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometrySource {
    /// Distance/duration from the directions provider.
    Routed,
    /// Haversine fallback with an assumed average speed.
    Estimated,
}

#[derive(Debug, Clone, Copy)]
pub struct TripGeometry {
    pub distance_km: f64,
    pub duration_min: f64,
    pub source: GeometrySource,
}

/// Deterministic estimate used when the directions provider is unavailable.
/// Produces the same breakdown shape as the routed path.
pub fn fallback_geometry(pickup: GeoPoint, dropoff: GeoPoint, avg_speed_kmh: f64) -> TripGeometry {
    let distance_km = haversine_km(pickup, dropoff);
    let duration_min = if avg_speed_kmh > 0.0 {
        distance_km / avg_speed_kmh * 60.0
    } else {
        0.0
    };
    TripGeometry {
        distance_km,
        duration_min,
        source: GeometrySource::Estimated,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FareBreakdown {
    pub base_fare: f64,
    pub distance_fare: f64,
    pub time_fare: f64,
    pub surge_multiplier: f64,
    pub subtotal: f64,
    pub discount: f64,
    pub final_fare: f64,
    pub promo_code: Option<String>,
    pub promo_rejection: Option<String>,
    pub source: GeometrySource,
}

impl FareBreakdown {
    /// Display view, rounded to the currency's minor-unit precision.
    pub fn rounded(&self, minor_unit_decimals: u32) -> FareBreakdown {
        let r = |v: f64| round_minor(v, minor_unit_decimals);
        FareBreakdown {
            base_fare: r(self.base_fare),
            distance_fare: r(self.distance_fare),
            time_fare: r(self.time_fare),
            surge_multiplier: self.surge_multiplier,
            subtotal: r(self.subtotal),
            discount: r(self.discount),
            final_fare: r(self.final_fare),
            promo_code: self.promo_code.clone(),
            promo_rejection: self.promo_rejection.clone(),
            source: self.source,
        }
    }
}

fn round_minor(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() / scale
}

/// Why a promo was rejected. Carried through as a string on the breakdown.
fn validate_promo(
    promo: &PromoConfig,
    vehicle_class: VehicleClass,
    now: DateTime<Utc>,
) -> Result<(), &'static str> {
    if !promo.active {
        return Err("inactive");
    }
    if let Some(from) = promo.valid_from {
        if now < from {
            return Err("not_yet_active");
        }
    }
    if let Some(until) = promo.valid_until {
        if now > until {
            return Err("expired");
        }
    }
    if !promo.applicable_classes.is_empty()
        && !promo.applicable_classes.contains(&vehicle_class)
    {
        return Err("not_applicable_to_vehicle_class");
    }
    Ok(())
}

pub fn compute_fare(
    cfg: &FareClassConfig,
    geometry: &TripGeometry,
    surge_multiplier: f64,
    promo_code: Option<&str>,
    promos: &HashMap<String, PromoConfig>,
    now: DateTime<Utc>,
) -> FareBreakdown {
    let surge = surge_multiplier.max(1.0);
    let distance_fare = geometry.distance_km * cfg.per_km;
    let time_fare = geometry.duration_min * cfg.per_min;
    let subtotal = cfg.base_fare + distance_fare + time_fare;
    let total = (subtotal * surge).max(cfg.min_fare);

    let (discount, promo_rejection) = match promo_code {
        None => (0.0, None),
        Some(code) => match promos.get(code) {
            None => (0.0, Some("unknown_code".to_string())),
            Some(promo) => match validate_promo(promo, cfg.vehicle_class, now) {
                Err(reason) => (0.0, Some(reason.to_string())),
                Ok(()) => {
                    let raw = match promo.discount {
                        PromoDiscount::Percent { percent } => total * percent / 100.0,
                        PromoDiscount::Flat { amount } => amount,
                    };
                    // Clamp: a promo never produces a negative fare.
                    (raw.min(total).max(0.0), None)
                }
            },
        },
    };

    FareBreakdown {
        base_fare: cfg.base_fare,
        distance_fare,
        time_fare,
        surge_multiplier: surge,
        subtotal,
        discount,
        final_fare: total - discount,
        promo_code: promo_code.map(str::to_string),
        promo_rejection,
        source: geometry.source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;

    fn bike() -> FareClassConfig {
        DispatchConfig::default_test().fares[&VehicleClass::Bike].clone()
    }

    fn geometry(distance_km: f64, duration_min: f64) -> TripGeometry {
        TripGeometry {
            distance_km,
            duration_min,
            source: GeometrySource::Routed,
        }
    }

    #[test]
    fn fare_above_floor_uses_components() {
        let fare = compute_fare(
            &bike(),
            &geometry(5.0, 15.0),
            1.0,
            None,
            &HashMap::new(),
            Utc::now(),
        );
        assert_eq!(fare.distance_fare, 50.0);
        assert_eq!(fare.time_fare, 15.0);
        assert_eq!(fare.subtotal, 85.0);
        assert_eq!(fare.final_fare, 85.0);
    }

    #[test]
    fn short_trip_hits_minimum_fare() {
        let fare = compute_fare(
            &bike(),
            &geometry(0.5, 2.0),
            1.0,
            None,
            &HashMap::new(),
            Utc::now(),
        );
        assert_eq!(fare.subtotal, 27.0);
        assert_eq!(fare.final_fare, 30.0);
    }

    #[test]
    fn surge_applies_before_floor() {
        // 27 * 2.0 = 54 clears the 30 floor; floor does not stack on surge.
        let fare = compute_fare(
            &bike(),
            &geometry(0.5, 2.0),
            2.0,
            None,
            &HashMap::new(),
            Utc::now(),
        );
        assert_eq!(fare.final_fare, 54.0);
    }

    #[test]
    fn surge_below_one_is_clamped() {
        let fare = compute_fare(
            &bike(),
            &geometry(5.0, 15.0),
            0.5,
            None,
            &HashMap::new(),
            Utc::now(),
        );
        assert_eq!(fare.surge_multiplier, 1.0);
        assert_eq!(fare.final_fare, 85.0);
    }

    #[test]
    fn percent_promo_discounts_total() {
        let cfg = DispatchConfig::default_test();
        let fare = compute_fare(
            &bike(),
            &geometry(5.0, 15.0),
            1.0,
            Some("WELCOME10"),
            &cfg.promos,
            Utc::now(),
        );
        assert_eq!(fare.discount, 8.5);
        assert_eq!(fare.final_fare, 76.5);
        assert!(fare.promo_rejection.is_none());
    }

    #[test]
    fn flat_promo_clamps_to_non_negative() {
        let cfg = DispatchConfig::default_test();
        let mut promos = cfg.promos.clone();
        promos.insert(
            "BIG".into(),
            PromoConfig {
                code: "BIG".into(),
                discount: PromoDiscount::Flat { amount: 500.0 },
                active: true,
                valid_from: None,
                valid_until: None,
                applicable_classes: vec![],
            },
        );
        let fare = compute_fare(&bike(), &geometry(5.0, 15.0), 1.0, Some("BIG"), &promos, Utc::now());
        assert_eq!(fare.final_fare, 0.0);
    }

    #[test]
    fn rejected_promo_carries_reason_without_failing() {
        let cfg = DispatchConfig::default_test();
        // FLAT50 only applies to cars.
        let fare = compute_fare(
            &bike(),
            &geometry(5.0, 15.0),
            1.0,
            Some("FLAT50"),
            &cfg.promos,
            Utc::now(),
        );
        assert_eq!(fare.discount, 0.0);
        assert_eq!(fare.final_fare, 85.0);
        assert_eq!(
            fare.promo_rejection.as_deref(),
            Some("not_applicable_to_vehicle_class")
        );
    }

    #[test]
    fn unknown_promo_is_rejected_not_fatal() {
        let fare = compute_fare(
            &bike(),
            &geometry(5.0, 15.0),
            1.0,
            Some("NOPE"),
            &HashMap::new(),
            Utc::now(),
        );
        assert_eq!(fare.promo_rejection.as_deref(), Some("unknown_code"));
        assert_eq!(fare.final_fare, 85.0);
    }

    #[test]
    fn fallback_estimate_has_same_shape() {
        let pickup = GeoPoint::new(12.9716, 77.5946);
        let dropoff = GeoPoint::new(12.9352, 77.6245);
        let geom = fallback_geometry(pickup, dropoff, 25.0);
        assert_eq!(geom.source, GeometrySource::Estimated);
        assert!(geom.distance_km > 0.0);
        assert!(geom.duration_min > 0.0);

        let fare = compute_fare(&bike(), &geom, 1.0, None, &HashMap::new(), Utc::now());
        assert_eq!(fare.source, GeometrySource::Estimated);
        assert!(fare.final_fare >= bike().min_fare);
    }

    #[test]
    fn rounding_happens_only_at_display() {
        let fare = compute_fare(
            &bike(),
            &geometry(1.234, 3.21),
            1.0,
            None,
            &HashMap::new(),
            Utc::now(),
        );
        // Internal values keep full precision.
        assert!((fare.distance_fare - 12.34).abs() < 1e-9);
        let display = fare.rounded(2);
        assert_eq!(display.distance_fare, 12.34);
        assert_eq!(display.subtotal, 35.55);
    }
}
