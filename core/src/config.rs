//! Policy configuration, loaded from JSON files under a data/ directory.
//! In tests, use DispatchConfig::default_test().

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::VehicleClass;

/// Matching policy for one locality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub locality: String,
    /// First dispatch searches within this radius.
    pub initial_radius_km: f64,
    /// Added on every reassignment, up to max_radius_km.
    pub radius_step_km: f64,
    pub max_radius_km: f64,
    /// Reassignments beyond this ceiling terminate the ride.
    pub max_retry_attempts: u32,
    /// Hard ceiling on offers created for a single ride.
    pub max_offers_per_ride: u32,
    pub offer_ttl_secs: i64,
    /// Settle delay between a decline/expiry and the next dispatch, so the
    /// preceding write lands before the next read.
    pub redispatch_delay_secs: i64,
    /// Timed retry interval while no candidates are available.
    pub rematch_retry_secs: i64,
    /// Captain locations older than this are ineligible.
    pub location_staleness_secs: i64,
}

/// Per-vehicle-class fare parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FareClassConfig {
    pub vehicle_class: VehicleClass,
    pub base_fare: f64,
    pub per_km: f64,
    pub per_min: f64,
    pub min_fare: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromoDiscount {
    Percent { percent: f64 },
    Flat { amount: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoConfig {
    pub code: String,
    pub discount: PromoDiscount,
    pub active: bool,
    #[serde(default)]
    pub valid_from: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub valid_until: Option<chrono::DateTime<chrono::Utc>>,
    /// Empty list means all classes.
    #[serde(default)]
    pub applicable_classes: Vec<VehicleClass>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Daily cancellations that trigger a cooldown.
    pub daily_cancel_limit: u32,
    pub cooldown_minutes: i64,
    /// Minutes added to UTC when deciding the local-day boundary.
    pub day_boundary_offset_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtpConfig {
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FareEngineConfig {
    /// Assumed speed for the haversine fallback estimate.
    pub fallback_avg_speed_kmh: f64,
    /// Minor-unit decimals for display rounding (2 for INR paise).
    pub minor_unit_decimals: u32,
    /// Fraction of the fare quoted to captains as estimated earnings.
    pub captain_earnings_share: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct MatchingFile {
    localities: Vec<MatchingConfig>,
    default_locality: String,
}

#[derive(Debug, Clone, Deserialize)]
struct FaresFile {
    classes: Vec<FareClassConfig>,
    engine: FareEngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct PromosFile {
    promos: Vec<PromoConfig>,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub matching: HashMap<String, MatchingConfig>,
    pub default_locality: String,
    pub fares: HashMap<VehicleClass, FareClassConfig>,
    pub fare_engine: FareEngineConfig,
    pub promos: HashMap<String, PromoConfig>,
    pub admission: AdmissionConfig,
    pub otp: OtpConfig,
}

impl DispatchConfig {
    /// Load from the data/ directory.
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let matching_path = format!("{data_dir}/matching/matching.json");
        let matching_content = std::fs::read_to_string(&matching_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {matching_path}: {e}"))?;
        let matching_file: MatchingFile = serde_json::from_str(&matching_content)?;
        let matching: HashMap<String, MatchingConfig> = matching_file
            .localities
            .into_iter()
            .map(|m| (m.locality.clone(), m))
            .collect();
        // matching_for falls back to the default; reject a config whose
        // fallback points nowhere instead of panicking later.
        if !matching.contains_key(&matching_file.default_locality) {
            anyhow::bail!(
                "default_locality '{}' has no entry in {matching_path}",
                matching_file.default_locality
            );
        }

        let fares_path = format!("{data_dir}/fares/fares.json");
        let fares_content = std::fs::read_to_string(&fares_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {fares_path}: {e}"))?;
        let fares_file: FaresFile = serde_json::from_str(&fares_content)?;
        let fares = fares_file
            .classes
            .into_iter()
            .map(|f| (f.vehicle_class, f))
            .collect();

        let promos_path = format!("{data_dir}/promos/promos.json");
        let promos_content = std::fs::read_to_string(&promos_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {promos_path}: {e}"))?;
        let promos_file: PromosFile = serde_json::from_str(&promos_content)?;
        let promos = promos_file
            .promos
            .into_iter()
            .map(|p| (p.code.clone(), p))
            .collect();

        Ok(Self {
            matching,
            default_locality: matching_file.default_locality,
            fares,
            fare_engine: fares_file.engine,
            promos,
            admission: AdmissionConfig {
                daily_cancel_limit: 3,
                cooldown_minutes: 30,
                day_boundary_offset_minutes: 0,
            },
            otp: OtpConfig { max_attempts: 3 },
        })
    }

    /// The matching policy for a locality, falling back to the default.
    pub fn matching_for(&self, locality: &str) -> &MatchingConfig {
        self.matching
            .get(locality)
            .or_else(|| self.matching.get(&self.default_locality))
            .expect("default locality must exist in matching config")
    }

    /// Config with hardcoded defaults for use in tests.
    pub fn default_test() -> Self {
        let city = MatchingConfig {
            locality: "test_city".into(),
            initial_radius_km: 1.5,
            radius_step_km: 1.0,
            max_radius_km: 5.0,
            max_retry_attempts: 3,
            max_offers_per_ride: 10,
            offer_ttl_secs: 30,
            redispatch_delay_secs: 2,
            rematch_retry_secs: 30,
            location_staleness_secs: 120,
        };

        let bike = FareClassConfig {
            vehicle_class: VehicleClass::Bike,
            base_fare: 20.0,
            per_km: 10.0,
            per_min: 1.0,
            min_fare: 30.0,
        };
        let auto = FareClassConfig {
            vehicle_class: VehicleClass::Auto,
            base_fare: 30.0,
            per_km: 14.0,
            per_min: 1.5,
            min_fare: 45.0,
        };
        let car = FareClassConfig {
            vehicle_class: VehicleClass::Car,
            base_fare: 50.0,
            per_km: 18.0,
            per_min: 2.0,
            min_fare: 80.0,
        };

        let welcome = PromoConfig {
            code: "WELCOME10".into(),
            discount: PromoDiscount::Percent { percent: 10.0 },
            active: true,
            valid_from: None,
            valid_until: None,
            applicable_classes: vec![],
        };
        let flat50 = PromoConfig {
            code: "FLAT50".into(),
            discount: PromoDiscount::Flat { amount: 50.0 },
            active: true,
            valid_from: None,
            valid_until: None,
            applicable_classes: vec![VehicleClass::Car],
        };

        Self {
            matching: [("test_city".to_string(), city)].into(),
            default_locality: "test_city".into(),
            fares: [
                (VehicleClass::Bike, bike),
                (VehicleClass::Auto, auto),
                (VehicleClass::Car, car),
            ]
            .into(),
            fare_engine: FareEngineConfig {
                fallback_avg_speed_kmh: 25.0,
                minor_unit_decimals: 2,
                captain_earnings_share: 0.8,
            },
            promos: [
                ("WELCOME10".to_string(), welcome),
                ("FLAT50".to_string(), flat50),
            ]
            .into(),
            admission: AdmissionConfig {
                daily_cancel_limit: 3,
                cooldown_minutes: 30,
                day_boundary_offset_minutes: 0,
            },
            otp: OtpConfig { max_attempts: 3 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal data/ tree on disk; `default_locality` is the caller's.
    fn write_data_dir(name: &str, default_locality: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ridematch-config-{name}-{}",
            std::process::id()
        ));
        for sub in ["matching", "fares", "promos"] {
            std::fs::create_dir_all(dir.join(sub)).unwrap();
        }
        let matching = serde_json::json!({
            "localities": [{
                "locality": "test_city",
                "initial_radius_km": 1.5,
                "radius_step_km": 1.0,
                "max_radius_km": 5.0,
                "max_retry_attempts": 3,
                "max_offers_per_ride": 10,
                "offer_ttl_secs": 30,
                "redispatch_delay_secs": 2,
                "rematch_retry_secs": 30,
                "location_staleness_secs": 120
            }],
            "default_locality": default_locality
        });
        std::fs::write(dir.join("matching/matching.json"), matching.to_string()).unwrap();
        let fares = serde_json::json!({
            "classes": [{
                "vehicle_class": "bike",
                "base_fare": 20.0,
                "per_km": 10.0,
                "per_min": 1.0,
                "min_fare": 30.0
            }],
            "engine": {
                "fallback_avg_speed_kmh": 25.0,
                "minor_unit_decimals": 2,
                "captain_earnings_share": 0.8
            }
        });
        std::fs::write(dir.join("fares/fares.json"), fares.to_string()).unwrap();
        std::fs::write(
            dir.join("promos/promos.json"),
            serde_json::json!({ "promos": [] }).to_string(),
        )
        .unwrap();
        dir
    }

    #[test]
    fn load_accepts_a_consistent_data_dir() {
        let dir = write_data_dir("ok", "test_city");
        let config = DispatchConfig::load(dir.to_str().unwrap()).unwrap();
        assert_eq!(config.matching_for("test_city").initial_radius_km, 1.5);
        // Unknown localities fall back to the default.
        assert_eq!(config.matching_for("elsewhere").locality, "test_city");
    }

    #[test]
    fn load_rejects_a_dangling_default_locality() {
        let dir = write_data_dir("dangling", "nowhere");
        let err = DispatchConfig::load(dir.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("default_locality"));
    }
}
