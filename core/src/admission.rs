//! Captain admission policy — cancellation accounting and cooldowns.
//!
//! Three cancellations inside one local day put a captain on a 30-minute
//! cooldown (both numbers come from AdmissionConfig). The daily counter is
//! keyed by a date string derived from UTC plus a configurable offset, so a
//! deployment can align the reset with the city's midnight. Lifetime
//! counters feed the cancellation rate shown to operations.
//!
//! The policy computes the next metrics row; persistence happens in the
//! caller's transaction so the cancellation and its accounting land
//! together.

use chrono::{DateTime, Duration, Utc};

use crate::config::AdmissionConfig;
use crate::types::CaptainId;

/// Per-captain behavior counters, as persisted.
#[derive(Debug, Clone)]
pub struct CaptainMetricsRecord {
    pub captain_id: CaptainId,
    pub daily_cancel_count: u32,
    /// Local-day key the daily counter belongs to ("YYYY-MM-DD").
    pub daily_window_date: String,
    pub lifetime_cancelled: u64,
    pub lifetime_completed: u64,
    pub cancellation_rate: f64,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl CaptainMetricsRecord {
    pub fn fresh(captain_id: &str, day: String) -> Self {
        Self {
            captain_id: captain_id.to_string(),
            daily_cancel_count: 0,
            daily_window_date: day,
            lifetime_cancelled: 0,
            lifetime_completed: 0,
            cancellation_rate: 0.0,
            cooldown_until: None,
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        matches!(self.cooldown_until, Some(until) if now < until)
    }
}

pub struct AdmissionPolicy {
    config: AdmissionConfig,
}

impl AdmissionPolicy {
    pub fn new(config: AdmissionConfig) -> Self {
        Self { config }
    }

    /// The local-day key for `now`.
    pub fn day_key(&self, now: DateTime<Utc>) -> String {
        let shifted = now + Duration::minutes(self.config.day_boundary_offset_minutes);
        shifted.date_naive().to_string()
    }

    /// Account for one captain-initiated cancellation. Returns the metrics
    /// row to persist; `cooldown_until` is set once the daily count reaches
    /// the limit.
    pub fn record_cancellation(
        &self,
        existing: Option<CaptainMetricsRecord>,
        captain_id: &str,
        now: DateTime<Utc>,
    ) -> CaptainMetricsRecord {
        let day = self.day_key(now);
        let mut m = self.rolled(existing, captain_id, &day);

        m.daily_cancel_count += 1;
        m.lifetime_cancelled += 1;
        m.cancellation_rate = rate(m.lifetime_cancelled, m.lifetime_completed);

        if m.daily_cancel_count >= self.config.daily_cancel_limit {
            m.cooldown_until = Some(now + Duration::minutes(self.config.cooldown_minutes));
        }
        m
    }

    /// Account for a completed trip.
    pub fn record_completion(
        &self,
        existing: Option<CaptainMetricsRecord>,
        captain_id: &str,
        now: DateTime<Utc>,
    ) -> CaptainMetricsRecord {
        let day = self.day_key(now);
        let mut m = self.rolled(existing, captain_id, &day);
        m.lifetime_completed += 1;
        m.cancellation_rate = rate(m.lifetime_cancelled, m.lifetime_completed);
        m
    }

    /// Roll the daily window when the stored row belongs to an earlier day.
    /// A lapsed cooldown stays on the row; `in_cooldown` compares against
    /// the clock, so stale timestamps are inert.
    fn rolled(
        &self,
        existing: Option<CaptainMetricsRecord>,
        captain_id: &str,
        day: &str,
    ) -> CaptainMetricsRecord {
        match existing {
            None => CaptainMetricsRecord::fresh(captain_id, day.to_string()),
            Some(mut m) => {
                if m.daily_window_date != day {
                    m.daily_window_date = day.to_string();
                    m.daily_cancel_count = 0;
                }
                m
            }
        }
    }
}

fn rate(cancelled: u64, completed: u64) -> f64 {
    let total = cancelled + completed;
    if total == 0 {
        0.0
    } else {
        cancelled as f64 / total as f64
    }
}
