//! Reassignment controller — the single writer of a ride's match state.
//!
//! Declines, expiries, captain cancellations, and empty candidate sets all
//! funnel into `handle()`. Each invocation widens the search radius by one
//! step (capped at the locality maximum), excludes the captain who walked
//! away, and either queues a deferred re-dispatch or terminates the ride
//! once the retry ceiling is crossed.
//!
//! RULES:
//!   - Nothing else mutates ride.match_state.
//!   - The reset, the offer cleanup, the captain release, the cancellation
//!     accounting, and the follow-up task are one transaction: a crash
//!     leaves the ride either fully reassigned or untouched.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::admission::{AdmissionPolicy, CaptainMetricsRecord};
use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::event::DispatchEvent;
use crate::lifecycle::RideStatus;
use crate::store::DispatchStore;
use crate::types::{CaptainId, RideId};

/// Why a ride is being put back on the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassignReason {
    CaptainCancelled,
    OfferDeclined,
    OfferExpired,
    NoCandidates,
    CaptainDelayReported,
}

impl ReassignReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CaptainCancelled => "captain_cancelled",
            Self::OfferDeclined => "offer_declined",
            Self::OfferExpired => "offer_expired",
            Self::NoCandidates => "no_candidates",
            Self::CaptainDelayReported => "captain_delay_reported",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "captain_cancelled" => Some(Self::CaptainCancelled),
            "offer_declined" => Some(Self::OfferDeclined),
            "offer_expired" => Some(Self::OfferExpired),
            "no_candidates" => Some(Self::NoCandidates),
            "captain_delay_reported" => Some(Self::CaptainDelayReported),
            _ => None,
        }
    }
}

/// Matching progress for one ride, stored as a JSON column on the ride row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchState {
    pub excluded_captain_ids: Vec<CaptainId>,
    pub reassignment_count: u32,
    pub current_radius_km: f64,
}

impl MatchState {
    pub fn initial(radius_km: f64) -> Self {
        Self {
            excluded_captain_ids: Vec::new(),
            reassignment_count: 0,
            current_radius_km: radius_km,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Put the ride back on the market after a decline/expiry/cancel.
    Redispatch,
    /// Timed retry after a dispatch cycle found no candidates.
    RematchRetry,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redispatch => "redispatch",
            Self::RematchRetry => "rematch_retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "redispatch" => Some(Self::Redispatch),
            "rematch_retry" => Some(Self::RematchRetry),
            _ => None,
        }
    }
}

/// One row of deferred work. Claimed (deleted) by `run_due_tasks`.
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub task_id: Option<i64>,
    pub ride_id: RideId,
    pub kind: TaskKind,
    pub reason: Option<ReassignReason>,
    pub acting_captain_id: Option<CaptainId>,
    pub attempt: u32,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Everything `apply_reassignment` must persist atomically.
pub struct ReassignmentPlan {
    pub ride_id: RideId,
    pub prior_status: RideStatus,
    pub outcome: PlanOutcome,
    /// Captain to flip back from on_ride to online.
    pub released_captain: Option<CaptainId>,
    /// Cancellation accounting for the captain who walked away.
    pub metrics: Option<CaptainMetricsRecord>,
    pub events: Vec<DispatchEvent>,
}

pub enum PlanOutcome {
    Redispatch {
        match_state: MatchState,
        task: DispatchTask,
    },
    Terminate {
        match_state: MatchState,
        cancel_reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReassignOutcome {
    Redispatched { attempt: u32, radius_km: f64 },
    Terminated,
    /// A concurrent actor moved the ride first, or it is past the point of
    /// reassignment. Not a fault.
    Skipped,
}

pub struct ReassignmentController<'a> {
    store: &'a DispatchStore,
    clock: &'a Clock,
    config: &'a DispatchConfig,
}

impl<'a> ReassignmentController<'a> {
    pub fn new(store: &'a DispatchStore, clock: &'a Clock, config: &'a DispatchConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Process one reassignment trigger for `ride_id`. A lost CAS is
    /// retried once after a re-read before surfacing `AlreadyResolved`.
    pub fn handle(
        &self,
        ride_id: &str,
        reason: ReassignReason,
        acting_captain: Option<&str>,
    ) -> DispatchResult<ReassignOutcome> {
        for retry in 0..2 {
            match self.handle_once(ride_id, reason, acting_captain)? {
                Some(outcome) => return Ok(outcome),
                None => {
                    if retry == 0 {
                        log::debug!("ride {ride_id}: lost reassignment race, retrying");
                    }
                }
            }
        }
        Err(DispatchError::AlreadyResolved)
    }

    /// One attempt; None means the status guard failed and the plan rolled
    /// back.
    fn handle_once(
        &self,
        ride_id: &str,
        reason: ReassignReason,
        acting_captain: Option<&str>,
    ) -> DispatchResult<Option<ReassignOutcome>> {
        let now = self.clock.now();
        let ride = self.store.get_ride(ride_id)?;
        if !ride.status.is_reassignable() {
            return Err(DispatchError::RideNotReassignable {
                status: ride.status,
            });
        }

        let cfg = self.config.matching_for(&ride.locality);

        let mut state = ride.match_state.clone();
        state.reassignment_count += 1;
        state.current_radius_km = (cfg.initial_radius_km
            + state.reassignment_count as f64 * cfg.radius_step_km)
            .min(cfg.max_radius_km);
        if let Some(captain) = acting_captain {
            if reason != ReassignReason::NoCandidates
                && !state.excluded_captain_ids.iter().any(|id| id == captain)
            {
                state.excluded_captain_ids.push(captain.to_string());
            }
        }

        // Cancellation accounting rides in the same transaction.
        let metrics = match (reason, acting_captain) {
            (ReassignReason::CaptainCancelled, Some(captain)) => {
                let policy = AdmissionPolicy::new(self.config.admission.clone());
                let existing = self.store.get_captain_metrics(captain)?;
                let had_cooldown = existing
                    .as_ref()
                    .map(|m| m.in_cooldown(now))
                    .unwrap_or(false);
                let updated = policy.record_cancellation(existing, captain, now);
                let cooldown_started = !had_cooldown && updated.in_cooldown(now);
                Some((updated, cooldown_started))
            }
            _ => None,
        };

        let released_captain = if ride.status.has_captain() {
            ride.captain_id.clone()
        } else {
            None
        };

        let offers_made = self.store.offer_count_for_ride(ride_id)?;
        let exhausted = state.reassignment_count > cfg.max_retry_attempts
            || offers_made >= cfg.max_offers_per_ride;

        let mut events = Vec::new();
        if let Some((m, true)) = &metrics {
            if let Some(until) = m.cooldown_until {
                events.push(DispatchEvent::CaptainCooldownStarted {
                    captain_id: m.captain_id.clone(),
                    until,
                });
            }
        }

        let plan = if exhausted {
            events.push(DispatchEvent::RideCancelled {
                ride_id: ride_id.to_string(),
                cancelled_by: "system".to_string(),
                reason: "no_captains_available".to_string(),
            });
            ReassignmentPlan {
                ride_id: ride_id.to_string(),
                prior_status: ride.status,
                outcome: PlanOutcome::Terminate {
                    match_state: state,
                    cancel_reason: "no_captains_available".to_string(),
                },
                released_captain,
                metrics: metrics.map(|(m, _)| m),
                events,
            }
        } else {
            let delay = match reason {
                ReassignReason::NoCandidates => cfg.rematch_retry_secs,
                _ => cfg.redispatch_delay_secs,
            };
            let kind = match reason {
                ReassignReason::NoCandidates => TaskKind::RematchRetry,
                _ => TaskKind::Redispatch,
            };
            events.push(DispatchEvent::RideReassigned {
                ride_id: ride_id.to_string(),
                reason,
                attempt: state.reassignment_count,
                radius_km: state.current_radius_km,
            });
            let attempt = state.reassignment_count;
            let radius_km = state.current_radius_km;
            ReassignmentPlan {
                ride_id: ride_id.to_string(),
                prior_status: ride.status,
                outcome: PlanOutcome::Redispatch {
                    match_state: state,
                    task: DispatchTask {
                        task_id: None,
                        ride_id: ride_id.to_string(),
                        kind,
                        reason: Some(reason),
                        acting_captain_id: acting_captain.map(str::to_string),
                        attempt,
                        run_after: now + Duration::seconds(delay),
                        created_at: now,
                    },
                },
                released_captain,
                metrics: metrics.map(|(m, _)| m),
                events,
            }
        };

        let terminated = matches!(plan.outcome, PlanOutcome::Terminate { .. });
        let (attempt, radius_km) = match &plan.outcome {
            PlanOutcome::Redispatch { match_state, .. }
            | PlanOutcome::Terminate { match_state, .. } => {
                (match_state.reassignment_count, match_state.current_radius_km)
            }
        };

        if !self.store.apply_reassignment(&plan, now)? {
            return Ok(None);
        }

        if terminated {
            log::info!(
                "ride {ride_id}: terminated after {} reassignments ({})",
                attempt,
                reason.as_str()
            );
            Ok(Some(ReassignOutcome::Terminated))
        } else {
            log::info!(
                "ride {ride_id}: reassignment {} ({}) radius {:.1} km",
                attempt,
                reason.as_str(),
                radius_km
            );
            Ok(Some(ReassignOutcome::Redispatched { attempt, radius_km }))
        }
    }
}
