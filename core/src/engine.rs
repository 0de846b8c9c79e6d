//! The dispatch engine — composition root and public operation surface.
//!
//! Every entry point is a stateless worker invocation: read the store,
//! decide, write through a guarded CAS, emit events, return. Engines on
//! different hosts coordinate only through the database.
//!
//! RULES:
//!   - Components never call each other's internals; the engine wires them.
//!   - Notifications are fire-and-forget and never gate state progress.
//!   - Each operation resolves its locality's matching policy once at entry
//!     and threads that value through the whole cycle.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::admission::AdmissionPolicy;
use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::directions::{DirectionsProvider, HaversineDirections};
use crate::dispatch::{DispatchCycle, OfferDispatch};
use crate::error::{DispatchError, DispatchResult};
use crate::event::DispatchEvent;
use crate::fare::{compute_fare, fallback_geometry, FareBreakdown, TripGeometry};
use crate::lifecycle::{RideLifecycle, RideRecord, RideStatus};
use crate::notify::{LogNotifier, Notifier};
use crate::otp::OtpVerifier;
use crate::proximity::{CaptainRecord, CaptainStatus};
use crate::reassign::{MatchState, ReassignOutcome, ReassignReason, ReassignmentController};
use crate::rng::CodeRng;
use crate::store::DispatchStore;
use crate::types::{GeoPoint, RiderId, VehicleClass};

/// Everything needed to open a ride.
#[derive(Debug, Clone)]
pub struct RideRequest {
    pub rider_id: RiderId,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub pickup_address: String,
    pub drop_address: String,
    pub vehicle_class: VehicleClass,
    pub locality: String,
    pub surge_multiplier: f64,
    pub promo_code: Option<String>,
}

pub struct DispatchEngine {
    store: DispatchStore,
    clock: Clock,
    config: DispatchConfig,
    rng: CodeRng,
    notifier: Box<dyn Notifier>,
    directions: Box<dyn DirectionsProvider>,
}

impl DispatchEngine {
    pub fn new(store: DispatchStore, clock: Clock, config: DispatchConfig) -> Self {
        let avg_speed_kmh = config.fare_engine.fallback_avg_speed_kmh;
        Self {
            store,
            clock,
            config,
            rng: CodeRng::from_entropy(),
            notifier: Box::new(LogNotifier),
            directions: Box::new(HaversineDirections { avg_speed_kmh }),
        }
    }

    /// In-memory engine with a fixed clock, test config, and a seeded code
    /// stream. Used by tests and the demo runner.
    pub fn build_test(start: DateTime<Utc>, seed: u64) -> DispatchResult<Self> {
        let store = DispatchStore::in_memory()?;
        store.migrate()?;
        let mut engine = Self::new(store, Clock::fixed(start), DispatchConfig::default_test());
        engine.rng = CodeRng::seeded(seed);
        Ok(engine)
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_directions(mut self, directions: Box<dyn DirectionsProvider>) -> Self {
        self.directions = directions;
        self
    }

    pub fn store(&self) -> &DispatchStore {
        &self.store
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn get_ride(&self, ride_id: &str) -> DispatchResult<RideRecord> {
        self.store.get_ride(ride_id)
    }

    // ── Rider operations ───────────────────────────────────────

    /// Open a ride and run the first dispatch cycle.
    pub fn request_ride(&mut self, req: RideRequest) -> DispatchResult<(RideRecord, DispatchCycle)> {
        let now = self.clock.now();
        let cfg = self.config.matching_for(&req.locality);
        let fare = self.estimate(
            req.pickup,
            req.dropoff,
            req.vehicle_class,
            req.surge_multiplier,
            req.promo_code.as_deref(),
            now,
        )?;

        let ride = RideRecord {
            ride_id: Uuid::new_v4().to_string(),
            rider_id: req.rider_id.clone(),
            pickup: req.pickup,
            dropoff: req.dropoff,
            pickup_address: req.pickup_address,
            drop_address: req.drop_address,
            vehicle_class: req.vehicle_class,
            locality: req.locality.clone(),
            status: RideStatus::Pending,
            captain_id: None,
            vehicle_id: None,
            pickup_code: self.rng.pickup_code(),
            otp_attempts: 0,
            fare: Some(fare),
            match_state: MatchState::initial(cfg.initial_radius_km),
            requested_at: now,
            matched_at: None,
            cancelled_at: None,
            cancelled_by: None,
            cancel_reason: None,
        };
        self.store.insert_ride(&ride)?;
        self.store.append_event(
            "engine",
            &DispatchEvent::RideRequested {
                ride_id: ride.ride_id.clone(),
                rider_id: req.rider_id,
                vehicle_class: req.vehicle_class,
                locality: req.locality,
            },
            now,
        )?;
        log::info!(
            "ride {}: requested ({} in {})",
            ride.ride_id,
            ride.vehicle_class.as_str(),
            ride.locality
        );

        let cycle = self.dispatcher().dispatch_once(&ride.ride_id)?;
        self.notify_cycle(&ride.ride_id, &cycle)?;
        let ride = self.store.get_ride(&ride.ride_id)?;
        Ok((ride, cycle))
    }

    /// Estimate a fare without opening a ride.
    pub fn quote_fare(
        &self,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        vehicle_class: VehicleClass,
        surge_multiplier: f64,
        promo_code: Option<&str>,
    ) -> DispatchResult<FareBreakdown> {
        let fare = self.estimate(
            pickup,
            dropoff,
            vehicle_class,
            surge_multiplier,
            promo_code,
            self.clock.now(),
        )?;
        Ok(fare.rounded(self.config.fare_engine.minor_unit_decimals))
    }

    /// Rider cancels. Legal from any non-terminal state.
    pub fn cancel_ride(&mut self, ride_id: &str, rider_id: &str, reason: &str) -> DispatchResult<()> {
        let ride = self.store.get_ride(ride_id)?;
        if ride.rider_id != rider_id {
            return Err(DispatchError::NotAuthorized);
        }
        let lifecycle = RideLifecycle::new(&self.store, &self.clock);
        let prior = lifecycle.cancel(ride_id, "rider", reason)?;
        if prior.has_captain() {
            if let Some(captain_id) = &ride.captain_id {
                self.notifier
                    .notify_captain(captain_id, &format!("ride {ride_id} was cancelled by the rider"));
            }
        }
        Ok(())
    }

    /// Rider reports the matched captain is not moving; the ride goes back
    /// on the market without the reported captain.
    pub fn report_captain_delay(&mut self, ride_id: &str, rider_id: &str) -> DispatchResult<ReassignOutcome> {
        let ride = self.store.get_ride(ride_id)?;
        if ride.rider_id != rider_id {
            return Err(DispatchError::NotAuthorized);
        }
        let Some(captain_id) = ride.captain_id.clone() else {
            return Err(DispatchError::RideNotReassignable {
                status: ride.status,
            });
        };
        let controller = ReassignmentController::new(&self.store, &self.clock, &self.config);
        let outcome = controller.handle(
            ride_id,
            ReassignReason::CaptainDelayReported,
            Some(&captain_id),
        )?;
        self.notify_outcome(ride_id, outcome)?;
        Ok(outcome)
    }

    // ── Captain operations ─────────────────────────────────────

    pub fn upsert_captain(&mut self, captain: &CaptainRecord) -> DispatchResult<()> {
        self.store.upsert_captain(captain)
    }

    pub fn update_captain_location(
        &mut self,
        captain_id: &str,
        location: GeoPoint,
    ) -> DispatchResult<()> {
        self.store
            .update_captain_location(captain_id, location, self.clock.now())
    }

    /// Returns whether the flip happened (false: captain was not offline).
    pub fn set_captain_online(&mut self, captain_id: &str) -> DispatchResult<bool> {
        self.store
            .update_captain_status_cas(captain_id, CaptainStatus::Offline, CaptainStatus::Online)
    }

    /// Returns whether the flip happened (false: captain was on a ride or
    /// already offline).
    pub fn set_captain_offline(&mut self, captain_id: &str) -> DispatchResult<bool> {
        self.store
            .update_captain_status_cas(captain_id, CaptainStatus::Online, CaptainStatus::Offline)
    }

    pub fn accept_offer(&mut self, offer_id: &str, captain_id: &str) -> DispatchResult<()> {
        self.dispatcher().accept_offer(offer_id, captain_id)?;
        let offer = self.store.get_offer(offer_id)?;
        let ride = self.store.get_ride(&offer.ride_id)?;
        self.notifier
            .notify_rider(&ride.rider_id, "your captain is on the way");
        Ok(())
    }

    pub fn decline_offer(
        &mut self,
        offer_id: &str,
        captain_id: &str,
        reason: Option<&str>,
    ) -> DispatchResult<ReassignOutcome> {
        let outcome = self.dispatcher().decline_offer(offer_id, captain_id, reason)?;
        let offer = self.store.get_offer(offer_id)?;
        self.notify_outcome(&offer.ride_id, outcome)?;
        Ok(outcome)
    }

    pub fn mark_arriving(&mut self, ride_id: &str, captain_id: &str) -> DispatchResult<()> {
        self.captain_transition(
            ride_id,
            captain_id,
            RideStatus::Matched,
            RideStatus::CaptainArriving,
        )?;
        let ride = self.store.get_ride(ride_id)?;
        self.notifier
            .notify_rider(&ride.rider_id, "your captain is arriving");
        Ok(())
    }

    pub fn mark_waiting(&mut self, ride_id: &str, captain_id: &str) -> DispatchResult<()> {
        self.captain_transition(
            ride_id,
            captain_id,
            RideStatus::CaptainArriving,
            RideStatus::WaitingForRider,
        )?;
        let ride = self.store.get_ride(ride_id)?;
        self.notifier
            .notify_rider(&ride.rider_id, "your captain is waiting at the pickup");
        Ok(())
    }

    /// Start the trip by verifying the rider's pickup code.
    pub fn verify_pickup(
        &mut self,
        ride_id: &str,
        captain_id: &str,
        submitted: &str,
    ) -> DispatchResult<()> {
        let verifier = OtpVerifier::new(&self.store, &self.clock, &self.config.otp);
        verifier.verify(ride_id, captain_id, submitted)?;
        let ride = self.store.get_ride(ride_id)?;
        self.notifier.notify_rider(&ride.rider_id, "trip started");
        Ok(())
    }

    pub fn complete_ride(&mut self, ride_id: &str, captain_id: &str) -> DispatchResult<()> {
        let now = self.clock.now();
        self.captain_transition(
            ride_id,
            captain_id,
            RideStatus::InProgress,
            RideStatus::Completed,
        )?;

        let policy = AdmissionPolicy::new(self.config.admission.clone());
        let metrics = policy.record_completion(
            self.store.get_captain_metrics(captain_id)?,
            captain_id,
            now,
        );
        self.store.upsert_captain_metrics(&metrics)?;
        if !self.store.update_captain_status_cas(
            captain_id,
            CaptainStatus::OnRide,
            CaptainStatus::Online,
        )? {
            log::warn!("captain {captain_id}: not on_ride at completion");
        }

        let ride = self.store.get_ride(ride_id)?;
        let message = match &ride.fare {
            Some(fare) => format!(
                "trip completed, fare {:.2}",
                fare.rounded(self.config.fare_engine.minor_unit_decimals).final_fare
            ),
            None => "trip completed".to_string(),
        };
        self.notifier.notify_rider(&ride.rider_id, &message);
        Ok(())
    }

    /// Captain backs out after accepting. Counts toward the daily
    /// cancellation limit and puts the ride back on the market.
    pub fn captain_cancel(
        &mut self,
        ride_id: &str,
        captain_id: &str,
        reason: &str,
    ) -> DispatchResult<ReassignOutcome> {
        let ride = self.store.get_ride(ride_id)?;
        if ride.captain_id.as_deref() != Some(captain_id) {
            return Err(DispatchError::NotAuthorized);
        }
        log::info!("ride {ride_id}: captain {captain_id} cancelled ({reason})");
        let controller = ReassignmentController::new(&self.store, &self.clock, &self.config);
        let outcome = controller.handle(ride_id, ReassignReason::CaptainCancelled, Some(captain_id))?;
        self.notify_outcome(ride_id, outcome)?;
        Ok(outcome)
    }

    // ── Worker entry points ────────────────────────────────────

    /// Expire overdue offers and hand their rides back to the market.
    /// Returns the number of offers swept.
    pub fn sweep_expired_offers(&mut self) -> DispatchResult<u32> {
        self.dispatcher().sweep_expired_offers()
    }

    /// Claim and execute every due dispatch task. Returns the number run.
    /// A task is deleted only after its cycle completed; an error leaves
    /// the claimed row behind to be reclaimed when the lease lapses.
    pub fn run_due_tasks(&mut self) -> DispatchResult<u32> {
        let due = self.store.due_tasks(self.clock.now())?;
        let mut ran = 0u32;
        for task in due {
            let Some(task_id) = task.task_id else { continue };
            if !self.store.claim_task(task_id, self.clock.now())? {
                continue; // another worker got it
            }
            let cycle = self.dispatcher().dispatch_once(&task.ride_id)?;
            self.notify_cycle(&task.ride_id, &cycle)?;
            self.store.finish_task(task_id)?;
            ran += 1;
        }
        Ok(ran)
    }

    // ── Internals ──────────────────────────────────────────────

    fn dispatcher(&self) -> OfferDispatch<'_> {
        OfferDispatch::new(&self.store, &self.clock, &self.config)
    }

    fn estimate(
        &self,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        vehicle_class: VehicleClass,
        surge_multiplier: f64,
        promo_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> DispatchResult<FareBreakdown> {
        let cfg = self
            .config
            .fares
            .get(&vehicle_class)
            .ok_or_else(|| DispatchError::NotFound {
                entity: "fare class",
                id: vehicle_class.as_str().to_string(),
            })?;
        let geometry = self.route_or_fallback(pickup, dropoff);
        Ok(compute_fare(
            cfg,
            &geometry,
            surge_multiplier,
            promo_code,
            &self.config.promos,
            now,
        ))
    }

    fn route_or_fallback(&self, pickup: GeoPoint, dropoff: GeoPoint) -> TripGeometry {
        match self.directions.route(pickup, dropoff) {
            Ok(geometry) => geometry,
            Err(e) => {
                log::warn!("directions provider failed, using fallback estimate: {e}");
                fallback_geometry(
                    pickup,
                    dropoff,
                    self.config.fare_engine.fallback_avg_speed_kmh,
                )
            }
        }
    }

    fn captain_transition(
        &self,
        ride_id: &str,
        captain_id: &str,
        from: RideStatus,
        to: RideStatus,
    ) -> DispatchResult<()> {
        let ride = self.store.get_ride(ride_id)?;
        if ride.captain_id.as_deref() != Some(captain_id) {
            return Err(DispatchError::NotAuthorized);
        }
        let lifecycle = RideLifecycle::new(&self.store, &self.clock);
        lifecycle.advance(ride_id, from, to)
    }

    fn notify_cycle(&self, ride_id: &str, cycle: &DispatchCycle) -> DispatchResult<()> {
        match cycle {
            DispatchCycle::Offered { captain_id, .. } => {
                self.notifier
                    .notify_captain(captain_id, &format!("new ride offer for ride {ride_id}"));
            }
            DispatchCycle::NoCandidates(outcome) => {
                self.notify_outcome(ride_id, *outcome)?;
            }
            DispatchCycle::AlreadyInFlight | DispatchCycle::NotPending => {}
        }
        Ok(())
    }

    fn notify_outcome(&self, ride_id: &str, outcome: ReassignOutcome) -> DispatchResult<()> {
        if outcome == ReassignOutcome::Terminated {
            let ride = self.store.get_ride(ride_id)?;
            self.notifier.notify_rider(
                &ride.rider_id,
                "no captains available right now, please try again",
            );
        }
        Ok(())
    }
}
