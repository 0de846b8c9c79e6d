//! Pickup verification — the 4-digit code gate between "captain waiting"
//! and "on trip".
//!
//! The code is generated at request time and shown only to the rider; the
//! captain types what the rider reads out. Three mismatches lock the ride
//! out of self-serve verification (support unlocks out of band). A
//! malformed submission is rejected before it consumes an attempt.

use crate::clock::Clock;
use crate::config::OtpConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::event::DispatchEvent;
use crate::lifecycle::{RideLifecycle, RideStatus};
use crate::store::DispatchStore;

pub struct OtpVerifier<'a> {
    store: &'a DispatchStore,
    clock: &'a Clock,
    config: &'a OtpConfig,
}

impl<'a> OtpVerifier<'a> {
    pub fn new(store: &'a DispatchStore, clock: &'a Clock, config: &'a OtpConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Verify `submitted` against the ride's pickup code and start the trip
    /// on a match. Only the assigned captain may verify, and only while the
    /// captain is waiting at the pickup.
    pub fn verify(&self, ride_id: &str, captain_id: &str, submitted: &str) -> DispatchResult<()> {
        let ride = self.store.get_ride(ride_id)?;
        if ride.captain_id.as_deref() != Some(captain_id) {
            return Err(DispatchError::NotAuthorized);
        }
        if ride.status != RideStatus::WaitingForRider {
            return Err(DispatchError::IllegalTransition {
                from: ride.status,
                to: RideStatus::InProgress,
            });
        }

        // Shape check first: a fat-fingered 3-digit entry is not an attempt.
        if submitted.len() != 4 || !submitted.chars().all(|c| c.is_ascii_digit()) {
            return Err(DispatchError::InvalidLength);
        }

        if ride.otp_attempts >= self.config.max_attempts {
            return Err(DispatchError::LockedOut);
        }

        if submitted != ride.pickup_code {
            let attempts = self.store.increment_otp_attempts(ride_id)?;
            log::warn!("ride {ride_id}: pickup code mismatch (attempt {attempts})");
            if attempts >= self.config.max_attempts {
                return Err(DispatchError::LockedOut);
            }
            return Err(DispatchError::CodeMismatch {
                attempts_remaining: self.config.max_attempts - attempts,
            });
        }

        let lifecycle = RideLifecycle::new(self.store, self.clock);
        lifecycle.advance(ride_id, RideStatus::WaitingForRider, RideStatus::InProgress)?;
        self.store.append_event(
            "otp",
            &DispatchEvent::PickupVerified {
                ride_id: ride_id.to_string(),
            },
            self.clock.now(),
        )?;
        log::info!("ride {ride_id}: pickup verified, trip started");
        Ok(())
    }
}
