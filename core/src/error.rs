use thiserror::Error;

use crate::lifecycle::RideStatus;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Illegal ride transition: {from:?} -> {to:?}")]
    IllegalTransition { from: RideStatus, to: RideStatus },

    #[error("Actor does not own this resource")]
    NotAuthorized,

    /// Lost a race: the offer or ride was resolved by a concurrent actor.
    /// Informational to the caller, not a fault.
    #[error("Already resolved by a concurrent action")]
    AlreadyResolved,

    #[error("Offer TTL elapsed before a response arrived")]
    OfferExpired,

    /// Internal signal consumed by the reassignment controller; never
    /// surfaced to the requester as a hard failure.
    #[error("No eligible captains in the current search radius")]
    NoCandidatesAvailable,

    #[error("Ride is not reassignable from status {status:?}")]
    RideNotReassignable { status: RideStatus },

    #[error("Pickup code must be exactly 4 digits")]
    InvalidLength,

    #[error("Pickup code mismatch ({attempts_remaining} attempts remaining)")]
    CodeMismatch { attempts_remaining: u32 },

    #[error("Pickup verification locked after repeated mismatches")]
    LockedOut,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
