//! ridematch-core — the matching and dispatch core of a ride-hailing
//! platform: ride lifecycle, offer dispatch, reassignment, captain
//! admission, fares, and pickup verification, all serialized through a
//! SQLite store.

pub mod admission;
pub mod clock;
pub mod config;
pub mod directions;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod fare;
pub mod lifecycle;
pub mod notify;
pub mod otp;
pub mod proximity;
pub mod reassign;
pub mod rng;
pub mod spatial;
pub mod store;
pub mod types;

pub use engine::{DispatchEngine, RideRequest};
pub use error::{DispatchError, DispatchResult};
