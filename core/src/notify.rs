//! Notification seam. Delivery transport (push, SMS, websocket) lives
//! outside the core; the engine calls through this trait and never waits
//! on it.
//!
//! RULE: notification failures are logged, never returned — ride state
//! progress must not depend on a delivery channel.

pub trait Notifier {
    fn notify_rider(&self, rider_id: &str, message: &str);
    fn notify_captain(&self, captain_id: &str, message: &str);
}

/// Default sink: writes notifications to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_rider(&self, rider_id: &str, message: &str) {
        log::info!("notify rider {rider_id}: {message}");
    }

    fn notify_captain(&self, captain_id: &str, message: &str) {
        log::info!("notify captain {captain_id}: {message}");
    }
}
