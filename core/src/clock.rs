//! Time source — wall clock in production, a manually advanced fixed clock
//! in tests (offer TTLs and cooldowns are all wall-clock durations).

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub struct Clock {
    fixed: Option<Arc<Mutex<DateTime<Utc>>>>,
}

impl Clock {
    /// Production clock: reads the system time.
    pub fn wall() -> Self {
        Self { fixed: None }
    }

    /// Test clock: starts at `start` and only moves via `advance()`.
    pub fn fixed(start: DateTime<Utc>) -> Self {
        Self {
            fixed: Some(Arc::new(Mutex::new(start))),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match &self.fixed {
            None => Utc::now(),
            Some(cell) => *cell.lock().expect("clock mutex poisoned"),
        }
    }

    /// Advance a fixed clock. Panics on a wall clock — callers must only
    /// drive time in tests.
    pub fn advance(&self, by: Duration) {
        let cell = self
            .fixed
            .as_ref()
            .expect("advance() called on a wall clock");
        let mut now = cell.lock().expect("clock mutex poisoned");
        *now += by;
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::wall()
    }
}
