use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Per-thread park/unpark primitive with a single sticky permit.
///
/// `unpark` leaves at most one pending permit; `park` consumes it and may
/// also return spuriously or, for the timed form, on timeout. Callers must
/// re-test their wait condition after every return.
pub struct ParkEvent {
    permit: Mutex<bool>,
    cvar: Condvar,
}

impl ParkEvent {
    pub const fn new() -> Self {
        Self {
            permit: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    /// Discard any stale permit before enqueueing on a monitor.
    pub fn reset(&self) {
        *self.permit.lock() = false;
    }

    pub fn park(&self) {
        let mut permit = self.permit.lock();
        if *permit {
            *permit = false;
            return;
        }
        self.cvar.wait(&mut permit);
        if *permit {
            *permit = false;
        }
    }

    /// Returns `true` iff the park ended by timeout.
    pub fn park_timed(&self, millis: u64) -> bool {
        let mut permit = self.permit.lock();
        if *permit {
            *permit = false;
            return false;
        }
        let timed_out = self
            .cvar
            .wait_for(&mut permit, Duration::from_millis(millis))
            .timed_out();
        if *permit {
            *permit = false;
            return false;
        }
        timed_out
    }

    pub fn unpark(&self) {
        let mut permit = self.permit.lock();
        *permit = true;
        self.cvar.notify_one();
    }
}

impl Default for ParkEvent {
    fn default() -> Self {
        Self::new()
    }
}
