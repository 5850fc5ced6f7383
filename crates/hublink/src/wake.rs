//! Single-permit wake signals for the worker threads.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A doorbell: `ring` leaves at most one pending permit, `wait` parks until a
/// permit is available and consumes it. Rings coalesce: a worker woken once
/// handles all the work visible at that moment, so repeated rings while it
/// runs cost nothing. A parked worker consumes no CPU.
#[derive(Debug, Default)]
pub struct Doorbell {
    permit: Mutex<bool>,
    cond: Condvar,
}

impl Doorbell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring(&self) {
        let mut permit = self.permit.lock();
        *permit = true;
        self.cond.notify_one();
    }

    /// Parks until rung, then consumes the permit.
    pub fn wait(&self) {
        let mut permit = self.permit.lock();
        while !*permit {
            self.cond.wait(&mut permit);
        }
        *permit = false;
    }

    /// Parks until rung or the timeout elapses. Returns true when a permit
    /// was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permit = self.permit.lock();
        while !*permit {
            if self.cond.wait_until(&mut permit, deadline).timed_out() {
                break;
            }
        }
        let rung = *permit;
        *permit = false;
        rung
    }
}
