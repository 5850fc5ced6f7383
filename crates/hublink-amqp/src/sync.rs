//! Wait/notify coordination between caller threads and the reactor thread.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A sticky latch: `open` releases every current and future waiter until the
/// gate is re-armed with `reset`. A notification that arrives before the wait
/// starts is never lost.
#[derive(Debug, Default)]
pub struct Gate {
    opened: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks the calling thread until the gate opens or the timeout elapses.
    /// Returns true if the gate was opened.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut opened = self.opened.lock();
        while !*opened {
            if self.cond.wait_until(&mut opened, deadline).timed_out() {
                return *opened;
            }
        }
        true
    }

    pub fn open(&self) {
        let mut opened = self.opened.lock();
        *opened = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.opened.lock() = false;
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.opened.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_open_before_wait_is_not_lost() {
        let gate = Gate::new();
        gate.open();
        assert!(gate.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_times_out_when_never_opened() {
        let gate = Gate::new();
        assert!(!gate.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_open_releases_waiter_on_other_thread() {
        let gate = Arc::new(Gate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait_timeout(Duration::from_secs(5)))
        };
        gate.open();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_reset_rearms_the_gate() {
        let gate = Gate::new();
        gate.open();
        assert!(gate.is_open());
        gate.reset();
        assert!(!gate.is_open());
        assert!(!gate.wait_timeout(Duration::from_millis(5)));
    }
}
