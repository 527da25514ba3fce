//! Wall-clock time adapter.
//!
//! Dispense waits are plain blocking sleeps on the service thread; the pump
//! gives no completion signal to wait on instead.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::app::ports::TimePort;

/// [`TimePort`] backed by `std::thread::sleep` and the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl TimePort for SystemClock {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_advances_across_a_sleep() {
        let clock = SystemClock::new();
        let before = clock.now();
        clock.sleep(Duration::from_millis(5));
        assert!(clock.now() > before);
    }
}
