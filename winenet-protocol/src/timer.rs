//! One-shot protocol timers
//!
//! Winenet arms a handful of relative, monotonic timeouts (frame ACK wait,
//! speaker bid, listener watchdog, PING retry). The FSM is driven by the
//! caller's clock, so timers compare against an `Instant` passed in rather
//! than reading the system clock.

use std::time::{Duration, Instant};

/// Re-armable one-shot timer
#[derive(Debug, Clone)]
pub struct Timer {
    interval: Duration,
    deadline: Option<Instant>,
}

impl Timer {
    /// Create a disarmed timer with the given interval
    pub fn new(interval: Duration) -> Self {
        Timer {
            interval,
            deadline: None,
        }
    }

    /// Arm (or re-arm) the timer relative to `now`
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.interval);
    }

    /// Disarm the timer
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Check if the timer is armed
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Check if the timer is armed and its deadline has passed
    pub fn expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if now >= deadline)
    }

    /// Get the armed deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Get time until expiration (zero once expired)
    pub fn time_until_expiration(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Disarm and report expiry, returning true if it fired
    pub fn try_fire(&mut self, now: Instant) -> bool {
        if self.expired(now) {
            self.deadline = None;
            true
        } else {
            false
        }
    }
}

/// Earliest of two optional deadlines
pub(crate) fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_fires_once() {
        let start = Instant::now();
        let mut timer = Timer::new(Duration::from_millis(100));
        assert!(!timer.is_armed());
        assert!(!timer.try_fire(start + Duration::from_secs(10)));

        timer.arm(start);
        assert!(!timer.expired(start + Duration::from_millis(99)));
        assert_eq!(
            timer.time_until_expiration(start + Duration::from_millis(40)),
            Some(Duration::from_millis(60))
        );
        assert!(timer.try_fire(start + Duration::from_millis(100)));
        assert!(!timer.is_armed());
        assert!(!timer.try_fire(start + Duration::from_millis(200)));
    }

    #[test]
    fn test_rearm_pushes_deadline() {
        let start = Instant::now();
        let mut timer = Timer::new(Duration::from_millis(100));
        timer.arm(start);
        timer.arm(start + Duration::from_millis(50));
        assert!(!timer.expired(start + Duration::from_millis(120)));
        assert_eq!(timer.deadline(), Some(start + Duration::from_millis(150)));

        timer.cancel();
        assert_eq!(timer.deadline(), None);
    }

    #[test]
    fn test_earliest() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert_eq!(earliest(Some(later), Some(now)), Some(now));
        assert_eq!(earliest(None, Some(later)), Some(later));
        assert_eq!(earliest(None, None), None);
    }
}
