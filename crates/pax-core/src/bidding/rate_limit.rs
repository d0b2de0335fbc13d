//! Per-actor sliding window rate limiting.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// Sliding window counter keyed by actor.
///
/// Only attempts the limiter itself allows are recorded, so a blocked
/// attempt never eats into the next window's budget.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_events: u32,
    window: Duration,
    events: DashMap<String, VecDeque<DateTime<Utc>>>,
}

impl SlidingWindowLimiter {
    /// Creates a limiter allowing `max_events` per rolling `window`.
    #[must_use]
    pub fn new(max_events: u32, window: Duration) -> Self {
        Self {
            max_events,
            window,
            events: DashMap::new(),
        }
    }

    /// Records an attempt by `actor` at `now` if the budget allows it.
    ///
    /// # Errors
    ///
    /// Returns the instant at which the oldest counted attempt leaves the
    /// window when the budget is exhausted.
    pub fn try_acquire(&self, actor: &str, now: DateTime<Utc>) -> Result<(), DateTime<Utc>> {
        let key = actor.to_ascii_lowercase();
        let mut entry = self.events.entry(key).or_default();
        let cutoff = now - self.window;
        while entry.front().is_some_and(|at| *at <= cutoff) {
            entry.pop_front();
        }
        if entry.len() >= self.max_events as usize {
            let retry_at = entry.front().map_or(now, |oldest| *oldest + self.window);
            return Err(retry_at);
        }
        entry.push_back(now);
        Ok(())
    }

    /// Attempts counted for `actor` in the window ending at `now`.
    #[must_use]
    pub fn in_window(&self, actor: &str, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        self.events
            .get(&actor.to_ascii_lowercase())
            .map_or(0, |entry| entry.iter().filter(|at| **at > cutoff).count())
    }

    /// Drops actors with no attempts inside the window ending at `now`.
    /// Returns how many were dropped.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let before = self.events.len();
        self.events
            .retain(|_, entry| entry.back().is_some_and(|at| *at > cutoff));
        before.saturating_sub(self.events.len())
    }

    /// Number of actors currently tracked.
    #[must_use]
    pub fn tracked_actors(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_sixth_attempt_blocked_then_window_reopens() {
        let limiter = SlidingWindowLimiter::new(5, Duration::seconds(60));
        for i in 0..5 {
            assert!(limiter.try_acquire("0xA", t0() + Duration::seconds(i)).is_ok());
        }
        let retry_at = limiter
            .try_acquire("0xA", t0() + Duration::seconds(5))
            .unwrap_err();
        assert_eq!(retry_at, t0() + Duration::seconds(60));
        assert_eq!(limiter.in_window("0xa", t0() + Duration::seconds(5)), 5);

        assert!(limiter.try_acquire("0xA", t0() + Duration::seconds(61)).is_ok());
    }

    #[test]
    fn test_blocked_attempts_are_not_counted() {
        let limiter = SlidingWindowLimiter::new(1, Duration::seconds(10));
        assert!(limiter.try_acquire("0xA", t0()).is_ok());
        for i in 1..10 {
            assert!(limiter.try_acquire("0xA", t0() + Duration::seconds(i)).is_err());
        }
        assert!(limiter.try_acquire("0xA", t0() + Duration::seconds(10)).is_ok());
    }

    #[test]
    fn test_actors_are_independent_and_prunable() {
        let limiter = SlidingWindowLimiter::new(1, Duration::seconds(10));
        assert!(limiter.try_acquire("0xA", t0()).is_ok());
        assert!(limiter.try_acquire("0xB", t0()).is_ok());
        assert!(limiter.try_acquire("0xC", t0() + Duration::seconds(5)).is_ok());
        assert_eq!(limiter.prune(t0() + Duration::seconds(11)), 2);
        assert_eq!(limiter.tracked_actors(), 1);
        assert_eq!(limiter.in_window("0xA", t0() + Duration::seconds(11)), 0);
    }
}
