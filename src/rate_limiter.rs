//! Sliding window rate limiter
//!
//! Permits at most `max_requests` outbound calls in any trailing
//! `time_window`. The limiter never errors; callers decide what a denial
//! means.

use crate::config::RateLimitConfig;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Point-in-time view of the rate window
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    /// Requests currently inside the window
    pub current_requests: usize,
    /// Capacity of the window
    pub max_requests: usize,
    /// Window length in milliseconds
    pub time_window_ms: u64,
    /// Age of the oldest request in the window, in milliseconds (0 when empty)
    pub oldest_request_age_ms: u64,
}

/// Sliding window rate limiter
pub struct RateLimiter {
    max_requests: usize,
    time_window: Duration,
    /// Request instants, oldest first
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter with an empty window
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            time_window: config.time_window,
            window: Mutex::new(VecDeque::with_capacity(config.max_requests)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops instants that have slid out of the window
    fn prune(&self, window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= self.time_window {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns true when another request fits in the window
    pub fn can_make_request(&self) -> bool {
        let mut window = self.lock();
        self.prune(&mut window, Instant::now());
        window.len() < self.max_requests
    }

    /// Records a request dispatched now
    ///
    /// Only call after `can_make_request` returned true for this request.
    pub fn add_request(&self) {
        self.lock().push_back(Instant::now());
    }

    /// Checks and records in one step
    ///
    /// Returns false, recording nothing, when the window is full.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut window = self.lock();
        self.prune(&mut window, now);
        if window.len() < self.max_requests {
            window.push_back(now);
            true
        } else {
            false
        }
    }

    /// Time until the oldest request leaves a full window, zero otherwise
    pub fn wait_time(&self) -> Duration {
        let now = Instant::now();
        let mut window = self.lock();
        self.prune(&mut window, now);
        if window.len() < self.max_requests {
            return Duration::ZERO;
        }
        match window.front() {
            Some(oldest) => self
                .time_window
                .saturating_sub(now.duration_since(*oldest)),
            None => Duration::ZERO,
        }
    }

    /// Sleeps until a slot is free, then takes it
    pub async fn wait_for_slot(&self) {
        while !self.try_acquire() {
            let wait = self.wait_time();
            tracing::debug!(wait_ms = wait.as_millis() as u64, "Waiting for rate limit slot");
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Snapshot for diagnostics
    pub fn status(&self) -> RateLimitStatus {
        let now = Instant::now();
        let mut window = self.lock();
        self.prune(&mut window, now);
        RateLimitStatus {
            current_requests: window.len(),
            max_requests: self.max_requests,
            time_window_ms: self.time_window.as_millis() as u64,
            oldest_request_age_ms: window
                .front()
                .map(|oldest| now.duration_since(*oldest).as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn limiter(max_requests: usize, window_ms: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            max_requests,
            time_window: Duration::from_millis(window_ms),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_window_blocks_and_reports_wait() {
        let limiter = limiter(2, 60_000);
        limiter.add_request();
        limiter.add_request();

        assert!(!limiter.can_make_request());
        let wait = limiter.wait_time();
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_millis(60_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_time_shrinks_as_window_slides() {
        let limiter = limiter(1, 60_000);
        limiter.add_request();

        advance(Duration::from_secs(20)).await;
        assert_eq!(limiter.wait_time(), Duration::from_secs(40));

        advance(Duration::from_secs(40)).await;
        assert!(limiter.can_make_request());
        assert_eq!(limiter.wait_time(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_calls_beyond_capacity_are_denied() {
        let limiter = limiter(3, 1_000);
        let permitted: Vec<bool> = (0..5).map(|_| limiter.try_acquire()).collect();
        assert_eq!(permitted, vec![true, true, true, false, false]);

        advance(Duration::from_millis(1_000)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_window_has_no_wait() {
        let limiter = limiter(2, 60_000);
        assert!(limiter.can_make_request());
        assert_eq!(limiter.wait_time(), Duration::ZERO);
        assert_eq!(limiter.status().current_requests, 0);
        assert_eq!(limiter.status().oldest_request_age_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_slot_sleeps_until_window_slides() {
        let limiter = limiter(1, 5_000);
        assert!(limiter.try_acquire());

        let start = Instant::now();
        limiter.wait_for_slot().await;
        assert!(start.elapsed() >= Duration::from_millis(5_000));
        assert_eq!(limiter.status().current_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_occupancy() {
        let limiter = limiter(4, 10_000);
        limiter.add_request();
        advance(Duration::from_secs(3)).await;
        limiter.add_request();

        let status = limiter.status();
        assert_eq!(status.current_requests, 2);
        assert_eq!(status.max_requests, 4);
        assert_eq!(status.time_window_ms, 10_000);
        assert_eq!(status.oldest_request_age_ms, 3_000);
    }
}
