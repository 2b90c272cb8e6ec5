//! Per-IP rate limiting for license activation attempts.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Failed activation attempts allowed per address per window.
const MAX_FAILURES: usize = 5;

/// Sliding window length.
const WINDOW: Duration = Duration::from_secs(15 * 60);

/// Tracks failed activation attempts per remote address.
///
/// Successful activations are never recorded, so they do not count toward
/// the limit and do not reset it either.
#[derive(Debug, Default)]
pub struct ActivationRateLimiter {
    failures: DashMap<IpAddr, Vec<Instant>>,
}

impl ActivationRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an attempt from this address may proceed. Returns
    /// `Err(retry_after_secs)` once the window holds `MAX_FAILURES`
    /// failures.
    pub fn check(&self, addr: IpAddr) -> Result<(), u64> {
        self.check_at(addr, Instant::now())
    }

    fn check_at(&self, addr: IpAddr, now: Instant) -> Result<(), u64> {
        let Some(mut entry) = self.failures.get_mut(&addr) else {
            return Ok(());
        };
        entry.retain(|t| now.duration_since(*t) < WINDOW);
        if entry.len() < MAX_FAILURES {
            return Ok(());
        }
        let oldest = entry.iter().min().copied().unwrap_or(now);
        let retry_after = WINDOW.saturating_sub(now.duration_since(oldest));
        Err(retry_after.as_secs().max(1))
    }

    /// Record a failed attempt.
    pub fn record_failure(&self, addr: IpAddr) {
        self.record_failure_at(addr, Instant::now());
    }

    fn record_failure_at(&self, addr: IpAddr, now: Instant) {
        let mut entry = self.failures.entry(addr).or_default();
        entry.retain(|t| now.duration_since(*t) < WINDOW);
        entry.push(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    #[test]
    fn sixth_attempt_in_window_is_limited() {
        let limiter = ActivationRateLimiter::new();
        let addr = ip(1);
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.check_at(addr, now).is_ok(), "first five pass");
            limiter.record_failure_at(addr, now);
        }

        let retry_after = limiter
            .check_at(addr, now)
            .expect_err("sixth attempt must be limited");
        assert!(
            retry_after > 0 && retry_after <= WINDOW.as_secs(),
            "retry hint within the window, got {retry_after}"
        );
    }

    #[test]
    fn success_does_not_count_toward_limit() {
        let limiter = ActivationRateLimiter::new();
        let addr = ip(2);
        let now = Instant::now();

        // Three failures, one success (not recorded), two more failures.
        for _ in 0..3 {
            limiter.record_failure_at(addr, now);
        }
        assert!(limiter.check_at(addr, now).is_ok(), "success interleaves");
        for _ in 0..2 {
            limiter.record_failure_at(addr, now);
        }

        assert!(
            limiter.check_at(addr, now).is_err(),
            "five failures still trip the limit regardless of the success"
        );
    }

    #[test]
    fn failures_age_out_of_the_window() {
        let limiter = ActivationRateLimiter::new();
        let addr = ip(3);
        let start = Instant::now();

        for _ in 0..5 {
            limiter.record_failure_at(addr, start);
        }
        assert!(limiter.check_at(addr, start).is_err(), "limited at start");

        let later = start + WINDOW + Duration::from_secs(1);
        assert!(
            limiter.check_at(addr, later).is_ok(),
            "old failures expire after the window"
        );
    }

    #[test]
    fn addresses_are_tracked_independently() {
        let limiter = ActivationRateLimiter::new();
        let now = Instant::now();

        for _ in 0..5 {
            limiter.record_failure_at(ip(4), now);
        }
        assert!(limiter.check_at(ip(5), now).is_ok(), "other IPs unaffected");
    }
}
