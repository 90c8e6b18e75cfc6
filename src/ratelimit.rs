//! Token-bucket rate limiting for shard fetch loops and producer puts.

use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter as GovernorLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

/// A single-bucket rate limiter wrapping `governor`.
///
/// Rates below 1/s are expressed as a period between single-token refills
/// (`Quota::with_period`), which is what a fractional `shard_fetch_rate`
/// like `0.2` calls per second needs.
pub struct RateLimiter {
    inner: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl RateLimiter {
    /// Build a limiter allowing `rate` operations per second, with a burst
    /// of one (no credit accrues while idle beyond a single token).
    pub fn per_second(rate: f64) -> Self {
        let rate = rate.max(0.001);
        let period = Duration::from_secs_f64(1.0 / rate);
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::with_period(Duration::from_millis(1)).unwrap())
            .allow_burst(NonZeroU32::new(1).unwrap());
        Self {
            inner: GovernorLimiter::direct(quota),
        }
    }

    /// Suspend the calling task until a token is available.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }

    /// Non-blocking check; returns true if a token was consumed.
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn limiter_spaces_out_acquisitions() {
        let limiter = RateLimiter::per_second(20.0);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn try_acquire_consumes_the_single_burst_token() {
        let limiter = RateLimiter::per_second(1.0);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }
}
