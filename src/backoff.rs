//! Exponential backoff with jitter, used by every network-facing loop
//! (shard fetch, producer batch retry, checkpoint heartbeats).

use rand::Rng;
use std::time::Duration;

/// Backoff configuration.
///
/// Defaults to a 30s ceiling with full jitter; other jitter modes are
/// kept for callers that want AWS-SDK-style decorrelated jitter.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: JitterMode,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: JitterMode::Full,
        }
    }
}

impl BackoffConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the next backoff delay with jitter applied.
    ///
    /// `attempt` is zero-based; `current_delay` is the un-jittered delay
    /// returned by the previous call (pass `initial_backoff` on the first
    /// call).
    pub fn next_backoff(&self, attempt: u32, current_delay: Duration) -> Duration {
        let base_delay = if attempt == 0 {
            self.initial_backoff
        } else {
            let multiplied = current_delay.as_secs_f64() * self.multiplier;
            Duration::from_secs_f64(multiplied.min(self.max_backoff.as_secs_f64()))
        };

        apply_jitter(base_delay, &self.jitter)
    }

    /// Start a cursor for iterating backoff delays across retries of one loop.
    pub fn cursor(&self) -> BackoffCursor<'_> {
        BackoffCursor {
            config: self,
            attempt: 0,
            delay: self.initial_backoff,
        }
    }
}

/// Tracks the un-jittered delay across successive calls to `next`, so
/// callers don't have to thread `attempt`/`current_delay` by hand.
pub struct BackoffCursor<'a> {
    config: &'a BackoffConfig,
    attempt: u32,
    delay: Duration,
}

impl BackoffCursor<'_> {
    pub fn next(&mut self) -> Duration {
        let jittered = self.config.next_backoff(self.attempt, self.delay);
        self.delay = if self.attempt == 0 {
            self.config.initial_backoff
        } else {
            Duration::from_secs_f64(
                (self.delay.as_secs_f64() * self.config.multiplier)
                    .min(self.config.max_backoff.as_secs_f64()),
            )
        };
        self.attempt += 1;
        jittered
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Jitter mode for retry backoff (following AWS SDK patterns).
#[derive(Clone, Debug, Default)]
pub enum JitterMode {
    /// No jitter - use exact backoff delay
    None,
    /// Full jitter: random delay between 0 and calculated backoff
    #[default]
    Full,
    /// Equal jitter: half fixed + half random
    Equal,
    /// Decorrelated jitter (AWS recommended)
    Decorrelated,
}

/// Apply jitter to a backoff delay.
pub fn apply_jitter(delay: Duration, mode: &JitterMode) -> Duration {
    let mut rng = rand::thread_rng();

    match mode {
        JitterMode::None => delay,
        JitterMode::Full => Duration::from_secs_f64(rng.gen::<f64>() * delay.as_secs_f64()),
        JitterMode::Equal => {
            let half = delay.as_secs_f64() / 2.0;
            Duration::from_secs_f64(half + rng.gen::<f64>() * half)
        }
        JitterMode::Decorrelated => {
            let base = delay.as_secs_f64() / 3.0;
            let upper = delay.as_secs_f64() * 3.0;
            Duration::from_secs_f64(base + rng.gen::<f64>() * (upper - base))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_jitter_never_exceeds_base() {
        let cfg = BackoffConfig::default();
        for attempt in 0..8 {
            let base = Duration::from_millis(100 * 2u64.pow(attempt.min(10)));
            let delay = cfg.next_backoff(attempt, base);
            assert!(delay <= base.max(cfg.max_backoff));
        }
    }

    #[test]
    fn backoff_respects_ceiling() {
        let cfg = BackoffConfig::default().with_jitter(JitterMode::None);
        let mut cursor = cfg.cursor();
        let mut last = Duration::ZERO;
        for _ in 0..30 {
            last = cursor.next();
        }
        assert!(last <= cfg.max_backoff);
    }

    #[test]
    fn cursor_grows_monotonically_until_ceiling() {
        let cfg = BackoffConfig::default().with_jitter(JitterMode::None);
        let mut cursor = cfg.cursor();
        let first = cursor.next();
        let second = cursor.next();
        assert!(second >= first);
    }
}
