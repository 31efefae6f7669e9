//! Reconnection scheduling: bounded exponential backoff with jitter.
//!
//! A [`ReconnectAttempt`] is seeded from the policy on the first failure of
//! an episode and cleared once a connection succeeds. Each draw doubles the
//! base delay, clamps it to the policy bounds, and spreads it with
//! deterministic jitter so a fleet of followers against the same server does
//! not reconnect in lockstep.

use crate::config::ReconnectPolicy;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Live retry state for one failure episode.
#[derive(Debug)]
pub struct ReconnectAttempt {
    policy: ReconnectPolicy,
    seed: u64,
    attempt: u32,
}

impl ReconnectAttempt {
    /// Seed retry state from the (already patched) policy.
    ///
    /// `seed` keys the jitter; derive it from something stable per stream,
    /// such as the database URI, so each follower keeps its own phase.
    pub fn new(policy: ReconnectPolicy, seed: u64) -> Self {
        ReconnectAttempt {
            policy,
            seed,
            attempt: 0,
        }
    }

    /// Attempts drawn so far in this episode.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Draw the next delay, or `None` once the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.retries {
            return None;
        }
        let base = self.base_delay(self.attempt);
        self.attempt += 1;
        Some(self.jittered(base))
    }

    /// Exponential base schedule: `min * 2^n`, clamped to `max`.
    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.policy
            .min_delay
            .saturating_mul(factor)
            .min(self.policy.max_delay)
    }

    /// Spread `base` by up to ±20%, staying inside the policy bounds.
    fn jittered(&self, base: Duration) -> Duration {
        let base_ms = base.as_millis() as u64;
        let span = base_ms / 5;
        if span == 0 {
            return base;
        }

        let mut hasher = DefaultHasher::new();
        (self.seed, self.attempt).hash(&mut hasher);
        let offset = (hasher.finish() % (2 * span + 1)) as i64 - span as i64;

        let jittered_ms = if offset >= 0 {
            base_ms.saturating_add(offset as u64)
        } else {
            base_ms.saturating_sub(offset.unsigned_abs())
        };
        Duration::from_millis(jittered_ms)
            .clamp(self.policy.min_delay, self.policy.max_delay)
    }
}
