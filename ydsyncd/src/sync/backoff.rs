use std::time::Duration;

use rand::Rng;

/// Exponential delay schedule for liveness probes while the remote is unreachable.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter,
        }
    }

    /// Schedule used by the engine between reconnect probes: 1s doubling up to 5 minutes.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300), true)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    /// Full jitter: uniform in `[ceiling / 2, ceiling]` where the ceiling doubles per attempt.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self
            .base
            .checked_mul(1u32 << attempt.min(20))
            .unwrap_or(self.max)
            .min(self.max);
        if !self.jitter {
            return ceiling;
        }
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rng.gen_range(ceiling_ms / 2..=ceiling_ms))
    }
}
