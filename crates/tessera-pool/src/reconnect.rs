use std::time::Duration;

use rand::Rng;

/// Exponential reconnection delays with jitter.
///
/// The nth consecutive failure waits `base * 2^n`, capped at `max`, then
/// scaled by a random factor in `[0.5, 1.0]` so pools that lost their node
/// at the same moment do not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct ReconnectionSchedule {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectionSchedule {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Upper bound of the next delay, before jitter.
    pub fn ceiling(&self) -> Duration {
        let multiplier = 2u32.saturating_pow(self.attempt.min(31));
        self.base.saturating_mul(multiplier).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);

        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms < 2 {
            return ceiling;
        }
        Duration::from_millis(rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms))
    }

    /// Consecutive failures since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
