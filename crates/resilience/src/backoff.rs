use std::time::Duration;

use rand::Rng;

/// A fixed table of base delays with uniform jitter. Attempt `i` sleeps
/// `base[min(i, len-1)] + U[0, jitter)`. The table is explicit rather than
/// exponential so operators can tune burst recovery per path.
#[derive(Clone, Debug)]
pub struct BackoffSchedule {
    base_delays_ms: Vec<u64>,
    jitter_ms: u64,
}

impl BackoffSchedule {
    pub fn new(base_delays_ms: Vec<u64>, jitter_ms: u64) -> Self {
        let base_delays_ms = if base_delays_ms.is_empty() {
            vec![0]
        } else {
            base_delays_ms
        };
        Self {
            base_delays_ms,
            jitter_ms,
        }
    }

    /// Base delay for an attempt index, without jitter.
    pub fn base_for(&self, attempt: usize) -> u64 {
        let index = attempt.min(self.base_delays_ms.len() - 1);
        self.base_delays_ms[index]
    }

    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.base_for(attempt);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..self.jitter_ms)
        };
        Duration::from_millis(base.saturating_add(jitter))
    }

    /// Upper bound of the delay for an attempt, used to decide whether a
    /// retry still fits inside a deadline.
    pub fn max_delay_ms(&self, attempt: usize) -> u64 {
        self.base_for(attempt)
            .saturating_add(self.jitter_ms.saturating_sub(1))
    }
}
