use std::sync::Mutex;

use common::time::now_ms;

/// Fail-fast gate for a single backend path. Trips open after
/// `failure_threshold` consecutive failures, rejects calls for
/// `open_for_ms`, then lets a probe through (half-open). The probe's
/// outcome decides whether the circuit closes again or the window resets.
///
/// Read-like and write-like paths each own their own breaker instance;
/// state is never shared across paths.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub open_for_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Copy, Debug)]
struct BreakerState {
    status: BreakerStatus,
    consecutive_failures: u32,
    open_until_ms: u64,
}

/// Fast rejection while the circuit is open. Does NOT count as a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("circuit open, retry after {retry_after_ms} ms")]
pub struct CircuitOpen {
    pub retry_after_ms: u64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                status: BreakerStatus::Closed,
                consecutive_failures: 0,
                open_until_ms: 0,
            }),
        }
    }

    /// Gate a call. `Ok` means the caller may proceed (and must report the
    /// outcome via `record_success` / `record_failure`).
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        self.try_acquire_at(now_ms())
    }

    pub fn try_acquire_at(&self, now_ms: u64) -> Result<(), CircuitOpen> {
        let mut state = self.lock_state();
        match state.status {
            BreakerStatus::Closed | BreakerStatus::HalfOpen => Ok(()),
            BreakerStatus::Open => {
                if now_ms >= state.open_until_ms {
                    state.status = BreakerStatus::HalfOpen;
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        retry_after_ms: state.open_until_ms - now_ms,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock_state();
        state.status = BreakerStatus::Closed;
        state.consecutive_failures = 0;
        state.open_until_ms = 0;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(now_ms());
    }

    pub fn record_failure_at(&self, now_ms: u64) {
        let mut state = self.lock_state();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        match state.status {
            BreakerStatus::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.status = BreakerStatus::Open;
                    state.open_until_ms = now_ms.saturating_add(self.config.open_for_ms);
                }
            }
            BreakerStatus::HalfOpen => {
                // The probe failed; reopen a fresh window.
                state.status = BreakerStatus::Open;
                state.open_until_ms = now_ms.saturating_add(self.config.open_for_ms);
            }
            BreakerStatus::Open => {}
        }
    }

    pub fn status(&self) -> BreakerStatus {
        self.lock_state().status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock_state().consecutive_failures
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
