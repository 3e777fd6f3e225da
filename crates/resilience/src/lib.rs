//! Resilience primitives shared by the Gateway client, the chat runner and
//! the backend client: a table-driven backoff schedule, a bounded retry
//! loop, and a circuit breaker.

pub mod backoff;
pub mod breaker;
pub mod retry;

pub use backoff::BackoffSchedule;
pub use breaker::{BreakerConfig, BreakerStatus, CircuitBreaker, CircuitOpen};
pub use retry::{retry, RetryPolicy};
