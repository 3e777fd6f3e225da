use std::time::{SystemTime, UNIX_EPOCH};

/// Largest timer value the runtime is allowed to schedule. Platforms with
/// 32-bit timer wheels cap around this value; larger timeouts are clamped
/// with a warning rather than wrapping.
pub const MAX_TIMER_MS: u64 = 2_147_483_647;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

pub fn now_ms_i64() -> i64 {
    now_ms() as i64
}

pub fn clamp_timer_ms(ms: u64) -> u64 {
    if ms > MAX_TIMER_MS {
        tracing::warn!(requested_ms = ms, clamped_ms = MAX_TIMER_MS, "timer clamped to platform maximum");
        MAX_TIMER_MS
    } else {
        ms
    }
}
