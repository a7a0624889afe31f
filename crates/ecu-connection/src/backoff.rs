//! Reconnection Backoff

use std::time::Duration;

/// Delay taken after the given failed attempt (1-based):
/// `base * 2^(attempt-1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let factor = 2u32.saturating_pow(exp);
    base.saturating_mul(factor).min(max)
}
