//! Retry delay calculation per error class.

use std::time::Duration;

use rand::Rng;

use crate::classifier::ErrorClass;

/// Upper bound for computed backoff delays.
pub const MAX_RETRY_DELAY_MS: u64 = 600_000;

/// Base of the exponential schedule for transient failures.
pub const TRANSIENT_BASE_DELAY_MS: u64 = 2_000;

/// Jitter ceiling (exclusive) for transient failures.
pub const TRANSIENT_JITTER_MS: u64 = 1_000;

/// Base of the linear schedule for conflicts.
pub const CONFLICT_BASE_DELAY_MS: u64 = 2_000;

/// Per-attempt increment of the linear schedule for conflicts.
pub const CONFLICT_STEP_MS: u64 = 1_000;

/// Jitter ceiling (exclusive) for conflicts.
pub const CONFLICT_JITTER_MS: u64 = 500;

/// Delay used for rate-limited failures that carry no explicit retry-after.
pub const DEFAULT_RATE_LIMIT_DELAY_MS: u64 = 60_000;

fn jitter_ceiling(class: ErrorClass) -> u64 {
    match class {
        ErrorClass::Transient => TRANSIENT_JITTER_MS,
        ErrorClass::Conflict => CONFLICT_JITTER_MS,
        _ => 0,
    }
}

/// Delay before the next attempt, with random jitter.
///
/// `attempts_made` is the number of attempts already consumed.
pub fn calculate_delay(class: ErrorClass, attempts_made: u32, retry_after_ms: Option<u64>) -> Duration {
    let ceiling = jitter_ceiling(class);
    let jitter = if ceiling == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..ceiling)
    };
    delay_with_jitter(class, attempts_made, retry_after_ms, jitter)
}

/// Deterministic form of [`calculate_delay`]; `jitter_ms` is clamped to the class's range.
pub fn delay_with_jitter(
    class: ErrorClass,
    attempts_made: u32,
    retry_after_ms: Option<u64>,
    jitter_ms: u64,
) -> Duration {
    let jitter = jitter_ms.min(jitter_ceiling(class).saturating_sub(1));

    let ms = match class {
        ErrorClass::Transient => {
            let factor = 1u64.checked_shl(attempts_made).unwrap_or(u64::MAX);
            TRANSIENT_BASE_DELAY_MS
                .saturating_mul(factor)
                .saturating_add(jitter)
                .min(MAX_RETRY_DELAY_MS)
        }
        ErrorClass::Conflict => CONFLICT_BASE_DELAY_MS
            .saturating_add(u64::from(attempts_made).saturating_mul(CONFLICT_STEP_MS))
            .saturating_add(jitter)
            .min(MAX_RETRY_DELAY_MS),
        ErrorClass::RateLimited => retry_after_ms.unwrap_or(DEFAULT_RATE_LIMIT_DELAY_MS),
        ErrorClass::Poison | ErrorClass::Validation | ErrorClass::Auth => 0,
    };

    Duration::from_millis(ms)
}
