//! Retry backoff.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter, bounded by the configured minimum and
/// maximum intervals.
///
/// `failures` counts consecutive soft failures toward one destination; the
/// delay doubles per failure until it saturates at `max_secs`. Jitter of
/// ±10% spreads retries from many messages to the same dead destination.
#[must_use]
pub fn retry_delay(failures: u32, min_secs: u64, max_secs: u64) -> Duration {
    let exponent = failures.saturating_sub(1).min(63);
    let unjittered = if exponent >= 63 {
        max_secs
    } else {
        min_secs.saturating_mul(1u64 << exponent).min(max_secs)
    };

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let jittered = {
        let spread = (unjittered as f64) * 0.1;
        let jitter: f64 = rand::rng().random_range(-spread..=spread);
        ((unjittered as f64) + jitter).max(0.0) as u64
    };
    Duration::from_secs(jittered.max(1).min(max_secs.max(1)))
}
