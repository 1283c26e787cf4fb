//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Longest pause between two polls of a blocking receive.
pub const MAX_POLL_DELAY: Duration = Duration::from_millis(200);

/// Backoff between polls of a blocking receive.
///
/// - Min delay: 5ms
/// - Max delay: 200ms
/// - Unlimited attempts (the caller bounds the total wait)
/// - Jitter enabled
pub fn receive_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(MAX_POLL_DELAY)
        .with_max_times(usize::MAX)
        .with_jitter()
}
