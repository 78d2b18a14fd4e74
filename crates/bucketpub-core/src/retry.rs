//! Retry with exponential backoff for run startup failures

use std::time::Duration;

use indicatif::ProgressBar;

use crate::error::PipelineError;
use crate::shutdown::is_shutdown_requested;

/// Exponential backoff: 2^attempt seconds (2s, 4s, 8s, ...)
pub const fn backoff_duration(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt))
}

/// Retry a fallible operation with exponential backoff.
///
/// Only errors for which [`PipelineError::is_retryable`] holds are retried,
/// at most `max_retries` times. A pending shutdown stops further attempts.
pub fn retry_with_backoff<T>(
    label: &str,
    max_retries: u32,
    pb: &ProgressBar,
    mut attempt_fn: impl FnMut() -> Result<T, PipelineError>,
) -> Result<T, PipelineError> {
    let mut attempt = 0u32;
    loop {
        match attempt_fn() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries && e.is_retryable() && !is_shutdown_requested() => {
                attempt += 1;
                pb.set_message(format!("retry {attempt}/{max_retries}..."));
                log::warn!("{label}: attempt {attempt}/{max_retries} failed: {e}, retrying...");
                std::thread::sleep(backoff_duration(attempt));
            }
            Err(e) => return Err(e),
        }
    }
}
