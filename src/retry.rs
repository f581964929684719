//! In-place retries for orchestration API calls.
//!
//! Transient failures are retried with capped exponential backoff and jitter;
//! status writes that hit a version conflict are retried from a fresh read.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::Backoff;
use crate::Error;

/// Retry `operation` while it fails with a transient error.
///
/// Gives up after `attempts` tries and returns the last error; non-transient
/// errors are returned immediately.
pub async fn retry_with_backoff<F, Fut, T>(
    backoff: &Backoff,
    attempts: u32,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts.max(1) => {
                let delay = jittered(backoff.delay(attempt));
                log::warn!(
                    "{operation_name} failed (attempt {attempt}), retrying in {}ms: {err}",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Run a read-modify-write `operation` until it stops conflicting.
///
/// `operation` must re-read the object on every call.
pub async fn retry_on_conflict<F, Fut, T>(
    attempts: u32,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Err(err) if err.is_conflict() && attempt < attempts.max(1) => {
                log::debug!("{operation_name} conflicted (attempt {attempt}), re-reading: {err}");
            }
            result => return result,
        }
    }
}

/// Scale `delay` by a random factor in [0.5, 1.5).
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
