//! Fail-open utilities for best-effort work
//!
//! Use these for operations whose failure must not change a job's outcome:
//! workspace teardown on error paths, orphan reaping, event fan-out to
//! observers that went away.
//!
//! DO NOT use fail-open for:
//! - Patch application (all-or-nothing correctness)
//! - Validation (the verdict)
//! - Publishing (has its own terminal outcome)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run an operation, logging and discarding any error
///
/// ```no_run
/// use backspace_core::fail_open::fail_open;
/// use backspace_core::Result;
///
/// async fn remove_stale_dir() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let removed = fail_open("reaper", || remove_stale_dir()).await;
///     // removed is None if remove_stale_dir() failed
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Like [`fail_open`] but retries with a linear backoff of `100ms * attempt`
pub async fn fail_open_with_retries<F, Fut, T>(
    operation_name: &str,
    mut f: F,
    max_retries: usize,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=max_retries {
        match f().await {
            Ok(val) => return Some(val),
            Err(e) if attempt == max_retries => {
                warn!(
                    "{} failed after {} retries (fail-open): {}",
                    operation_name, max_retries, e
                );
            }
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_retries, e
                );
                tokio::time::sleep(std::time::Duration::from_millis(100 * attempt as u64)).await;
            }
        }
    }
    None
}
