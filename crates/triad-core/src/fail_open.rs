//! Fail-open utilities for graceful degradation
//!
//! Infrastructure checks in the verification path (stuck detection, screenshot
//! change tracking, history bookkeeping) must never block the pipeline, and
//! neither may the routing steps that only narrow what the pipeline sees
//! (mode selection, tool server selection). These helpers log the failure and
//! hand back a neutral value instead.
//!
//! DO NOT use fail-open for:
//! - Verification results (a failed analysis is a reported error)
//! - Tool server handshakes (startup failure is fatal)
//! - Planning decisions (they are validated, not guessed)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// # Usage
///
/// ```no_run
/// use triad_core::fail_open::fail_open;
/// use triad_core::Result;
///
/// async fn check_screen() -> Result<bool> {
///     Ok(true)
/// }
///
/// async fn example() {
///     let result = fail_open("stuck_check", || check_screen()).await;
///     // result is None if check_screen() failed, otherwise Some(true)
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

/// Like `fail_open` but substitutes `fallback` for a failed operation
pub async fn fail_open_or<F, Fut, T>(operation_name: &str, fallback: T, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    fail_open(operation_name, f).await.unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TriadError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, TriadError>(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_fail_open_failure() {
        let result = fail_open("test_op", || async {
            Err::<i32, _>(TriadError::AnalysisFailed("vision down".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_fail_open_or_uses_fallback() {
        let stuck = fail_open_or("stuck_check", false, || async {
            Err::<bool, _>(TriadError::Other("boom".to_string()))
        })
        .await;
        assert!(!stuck);

        let stuck = fail_open_or("stuck_check", false, || async { Ok::<_, TriadError>(true) }).await;
        assert!(stuck);
    }
}
