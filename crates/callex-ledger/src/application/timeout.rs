//! Deadlines for ledger operations.

use std::future::Future;
use std::time::Duration;

use callex_core::error::LedgerError;
use tracing::warn;

/// Runs `future` to completion or fails with `LedgerError::Timeout` once
/// `limit` elapses. A timed-out write is dropped mid-flight, which rolls back
/// its open transaction.
///
/// # Errors
///
/// Returns the future's own error, or `LedgerError::Timeout`.
pub async fn with_timeout<T, F>(
    operation: &'static str,
    limit: Duration,
    future: F,
) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    if let Ok(result) = tokio::time::timeout(limit, future).await {
        result
    } else {
        let after_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
        warn!(operation, after_ms, "ledger operation timed out");
        Err(LedgerError::Timeout {
            operation,
            after_ms,
        })
    }
}
