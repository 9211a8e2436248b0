//! Connection supervision.
//!
//! Retries `connect()` with exponential backoff until it succeeds or the
//! cancellation token fires.

use super::connection::Connection;
use crate::backoff::BackoffPolicy;
use crate::error::CommError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Connects with retries.
///
/// Returns the number of attempts it took, or [`CommError::Cancelled`] when
/// the token fires first.
pub async fn connect_with_retry(
    connection: &Arc<dyn Connection>,
    policy: BackoffPolicy,
    cancel: &CancellationToken,
) -> Result<u32, CommError> {
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(CommError::Cancelled);
        }

        match connection.connect().await {
            Ok(()) => {
                info!(
                    "✅ Connection {} established after {} attempt(s)",
                    connection.name(),
                    attempt + 1
                );
                return Ok(attempt + 1);
            }
            Err(e) => {
                let delay = policy.next(attempt);
                warn!(
                    "⚠️ Connect attempt {} for {} failed: {} (retrying in {:?})",
                    attempt + 1,
                    connection.name(),
                    e,
                    delay
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(CommError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt = attempt.saturating_add(1);
            }
        }
    }
}
