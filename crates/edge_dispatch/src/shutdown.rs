//! Shutdown coordination for a graceful runtime stop.
//!
//! The dispatch engine and the event mediator run on child tokens of the
//! shared root token, so initiating shutdown stops new work everywhere at
//! once while in-flight handlers are drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared shutdown state for coordinating graceful shutdown across components.
#[derive(Debug, Clone)]
pub struct ShutdownState {
    /// Cancelled once shutdown has been initiated
    token: CancellationToken,
    /// Set when every component has drained its in-flight work
    shutdown_complete: Arc<AtomicBool>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            shutdown_complete: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A token cancelled together with the shutdown state.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Returns true if shutdown has been initiated - no new work should start.
    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete.load(Ordering::Acquire)
    }

    /// Initiates shutdown. Returns false if it was already initiated.
    pub fn initiate_shutdown(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        info!("🛑 Shutdown initiated - no new notifications or events will be processed");
        true
    }

    /// Marks shutdown as complete - all in-flight work has finished.
    pub fn complete_shutdown(&self) {
        self.shutdown_complete.store(true, Ordering::Release);
        info!("✅ All handlers drained - shutdown complete");
    }

    /// Resolves once shutdown has been initiated.
    pub async fn initiated(&self) {
        self.token.cancelled().await;
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}
