//! Signal handling for graceful shutdown.
//!
//! The first SIGINT/SIGTERM initiates the runtime's shutdown state; the host
//! then drains in-flight handlers. A second signal exits immediately.

use edge_dispatch::ShutdownState;
use tokio::signal;
use tracing::info;

/// Waits for a termination signal and initiates `shutdown_state`.
pub async fn setup_signal_handlers(
    shutdown_state: &ShutdownState,
) -> Result<(), Box<dyn std::error::Error>> {
    wait_for_signal().await?;
    info!("📡 Received shutdown signal - initiating graceful shutdown");
    shutdown_state.initiate_shutdown();
    Ok(())
}

/// Resolves on the next SIGINT or SIGTERM (Ctrl+C on Windows).
pub async fn wait_for_signal() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => ()
        }
    }

    #[cfg(windows)]
    signal::ctrl_c().await?;

    Ok(())
}
