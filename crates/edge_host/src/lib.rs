//! # Edge Host - Main Entry Point
//!
//! Runs the edge dispatch core against simulated in-memory PLC connections.
//! This entry point handles CLI parsing, configuration loading, logging and
//! the application lifecycle.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration (written to edge_host.toml if missing)
//! edge_host
//!
//! # Specify custom configuration
//! edge_host --config plant.toml
//!
//! # Override the log level, JSON logging for production
//! edge_host --log-level debug --json-logs
//! ```
//!
//! ## Configuration
//!
//! `[dispatch]` embeds the core's settings, `[host]` tunes monitoring and the
//! built-in handlers, and every `[[connections]]` entry declares a simulated
//! connection with its `[[connections.tags]]`.
//!
//! ## Signal Handling
//!
//! The host drains in-flight handlers on SIGINT (Ctrl+C) or SIGTERM. A second
//! signal exits immediately.

use tracing::error;

pub mod app;
pub mod cli;
pub mod config;
pub mod handlers;
pub mod logging;
pub mod signals;
pub mod simulation;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

/// Runs the host until shutdown.
///
/// # Exit Codes
///
/// * **0**: Successful execution and shutdown
/// * **1**: Error during startup, configuration, or runtime
///
/// Called from an async context (main with `#[tokio::main]`).
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Load configuration to get logging settings
    let mut config = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default();
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    if let Err(e) = logging::setup_logging(&config.logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}

pub use config::{ConnectionSettings, HostSettings, LoggingSettings, TagSettings};
