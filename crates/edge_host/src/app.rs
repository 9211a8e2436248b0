//! Main application logic and lifecycle management.
//!
//! This module contains the `Application` struct that assembles the edge
//! runtime from the configuration, drives the simulated connections, reports
//! health periodically and shuts everything down in order.

use crate::cli::CliArgs;
use crate::config::AppConfig;
use crate::handlers::{self, AlarmLimits, HostServices, LineSummary, ReportRequest, LINE_REPORT_EVENT};
use crate::logging::display_banner;
use crate::signals::{setup_signal_handlers, wait_for_signal};
use crate::simulation::Simulator;
use edge_dispatch::{CancellationToken, EdgeRuntime, MediatorError, MemoryConnection, RuntimeStats};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Upper bound for background tasks to stop after shutdown was initiated
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Main application struct.
///
/// Owns the configuration, the assembled [`EdgeRuntime`] and the simulated
/// connections feeding it.
pub struct Application {
    config: AppConfig,
    runtime: Arc<EdgeRuntime>,
    connections: Vec<Arc<MemoryConnection>>,
}

impl Application {
    /// Loads configuration, applies CLI overrides and builds the runtime.
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }

        if args.json_logs {
            config.logging.json_format = true;
        }

        display_banner();
        Self::from_config(config)
    }

    /// Validates `config` and assembles the runtime with the built-in handlers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_config(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration loaded and validated successfully");

        let connections: Vec<Arc<MemoryConnection>> = config
            .connections
            .iter()
            .map(|settings| Arc::new(MemoryConnection::new(settings.name.as_str(), settings.kind.as_str())))
            .collect();

        let mut builder = EdgeRuntime::builder()
            .config(config.dispatch.clone())
            .factory(Arc::new(HostServices::new(AlarmLimits::from_config(&config))))
            .handlers(handlers::handler_declarations(&config))
            .events(handlers::event_declarations(&config))
            .constructors(handlers::register_constructors);

        for connection in &connections {
            builder = builder.connection(connection.clone());
        }

        let runtime = builder.build()?;

        Ok(Self {
            config,
            runtime,
            connections,
        })
    }

    pub fn runtime(&self) -> &Arc<EdgeRuntime> {
        &self.runtime
    }

    /// Runs until SIGINT/SIGTERM, then shuts down gracefully.
    ///
    /// A second signal during shutdown exits the process immediately.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let shutdown_state = self.runtime.shutdown_state().clone();

        self.run_until(async move {
            if let Err(e) = setup_signal_handlers(&shutdown_state).await {
                error!("❌ Failed to set up signal handlers: {e}");
                return;
            }

            tokio::spawn(async move {
                if let Err(e) = wait_for_signal().await {
                    error!("Failed to set up merciless shutdown signal handler: {e}");
                    return;
                }

                warn!("Shutdown signal received again! Exiting immediately.");
                std::process::exit(1);
            });
        })
        .await
    }

    /// Starts the runtime and background tasks, waits for `shutdown` (or an
    /// externally initiated shutdown) and stops everything in order.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), Box<dyn std::error::Error>>
    where
        F: Future<Output = ()>,
    {
        info!("🌟 Starting Edge Host");
        self.log_configuration_summary();

        let active = self.runtime.start().await?;
        info!("📡 {} subscription(s) active", active);

        let cancel = self.runtime.shutdown_state().child_token();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        for (connection, settings) in self.connections.iter().zip(&self.config.connections) {
            let simulator = Simulator::new(connection.clone(), settings);
            tasks.push(tokio::spawn(simulator.run(cancel.clone())));
        }

        tasks.push(tokio::spawn(monitor_health(
            self.runtime.clone(),
            Duration::from_millis(self.config.host.stats_interval_ms),
            cancel.clone(),
        )));

        if self.config.host.report_interval_ms > 0 {
            tasks.push(tokio::spawn(request_reports(
                self.runtime.clone(),
                Duration::from_millis(self.config.host.report_interval_ms),
                cancel.clone(),
            )));
        }

        info!("✅ Edge Host is now running!");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        tokio::select! {
            _ = shutdown => {}
            _ = cancel.cancelled() => {}
        }
        self.runtime.shutdown_state().initiate_shutdown();

        info!("🧹 Phase 1: Stopping simulators and monitoring...");
        let stopped = tokio::time::timeout(TASK_STOP_TIMEOUT, futures::future::join_all(tasks)).await;
        if stopped.is_err() {
            warn!("⏰ Background tasks did not stop within {:?}", TASK_STOP_TIMEOUT);
        }

        info!("⏳ Phase 2: Draining handlers and disconnecting...");
        self.runtime.shutdown().await;

        log_final_statistics(&self.runtime.stats());
        info!("✅ Edge Host shutdown complete");
        Ok(())
    }

    fn log_configuration_summary(&self) {
        info!("📋 Configuration Summary:");
        for connection in &self.config.connections {
            info!(
                "  🔌 {} ({}) - {} tag(s) every {}ms",
                connection.name,
                connection.kind,
                connection.tags.len(),
                connection.update_interval_ms
            );
        }
        info!(
            "  ⚙️ Error threshold: {} | Default poll interval: {}ms",
            self.config.dispatch.error_threshold, self.config.dispatch.default_poll_interval_ms
        );
        info!(
            "  📊 Stats every {}ms | Reports every {}ms",
            self.config.host.stats_interval_ms, self.config.host.report_interval_ms
        );
    }
}

/// Logs dispatch and mediator counters every `interval`.
async fn monitor_health(runtime: Arc<EdgeRuntime>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut last_received = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stats = runtime.stats();
                let received = stats.dispatch.notifications_received;
                info!(
                    "📊 System Health - {} notifications/period | {} dispatched | {} failed | {} suppressed | {}/{} connected",
                    received - last_received,
                    stats.dispatch.dispatched,
                    stats.dispatch.failed,
                    stats.dispatch.suppressed_keys,
                    stats.connected,
                    stats.connections
                );
                last_received = received;
            }
        }
    }
}

/// Emits `line_report` every `interval` and logs the summary.
async fn request_reports(runtime: Arc<EdgeRuntime>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                sequence += 1;
                match runtime
                    .emit_one::<_, LineSummary>(LINE_REPORT_EVENT, ReportRequest { sequence })
                    .await
                {
                    Ok(Some(summary)) => {
                        info!(
                            "📝 Report #{}: {} reading(s), {} unavailable",
                            summary.sequence,
                            summary.values.len(),
                            summary.unavailable
                        );
                        for (alias, value) in &summary.values {
                            info!("  - {} = {:.2}", alias, value);
                        }
                    }
                    Ok(None) => warn!("⚠️ Report #{} produced no summary", sequence),
                    Err(MediatorError::Cancelled) => break,
                    Err(e) => error!("❌ Report #{} failed: {}", sequence, e),
                }
            }
        }
    }
}

fn log_final_statistics(stats: &RuntimeStats) {
    info!("📊 Final Statistics:");
    info!("  - Notifications received: {}", stats.dispatch.notifications_received);
    info!("  - Handler invocations: {} ok / {} failed", stats.dispatch.succeeded, stats.dispatch.failed);
    info!("  - Events emitted: {}", stats.mediator.events_emitted);
    info!("  - Event handlers invoked: {}", stats.mediator.handlers_invoked);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionSettings, TagSettings};

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.host.stats_interval_ms = 50;
        config.host.report_interval_ms = 60;
        config.host.deadband = 0.0;
        config.connections = vec![ConnectionSettings {
            name: "plc1".to_string(),
            kind: "plc".to_string(),
            update_interval_ms: 10,
            tags: vec![
                TagSettings {
                    key: "line1/temperature".to_string(),
                    min: 80.0,
                    max: 95.0,
                    step: 5.0,
                    alarm_above: Some(90.0),
                },
                TagSettings {
                    key: "line1/count".to_string(),
                    min: 0.0,
                    max: 1_000.0,
                    step: 1.0,
                    alarm_above: None,
                },
            ],
        }];
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_application_runs_and_shuts_down() {
        let app = Application::from_config(fast_config()).unwrap();
        let runtime = app.runtime().clone();
        assert_eq!(runtime.registrations().len(), 1);

        app.run_until(tokio::time::sleep(Duration::from_millis(400)))
            .await
            .unwrap();

        let stats = runtime.stats();
        assert!(stats.dispatch.succeeded > 0);
        // at least one report plus the temperature alarm
        assert!(stats.mediator.events_emitted >= 2);
        assert!(stats.mediator.handlers_invoked >= 2);
        assert_eq!(stats.connected, 0);
        assert!(runtime.shutdown_state().is_shutdown_complete());
    }

    #[tokio::test]
    async fn test_line_report_reads_seeded_values() {
        let app = Application::from_config(fast_config()).unwrap();
        let runtime = app.runtime().clone();
        runtime.start().await.unwrap();

        // seeds every tag with its lower bound
        let _simulator = Simulator::new(app.connections[0].clone(), &app.config.connections[0]);
        let summary = runtime
            .emit_one::<_, LineSummary>(LINE_REPORT_EVENT, ReportRequest { sequence: 7 })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.sequence, 7);
        assert_eq!(summary.unavailable, 0);
        assert_eq!(
            summary.values,
            [
                ("plc1/line1/count".to_string(), 0.0),
                ("plc1/line1/temperature".to_string(), 80.0)
            ]
        );

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = fast_config();
        config.connections[0].tags[0].step = 0.0;
        assert!(Application::from_config(config).is_err());
    }

    #[tokio::test]
    async fn test_external_shutdown_ends_run() {
        let app = Application::from_config(fast_config()).unwrap();
        let state = app.runtime().shutdown_state().clone();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            state.initiate_shutdown();
        });

        tokio::time::timeout(Duration::from_secs(5), app.run_until(std::future::pending()))
            .await
            .expect("run did not observe the shutdown state")
            .unwrap();
        stopper.await.unwrap();
    }
}
