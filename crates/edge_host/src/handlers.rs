//! Built-in handlers of the edge host.
//!
//! - [`TagMonitor`] watches every configured tag and raises `over_limit` on a
//!   rising edge past the tag's alarm threshold
//! - [`OverLimitAlarm`] serves `over_limit`
//! - [`LineReport`] serves the periodic `line_report` event from pre-reads
//! - [`ReportArchiver`] archives each report request without blocking the caller

use crate::config::AppConfig;
use async_trait::async_trait;
use edge_dispatch::{
    ActivationError, Activator, CancellationToken, Constructor, Dependency, EdgeRuntime,
    EventContext, EventDeclaration, EventHandler, HandlerDeclaration, HandlerError,
    HandlerFactory, HandlerLogger, HandlerType, MessageHandler, PreRead, RawValue, ServiceType,
    Subscribe, TagMessage,
};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const OVER_LIMIT_EVENT: &str = "over_limit";
pub const LINE_REPORT_EVENT: &str = "line_report";

// ============================================================================
// Services
// ============================================================================

/// Alarm thresholds keyed by connection and tag.
#[derive(Debug, Default)]
pub struct AlarmLimits {
    limits: HashMap<(String, String), f64>,
}

impl AlarmLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            limits: config
                .alarm_thresholds()
                .into_iter()
                .map(|(connection, key, limit)| ((connection, key), limit))
                .collect(),
        }
    }

    pub fn limit(&self, connection: &str, key: &str) -> Option<f64> {
        self.limits
            .get(&(connection.to_string(), key.to_string()))
            .copied()
    }
}

/// Supplies host services and tracing loggers to the activator.
///
/// Handler instances themselves come from the registered constructors.
pub struct HostServices {
    limits: Arc<AlarmLimits>,
}

impl HostServices {
    pub fn new(limits: AlarmLimits) -> Self {
        Self {
            limits: Arc::new(limits),
        }
    }
}

impl HandlerFactory for HostServices {
    fn create(&self, _handler: &HandlerType) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }

    fn service(&self, service: &ServiceType) -> Option<Arc<dyn Any + Send + Sync>> {
        if service.is::<AlarmLimits>() {
            let limits: Arc<dyn Any + Send + Sync> = self.limits.clone();
            Some(limits)
        } else {
            None
        }
    }

    fn logger(&self, category: Option<&str>) -> Option<HandlerLogger> {
        Some(HandlerLogger::new(category))
    }
}

// ============================================================================
// Event Payloads
// ============================================================================

/// Raised when a tag crosses its alarm threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitExceeded {
    pub connection: String,
    pub key: String,
    pub value: f64,
    pub limit: f64,
}

/// Data of the periodic `line_report` event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportRequest {
    pub sequence: u64,
}

/// Result of `line_report`: every good reading plus the number of tags that
/// could not be read.
#[derive(Debug, Clone, PartialEq)]
pub struct LineSummary {
    pub sequence: u64,
    pub values: Vec<(String, f64)>,
    pub unavailable: usize,
}

// ============================================================================
// Handlers
// ============================================================================

pub struct TagMonitor {
    runtime: Arc<EdgeRuntime>,
    limits: Arc<AlarmLimits>,
    logger: HandlerLogger,
}

#[async_trait]
impl MessageHandler<f64> for TagMonitor {
    async fn handle(&self, message: TagMessage<f64>, _cancel: CancellationToken) -> Result<(), HandlerError> {
        self.logger.debug(&format!(
            "📈 {}/{} = {:.2}",
            message.connection, message.key, message.value
        ));

        let Some(limit) = self.limits.limit(&message.connection, &message.key) else {
            return Ok(());
        };

        let was_below = message
            .previous
            .as_ref()
            .and_then(RawValue::as_f64)
            .map_or(true, |previous| previous <= limit);

        if message.value > limit && was_below {
            let exceeded = LimitExceeded {
                connection: message.connection.to_string(),
                key: message.key.to_string(),
                value: message.value,
                limit,
            };
            self.runtime
                .emit(OVER_LIMIT_EVENT, exceeded)
                .await
                .map_err(|e| HandlerError::msg(e.to_string()))?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct OverLimitAlarm;

#[async_trait]
impl EventHandler<LimitExceeded> for OverLimitAlarm {
    type Output = ();

    async fn handle(&self, context: EventContext<LimitExceeded>, _cancel: CancellationToken) -> Result<(), HandlerError> {
        let alarm = &context.data;
        warn!(
            "🚨 {}/{} at {:.2} exceeds limit {:.2}",
            alarm.connection, alarm.key, alarm.value, alarm.limit
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct LineReport;

#[async_trait]
impl EventHandler<ReportRequest> for LineReport {
    type Output = LineSummary;

    async fn handle(&self, context: EventContext<ReportRequest>, _cancel: CancellationToken) -> Result<LineSummary, HandlerError> {
        let mut values = Vec::new();
        let mut unavailable = 0;

        for alias in context.reads.aliases() {
            if context.reads.is_good(alias) {
                values.push((alias.to_string(), context.reads.get::<f64>(alias)));
            } else {
                unavailable += 1;
            }
        }

        Ok(LineSummary {
            sequence: context.data.sequence,
            values,
            unavailable,
        })
    }
}

pub struct ReportArchiver {
    logger: HandlerLogger,
}

#[async_trait]
impl EventHandler<ReportRequest> for ReportArchiver {
    type Output = ();

    async fn handle(&self, context: EventContext<ReportRequest>, _cancel: CancellationToken) -> Result<(), HandlerError> {
        self.logger.info(&format!(
            "🗄️ Archived report #{} with {} reading(s)",
            context.data.sequence,
            context.reads.len()
        ));
        Ok(())
    }
}

// ============================================================================
// Declarations
// ============================================================================

/// The tag monitor watches every key of every configured connection.
pub fn handler_declarations(config: &AppConfig) -> Vec<HandlerDeclaration> {
    let monitor = config.connections.iter().fold(
        HandlerDeclaration::message_handler::<TagMonitor, f64>(),
        |declaration, connection| {
            declaration.subscribe(
                Subscribe::new(connection.name.as_str(), "#").deadband(config.host.deadband),
            )
        },
    );
    vec![monitor]
}

/// `line_report` pre-reads every configured tag, aliased `connection/key`.
pub fn event_declarations(config: &AppConfig) -> Vec<EventDeclaration> {
    let pre_reads: Vec<PreRead> = config
        .connections
        .iter()
        .flat_map(|connection| {
            connection.tags.iter().map(move |tag| {
                PreRead::new(connection.name.as_str(), tag.key.as_str())
                    .alias(format!("{}/{}", connection.name, tag.key))
                    .value_type::<f64>()
            })
        })
        .collect();

    let report = pre_reads.iter().cloned().fold(
        EventDeclaration::new::<LineReport, ReportRequest>(LINE_REPORT_EVENT).priority(10),
        EventDeclaration::pre_read,
    );
    let archive = pre_reads.into_iter().fold(
        EventDeclaration::new::<ReportArchiver, ReportRequest>(LINE_REPORT_EVENT).fire_and_forget(),
        EventDeclaration::pre_read,
    );

    vec![
        EventDeclaration::new::<OverLimitAlarm, LimitExceeded>(OVER_LIMIT_EVENT),
        report,
        archive,
    ]
}

pub fn register_constructors(activator: &Activator) -> Result<(), ActivationError> {
    activator.register_handler(vec![Constructor::new(
        vec![
            Dependency::orchestrator::<EdgeRuntime>(),
            Dependency::service::<AlarmLimits>(),
            Dependency::logger("tag_monitor"),
        ],
        |deps| {
            Ok(TagMonitor {
                runtime: deps.orchestrator::<EdgeRuntime>(0)?,
                limits: deps.service::<AlarmLimits>(1)?,
                logger: deps.logger(2)?,
            })
        },
    )])?;
    activator.register_default::<OverLimitAlarm>()?;
    activator.register_default::<LineReport>()?;
    activator.register_handler(vec![Constructor::new(
        vec![Dependency::logger("report_archiver")],
        |deps| {
            Ok(ReportArchiver {
                logger: deps.logger(0)?,
            })
        },
    )])?;

    info!("📋 Registered built-in handler constructors");
    Ok(())
}
