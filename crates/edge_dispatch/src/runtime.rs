//! # Edge Runtime
//!
//! Wires the dispatch core together: the live [`ConnectionSet`], the
//! [`Activator`], the [`ValueMarshaller`], the [`DispatchEngine`] and the
//! [`EventMediator`]. The runtime is also the orchestrator root handed to
//! handlers that declare a [`Dependency::orchestrator`] parameter.
//!
//! ```rust,no_run
//! use edge_dispatch::{DispatchConfig, EdgeRuntime, MemoryConnection};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), edge_dispatch::RuntimeError> {
//! let runtime = EdgeRuntime::builder()
//!     .config(DispatchConfig::default())
//!     .connection(Arc::new(MemoryConnection::new("plc1", "plc")))
//!     .build()?;
//!
//! runtime.start().await?;
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! [`Dependency::orchestrator`]: crate::activator::Dependency::orchestrator

use crate::activator::{Activator, HandlerFactory};
use crate::config::DispatchConfig;
use crate::discovery::{discover, EventDeclaration, HandlerDeclaration, Registration, Subscribe};
use crate::dispatch::{DispatchEngine, DispatchStats};
use crate::error::{ActivationError, CommError, HandlerError, MediatorError, RuntimeError};
use crate::handler::TagMessage;
use crate::marshal::{PayloadType, TagValue, ValueMarshaller};
use crate::mediator::{EventMediator, MediatorStats};
use crate::shutdown::ShutdownState;
use crate::tracking::{ReadTracker, TrackedRead};
use crate::transport::{connect_with_retry, Connection, ConnectionSet};
use crate::types::SubscriptionId;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type ActivatorSetup = Box<dyn FnOnce(&Activator) -> Result<(), ActivationError> + Send>;

/// Combined counters of the engine and the mediator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub dispatch: DispatchStats,
    pub mediator: MediatorStats,
    pub connections: usize,
    pub connected: usize,
}

/// Builder for [`EdgeRuntime`].
#[derive(Default)]
pub struct EdgeRuntimeBuilder {
    config: DispatchConfig,
    connections: Vec<Arc<dyn Connection>>,
    factory: Option<Arc<dyn HandlerFactory>>,
    handlers: Vec<HandlerDeclaration>,
    events: Vec<EventDeclaration>,
    setup: Vec<ActivatorSetup>,
}

impl EdgeRuntimeBuilder {
    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connections.push(connection);
        self
    }

    /// Installs the external handler factory consulted before constructors.
    pub fn factory(mut self, factory: Arc<dyn HandlerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn handler(mut self, declaration: HandlerDeclaration) -> Self {
        self.handlers.push(declaration);
        self
    }

    pub fn handlers(mut self, declarations: impl IntoIterator<Item = HandlerDeclaration>) -> Self {
        self.handlers.extend(declarations);
        self
    }

    pub fn event(mut self, declaration: EventDeclaration) -> Self {
        self.events.push(declaration);
        self
    }

    pub fn events(mut self, declarations: impl IntoIterator<Item = EventDeclaration>) -> Self {
        self.events.extend(declarations);
        self
    }

    /// Registers handler constructors once the activator exists.
    pub fn constructors(
        mut self,
        setup: impl FnOnce(&Activator) -> Result<(), ActivationError> + Send + 'static,
    ) -> Self {
        self.setup.push(Box::new(setup));
        self
    }

    /// Builds the runtime. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Arc<EdgeRuntime>, RuntimeError> {
        self.config.validate()?;
        let handle = Handle::try_current().map_err(|_| RuntimeError::NoRuntime)?;

        let connections = Arc::new(ConnectionSet::new());
        for connection in self.connections {
            connections.insert(connection);
        }

        let mut activator = Activator::new(connections.clone());
        if let Some(factory) = self.factory {
            activator = activator.with_factory(factory);
        }
        for setup in self.setup {
            setup(&activator)?;
        }
        let activator = Arc::new(activator);

        let shutdown = ShutdownState::new();
        let marshaller = Arc::new(ValueMarshaller::new());

        let engine = DispatchEngine::new(
            activator.clone(),
            marshaller.clone(),
            connections.clone(),
            self.config.clone(),
            handle.clone(),
            shutdown.child_token(),
        );

        let mediator = EventMediator::new(
            activator.clone(),
            connections.clone(),
            self.config.mediator.clone(),
            self.events,
            handle,
            shutdown.child_token(),
        );

        let registrations = discover(&self.handlers);
        info!(
            "🔍 Discovered {} registration(s) from {} handler declaration(s)",
            registrations.len(),
            self.handlers.len()
        );

        let runtime = Arc::new(EdgeRuntime {
            config: self.config,
            tracker: ReadTracker::new(connections.clone()),
            connections,
            activator,
            marshaller,
            engine,
            mediator,
            registrations,
            shutdown,
            stopped: AtomicBool::new(false),
        });
        runtime.activator.set_root(&runtime);

        Ok(runtime)
    }
}

/// The assembled dispatch core.
pub struct EdgeRuntime {
    config: DispatchConfig,
    connections: Arc<ConnectionSet>,
    activator: Arc<Activator>,
    marshaller: Arc<ValueMarshaller>,
    engine: Arc<DispatchEngine>,
    mediator: Arc<EventMediator>,
    tracker: ReadTracker,
    registrations: Vec<Registration>,
    shutdown: ShutdownState,
    /// Set once the drain and disconnect phases ran
    stopped: AtomicBool,
}

impl std::fmt::Debug for EdgeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeRuntime")
            .field("connections", &self.connections.names())
            .field("registrations", &self.registrations.len())
            .field("shutdown", &self.shutdown.is_shutdown_initiated())
            .finish()
    }
}

impl EdgeRuntime {
    pub fn builder() -> EdgeRuntimeBuilder {
        EdgeRuntimeBuilder::default()
    }

    /// Connects every connection and subscribes its registrations.
    ///
    /// Returns the number of active subscriptions.
    pub async fn start(&self) -> Result<usize, RuntimeError> {
        for registration in &self.registrations {
            if !self.connections.contains(registration.connection_name()) {
                warn!(
                    "⚠️ {} subscribes {} on unknown connection {}",
                    registration.handler_type(),
                    registration.key(),
                    registration.connection_name()
                );
            }
        }

        let policy = self.config.reconnect.to_policy();
        let cancel = self.shutdown.child_token();
        let mut active = 0;

        for connection in self.connections.all() {
            if !connection.is_connected() {
                connect_with_retry(&connection, policy, &cancel).await?;
            }
            active += self
                .engine
                .start_connection(connection.name(), &self.registrations)
                .await?;
        }

        info!("🚀 Edge runtime started with {} active subscription(s)", active);
        Ok(active)
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub async fn emit<E: Send + Sync + 'static>(&self, event_name: &str, data: E) -> Result<(), MediatorError> {
        self.mediator.emit(event_name, data).await
    }

    pub async fn emit_one<E, R>(&self, event_name: &str, data: E) -> Result<Option<R>, MediatorError>
    where
        E: Send + Sync + 'static,
        R: Send + 'static,
    {
        self.mediator.emit_one(event_name, data).await
    }

    pub async fn emit_all<E, R>(&self, event_name: &str, data: E) -> Result<Vec<R>, MediatorError>
    where
        E: Send + Sync + 'static,
        R: Send + 'static,
    {
        self.mediator.emit_all(event_name, data).await
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Reads a key once with change bookkeeping.
    pub async fn read_tracked(
        &self,
        connection: &str,
        key: &str,
        value_type: Option<PayloadType>,
    ) -> Result<TrackedRead, CommError> {
        self.tracker.read(connection, key, value_type).await
    }

    /// Encodes a typed value and writes it once.
    pub async fn write<T: TagValue>(&self, connection: &str, key: &str, value: &T) -> Result<(), HandlerError> {
        let raw = ValueMarshaller::encode(value)?;
        let link = self
            .connections
            .get(connection)
            .ok_or_else(|| CommError::UnknownConnection(connection.to_string()))?;
        link.write_once(key, raw).await?;
        Ok(())
    }

    /// Subscribes a callback on demand.
    pub async fn subscribe<T, F, Fut>(&self, subscription: Subscribe, callback: F) -> Result<SubscriptionId, RuntimeError>
    where
        T: TagValue,
        F: Fn(TagMessage<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Ok(self.engine.subscribe_callback(subscription, callback).await?)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }

    pub fn mediator(&self) -> &Arc<EventMediator> {
        &self.mediator
    }

    pub fn activator(&self) -> &Arc<Activator> {
        &self.activator
    }

    pub fn marshaller(&self) -> &Arc<ValueMarshaller> {
        &self.marshaller
    }

    pub fn connections(&self) -> &Arc<ConnectionSet> {
        &self.connections
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn shutdown_state(&self) -> &ShutdownState {
        &self.shutdown
    }

    pub fn stats(&self) -> RuntimeStats {
        let all = self.connections.all();
        RuntimeStats {
            dispatch: self.engine.stats(),
            mediator: self.mediator.stats(),
            connections: all.len(),
            connected: all.iter().filter(|connection| connection.is_connected()).count(),
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stops new work, drains in-flight handlers and disconnects.
    ///
    /// The shutdown may already have been initiated through
    /// [`shutdown_state`](Self::shutdown_state) (signals, host lifecycle); the
    /// drain still runs, exactly once.
    pub async fn shutdown(&self) {
        self.shutdown.initiate_shutdown();
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.engine.shutdown().await;
        self.mediator.shutdown().await;

        for connection in self.connections.all() {
            if let Err(e) = connection.disconnect().await {
                warn!("⚠️ Disconnect of {} failed: {}", connection.name(), e);
            }
        }

        self.shutdown.complete_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activator::{Constructor, Dependency};
    use crate::error::ConfigError;
    use crate::handler::{EventContext, EventHandler, MessageHandler};
    use crate::transport::MemoryConnection;
    use crate::types::SubscriptionState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Raises an event through the orchestrator for every level change.
    struct LevelWatcher {
        runtime: Arc<EdgeRuntime>,
    }

    #[async_trait]
    impl MessageHandler<f64> for LevelWatcher {
        async fn handle(&self, message: TagMessage<f64>, _cancel: CancellationToken) -> Result<(), HandlerError> {
            if message.value > 90.0 {
                self.runtime
                    .emit("high_level", message.value)
                    .await
                    .map_err(|e| HandlerError::msg(e.to_string()))?;
            }
            Ok(())
        }
    }

    static HIGH_LEVELS: AtomicU64 = AtomicU64::new(0);

    #[derive(Default)]
    struct HighLevelAlarm;

    #[async_trait]
    impl EventHandler<f64> for HighLevelAlarm {
        type Output = ();

        async fn handle(&self, _context: EventContext<f64>, _cancel: CancellationToken) -> Result<(), HandlerError> {
            HIGH_LEVELS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runtime_end_to_end() {
        let plc = Arc::new(MemoryConnection::new("plc1", "plc"));

        let runtime = EdgeRuntime::builder()
            .connection(plc.clone())
            .handler(
                HandlerDeclaration::message_handler::<LevelWatcher, f64>()
                    .subscribe(Subscribe::new("plc1", "Tank.Level")),
            )
            .event(EventDeclaration::new::<HighLevelAlarm, f64>("high_level"))
            .constructors(|activator| {
                activator.register_handler(vec![Constructor::new(
                    vec![Dependency::orchestrator::<EdgeRuntime>()],
                    |deps| {
                        Ok(LevelWatcher {
                            runtime: deps.orchestrator::<EdgeRuntime>(0)?,
                        })
                    },
                )])?;
                activator.register_default::<HighLevelAlarm>()
            })
            .build()
            .unwrap();

        assert_eq!(runtime.start().await.unwrap(), 1);
        assert!(plc.is_connected());
        assert_eq!(runtime.engine().state("plc1", "Tank.Level"), SubscriptionState::Active);

        plc.set_value("Tank.Level", 50.0);
        plc.set_value("Tank.Level", 95.0);
        assert!(runtime.engine().wait_idle(Duration::from_secs(5)).await);

        assert_eq!(HIGH_LEVELS.load(Ordering::SeqCst), 1);
        let stats = runtime.stats();
        assert_eq!(stats.dispatch.succeeded, 2);
        assert_eq!(stats.mediator.handlers_invoked, 1);
        assert_eq!(stats.connected, 1);

        runtime.write("plc1", "Tank.Setpoint", &75.5f64).await.unwrap();
        assert_eq!(plc.writes().len(), 1);

        let tracked = runtime.read_tracked("plc1", "Tank.Setpoint", None).await.unwrap();
        assert!(tracked.is_initial_read);

        runtime.shutdown().await;
        assert!(runtime.shutdown_state().is_shutdown_complete());
        assert!(!plc.is_connected());
    }

    #[test]
    fn test_build_requires_tokio_runtime() {
        let result = EdgeRuntime::builder().build();
        assert!(matches!(result, Err(RuntimeError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_build_validates_config() {
        let config = DispatchConfig {
            error_threshold: 0,
            ..DispatchConfig::default()
        };

        let result = EdgeRuntime::builder().config(config).build();
        assert!(matches!(result, Err(RuntimeError::Config(ConfigError::Invalid(_)))));
    }

    static ARCHIVED: AtomicU64 = AtomicU64::new(0);

    #[derive(Default)]
    struct SlowArchive;

    #[async_trait]
    impl EventHandler<u32> for SlowArchive {
        type Output = ();

        async fn handle(&self, _context: EventContext<u32>, _cancel: CancellationToken) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ARCHIVED.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_drains_after_external_initiate() {
        let plc = Arc::new(MemoryConnection::new("plc1", "plc"));

        let runtime = EdgeRuntime::builder()
            .connection(plc.clone())
            .event(EventDeclaration::new::<SlowArchive, u32>("archive").fire_and_forget())
            .constructors(|activator| activator.register_default::<SlowArchive>())
            .build()
            .unwrap();

        runtime.start().await.unwrap();
        assert!(plc.is_connected());
        runtime.emit("archive", 1u32).await.unwrap();

        // signal handlers and the host lifecycle initiate before shutting down
        assert!(runtime.shutdown_state().initiate_shutdown());
        runtime.shutdown().await;

        assert_eq!(ARCHIVED.load(Ordering::SeqCst), 1);
        assert!(!plc.is_connected());
        assert!(runtime.shutdown_state().is_shutdown_complete());

        // a second call is a no-op
        runtime.shutdown().await;
        assert!(runtime.shutdown_state().is_shutdown_complete());
    }
}
