//! The event mediator.

use super::read_result::ReadResult;
use super::registration::EventRegistration;
use crate::activator::{Activator, ScopedInstance};
use crate::config::MediatorConfig;
use crate::discovery::{discover_events, EventDeclaration, PreRead};
use crate::error::{CommError, DiscoveryError, MediatorError};
use crate::transport::ConnectionSet;
use crate::types::ReadValue;
use arc_swap::ArcSwap;
use futures::FutureExt;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

type EventOutput = Box<dyn Any + Send>;
type RegistrationTable = HashMap<String, Arc<Vec<Arc<EventRegistration>>>>;

/// Which handler results an emit keeps.
#[derive(Debug, Clone, Copy)]
enum Collect {
    Nothing,
    First(TypeId),
    All(TypeId),
}

impl Collect {
    fn accepts(self, result_type: Option<(TypeId, &'static str)>) -> bool {
        match self {
            Collect::Nothing => false,
            Collect::First(wanted) | Collect::All(wanted) => {
                result_type.is_some_and(|(id, _)| id == wanted)
            }
        }
    }
}

#[derive(Default)]
struct Outcome {
    outputs: Vec<EventOutput>,
    first_error: Option<MediatorError>,
}

impl Outcome {
    fn record(&mut self, error: MediatorError) {
        self.first_error.get_or_insert(error);
    }
}

#[derive(Debug, Default)]
struct Counters {
    emitted: AtomicU64,
    invoked: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of the mediator counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediatorStats {
    pub events_emitted: u64,
    pub handlers_invoked: u64,
    pub handler_failures: u64,
    pub registered_handlers: usize,
}

/// Dispatches on-demand events to their registered handlers.
///
/// Declarations passed at construction are scanned on the first emit.
/// Registrations are published as copy-on-write snapshots, so emits never
/// take a lock.
pub struct EventMediator {
    activator: Arc<Activator>,
    connections: Arc<ConnectionSet>,
    config: MediatorConfig,
    pending: Mutex<Option<Vec<EventDeclaration>>>,
    initialized: OnceCell<()>,
    registrations: ArcSwap<RegistrationTable>,
    write_lock: Mutex<()>,
    sequence: AtomicU64,
    counters: Counters,
    runtime: Handle,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for EventMediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMediator")
            .field("events", &self.registrations.load().len())
            .field("initialized", &self.initialized.get().is_some())
            .field("in_flight", &self.tracker.len())
            .finish()
    }
}

impl EventMediator {
    pub fn new(
        activator: Arc<Activator>,
        connections: Arc<ConnectionSet>,
        config: MediatorConfig,
        declarations: Vec<EventDeclaration>,
        runtime: Handle,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            activator,
            connections,
            config,
            pending: Mutex::new(Some(declarations)),
            initialized: OnceCell::new(),
            registrations: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            sequence: AtomicU64::new(0),
            counters: Counters::default(),
            runtime,
            cancel,
            tracker: TaskTracker::new(),
        })
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn ensure_initialized(&self) {
        self.initialized.get_or_init(|| {
            let declarations = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
                .unwrap_or_default();

            let first = self
                .sequence
                .fetch_add(declarations.len() as u64, Ordering::SeqCst);
            let registrations = discover_events(&declarations, first);
            info!("📋 Event mediator initialized with {} handler(s)", registrations.len());
            self.publish(registrations);
        });
    }

    /// Appends one registration explicitly.
    pub fn register(&self, declaration: EventDeclaration) -> Result<(), MediatorError> {
        let handler = declaration.handler_type().name();
        if declaration.disabled {
            return Err(DiscoveryError::Disabled { handler }.into());
        }
        if declaration.event_name().is_empty() {
            return Err(DiscoveryError::MissingEventName { handler }.into());
        }

        self.ensure_initialized();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.publish(vec![EventRegistration::from_declaration(&declaration, sequence)]);
        debug!("📝 Registered {} for event {}", declaration.handler_type(), declaration.event_name());
        Ok(())
    }

    fn publish(&self, added: Vec<EventRegistration>) {
        if added.is_empty() {
            return;
        }

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut table: RegistrationTable = (**self.registrations.load()).clone();
        let mut touched: HashMap<String, Vec<Arc<EventRegistration>>> = HashMap::new();

        for registration in added {
            let name = registration.event_name().to_string();
            touched
                .entry(name.clone())
                .or_insert_with(|| table.get(&name).map(|list| list.to_vec()).unwrap_or_default())
                .push(Arc::new(registration));
        }

        for (name, mut list) in touched {
            list.sort_by_key(|registration| registration.order_key());
            table.insert(name, Arc::new(list));
        }

        self.registrations.store(Arc::new(table));
    }

    /// Registrations of an event in invocation order.
    pub fn registrations(&self, event_name: &str) -> Vec<Arc<EventRegistration>> {
        self.ensure_initialized();
        self.registrations
            .load()
            .get(event_name)
            .map(|list| list.to_vec())
            .unwrap_or_default()
    }

    /// Names of every event with at least one handler, sorted.
    pub fn event_names(&self) -> Vec<String> {
        self.ensure_initialized();
        let mut names: Vec<String> = self.registrations.load().keys().cloned().collect();
        names.sort();
        names
    }

    // ========================================================================
    // Emit
    // ========================================================================

    /// Runs every handler of the event and discards their results.
    pub async fn emit<E>(self: &Arc<Self>, event_name: &str, data: E) -> Result<(), MediatorError>
    where
        E: Send + Sync + 'static,
    {
        let outcome = self.run(event_name, data, Collect::Nothing).await?;
        outcome.first_error.map_or(Ok(()), Err)
    }

    /// Runs handlers until one produces a result of type `R`.
    ///
    /// Fails only when no result was produced and a handler failed.
    pub async fn emit_one<E, R>(self: &Arc<Self>, event_name: &str, data: E) -> Result<Option<R>, MediatorError>
    where
        E: Send + Sync + 'static,
        R: Send + 'static,
    {
        let outcome = self
            .run(event_name, data, Collect::First(TypeId::of::<R>()))
            .await?;

        let first = outcome
            .outputs
            .into_iter()
            .next()
            .and_then(|output| output.downcast::<R>().ok())
            .map(|output| *output);

        match (first, outcome.first_error) {
            (Some(result), _) => Ok(Some(result)),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(None),
        }
    }

    /// Runs every handler and returns the results of type `R` in invocation
    /// order.
    pub async fn emit_all<E, R>(self: &Arc<Self>, event_name: &str, data: E) -> Result<Vec<R>, MediatorError>
    where
        E: Send + Sync + 'static,
        R: Send + 'static,
    {
        let outcome = self
            .run(event_name, data, Collect::All(TypeId::of::<R>()))
            .await?;

        if let Some(e) = outcome.first_error {
            return Err(e);
        }

        Ok(outcome
            .outputs
            .into_iter()
            .filter_map(|output| output.downcast::<R>().ok())
            .map(|output| *output)
            .collect())
    }

    async fn run<E>(self: &Arc<Self>, event_name: &str, data: E, collect: Collect) -> Result<Outcome, MediatorError>
    where
        E: Send + Sync + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(MediatorError::Cancelled);
        }

        self.ensure_initialized();
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);

        let Some(registrations) = self.registrations.load().get(event_name).cloned() else {
            warn!("⚠️ No handlers registered for event {}", event_name);
            return Ok(Outcome::default());
        };

        let event: Arc<str> = Arc::from(event_name);
        let data: Arc<dyn Any + Send + Sync> = Arc::new(data);
        let mut outcome = Outcome::default();

        for registration in registrations.iter() {
            if self.cancel.is_cancelled() {
                outcome.record(MediatorError::Cancelled);
                break;
            }

            if registration.event_data_type() != TypeId::of::<E>() {
                warn!(
                    "⚠️ Skipping {} for event {}: expects {}, got {}",
                    registration.handler_type(),
                    event_name,
                    registration.event_data_type_name(),
                    std::any::type_name::<E>()
                );
                continue;
            }

            if registration.fire_and_forget() {
                // pre-reads and activation fail the emit; only the call is detached
                let prepared = match self.pre_read(&event, registration).await {
                    Ok(reads) => self
                        .activator
                        .create_scoped_instance(&registration.handler_type())
                        .map(|scoped| (scoped, reads))
                        .map_err(MediatorError::from),
                    Err(e) => Err(e),
                };

                match prepared {
                    Ok((scoped, reads)) => {
                        self.spawn_detached(registration.clone(), scoped, event.clone(), data.clone(), reads)
                    }
                    Err(e) => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!("❌ Event {}: {}", event_name, e);
                        outcome.record(e);
                    }
                }
                continue;
            }

            let result = match self.pre_read(&event, registration).await {
                Ok(reads) => self.invoke(registration, event.clone(), data.clone(), reads).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(output) if collect.accepts(registration.result_type()) => {
                    outcome.outputs.push(output);
                    if matches!(collect, Collect::First(_)) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!("❌ Event {}: {}", event_name, e);
                    outcome.record(e);
                }
            }
        }

        Ok(outcome)
    }

    fn spawn_detached(
        self: &Arc<Self>,
        registration: Arc<EventRegistration>,
        scoped: ScopedInstance,
        event: Arc<str>,
        data: Arc<dyn Any + Send + Sync>,
        reads: ReadResult,
    ) {
        let mediator = self.clone();
        self.tracker.spawn_on(
            async move {
                let result = mediator.call(&registration, scoped, event.clone(), data, reads).await;

                if let Err(e) = result {
                    mediator.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("⚠️ Fire-and-forget handler for {} failed: {}", event, e);
                }
            },
            &self.runtime,
        );
    }

    async fn invoke(
        &self,
        registration: &EventRegistration,
        event: Arc<str>,
        data: Arc<dyn Any + Send + Sync>,
        reads: ReadResult,
    ) -> Result<EventOutput, MediatorError> {
        let scoped = self.activator.create_scoped_instance(&registration.handler_type())?;
        self.call(registration, scoped, event, data, reads).await
    }

    /// Runs the handler on an activated instance and releases it afterwards.
    async fn call(
        &self,
        registration: &EventRegistration,
        scoped: ScopedInstance,
        event: Arc<str>,
        data: Arc<dyn Any + Send + Sync>,
        reads: ReadResult,
    ) -> Result<EventOutput, MediatorError> {
        let handler = registration.handler_type().name();
        self.counters.invoked.fetch_add(1, Ordering::Relaxed);

        let call = registration.binding.invoke(
            scoped.instance.clone(),
            event.clone(),
            data,
            Arc::new(reads),
            self.cancel.child_token(),
        );

        let result = AssertUnwindSafe(call)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(MediatorError::HandlerPanicked {
                    event: event.to_string(),
                    handler,
                })
            });

        scoped.release.release();
        result
    }

    // ========================================================================
    // Pre-Reads
    // ========================================================================

    async fn pre_read(&self, event: &str, registration: &EventRegistration) -> Result<ReadResult, MediatorError> {
        let mut reads = ReadResult::new();

        for pre_read in registration.pre_reads() {
            match self.read_one(pre_read).await {
                Ok(value) => reads.insert(pre_read.alias.clone(), value),
                Err(source) if pre_read.continue_on_failure => {
                    debug!("Pre-read {} for {} failed, continuing: {}", pre_read.alias, event, source);
                    reads.insert(pre_read.alias.clone(), ReadValue::comm_error());
                }
                Err(source) => {
                    return Err(MediatorError::PreReadFailed {
                        event: event.to_string(),
                        alias: pre_read.alias.clone(),
                        source,
                    })
                }
            }
        }

        Ok(reads)
    }

    async fn read_one(&self, pre_read: &PreRead) -> Result<ReadValue, CommError> {
        let connection = self
            .connections
            .get(&pre_read.connection)
            .ok_or_else(|| CommError::UnknownConnection(pre_read.connection.clone()))?;

        let read = tokio::time::timeout(
            self.config.pre_read_timeout(),
            connection.read_once(&pre_read.key, pre_read.value_type),
        );

        tokio::select! {
            _ = self.cancel.cancelled() => Err(CommError::Cancelled),
            result = read => result.map_err(|_| CommError::Timeout {
                operation: format!("pre-read of {}", pre_read.key),
            })?,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn stats(&self) -> MediatorStats {
        MediatorStats {
            events_emitted: self.counters.emitted.load(Ordering::Relaxed),
            handlers_invoked: self.counters.invoked.load(Ordering::Relaxed),
            handler_failures: self.counters.failed.load(Ordering::Relaxed),
            registered_handlers: self
                .registrations
                .load()
                .values()
                .map(|list| list.len())
                .sum(),
        }
    }

    /// Stops new emits and waits for fire-and-forget handlers to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("✅ Event mediator stopped");
    }
}
