//! # Dispatch Engine
//!
//! Owns the live subscription tables of every connection and is the entry
//! point for change notifications. [`DispatchEngine::on_changed`] is
//! synchronous: it filters the notification and hands delivered ones to a
//! task spawned on the runtime captured at construction. Handler failures are
//! logged with per-key throttling and counted; a key whose consecutive
//! failures exceed the configured threshold is suppressed and unsubscribed.

use super::filter::{self, ChangeFilter, FilterDecision};
use super::subscription::{CallbackFn, ConnectionTable, Invoker, RuntimeSubscription, SubscriptionInfo};
use crate::activator::Activator;
use crate::config::DispatchConfig;
use crate::discovery::{Registration, Subscribe};
use crate::error::{DispatchError, HandlerError};
use crate::handler::{Notification, TagMessage};
use crate::marshal::{PayloadType, TagValue, TypedPayload, ValueMarshaller};
use crate::topic;
use crate::transport::{connect_with_retry, Connection, ConnectionSet, NotificationSink};
use crate::types::{Quality, RawValue, SubscriptionId, SubscriptionMode, SubscriptionState};
use crate::utils::current_timestamp_ms;
use compact_str::CompactString;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    dispatched: AtomicU64,
    filtered: AtomicU64,
    dropped: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    suppressed: AtomicU64,
}

/// Snapshot of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Notifications that reached `on_changed`
    pub notifications_received: u64,
    /// Notifications handed to a handler task
    pub dispatched: u64,
    /// Notifications removed by change or deadband filtering
    pub filtered: u64,
    /// Notifications without a matching subscription
    pub dropped: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Keys suppressed after repeated failures
    pub suppressed_keys: u64,
    pub active_subscriptions: usize,
    /// Handler tasks still running
    pub in_flight: usize,
}

// ============================================================================
// Engine
// ============================================================================

/// Routes change notifications to handlers.
pub struct DispatchEngine {
    tables: DashMap<String, Arc<ConnectionTable>>,
    activator: Arc<Activator>,
    marshaller: Arc<ValueMarshaller>,
    connections: Arc<ConnectionSet>,
    config: DispatchConfig,
    counters: Counters,
    runtime: Handle,
    cancel: CancellationToken,
    tracker: TaskTracker,
    reconnecting: DashSet<String>,
    started: Instant,
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("connections", &self.tables.len())
            .field("in_flight", &self.tracker.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl DispatchEngine {
    /// Creates an engine that spawns handler work onto `runtime`.
    ///
    /// `cancel` is shared with handlers; once it fires no new dispatch work
    /// starts.
    pub fn new(
        activator: Arc<Activator>,
        marshaller: Arc<ValueMarshaller>,
        connections: Arc<ConnectionSet>,
        config: DispatchConfig,
        runtime: Handle,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            tables: DashMap::new(),
            activator,
            marshaller,
            connections,
            config,
            counters: Counters::default(),
            runtime,
            cancel,
            tracker: TaskTracker::new(),
            reconnecting: DashSet::new(),
            started: Instant::now(),
        })
    }

    pub fn marshaller(&self) -> &Arc<ValueMarshaller> {
        &self.marshaller
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    // ========================================================================
    // Notification Entry Point
    // ========================================================================

    /// Handles one change notification raised by a connection.
    ///
    /// Never blocks on handlers and never fails: unmatched and filtered
    /// notifications are counted, delivered ones are spawned.
    pub fn on_changed(self: &Arc<Self>, connection: &str, key: &str, raw: RawValue, quality: Quality) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if self.cancel.is_cancelled() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let matched = self
            .table(connection)
            .map(|table| table.lookup(key))
            .unwrap_or_default();

        if matched.is_empty() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("No subscription for {} on {}", key, connection);
            return;
        }

        let connection: Arc<str> = Arc::from(connection);
        let key_arc: Arc<str> = Arc::from(key);
        let timestamp_ms = current_timestamp_ms();

        for subscription in matched {
            let decision = filter::evaluate(&subscription.filter, &subscription.last_values, key, &raw, quality);

            let previous = match decision {
                FilterDecision::Deliver { previous } => previous,
                FilterDecision::Suppress(reason) => {
                    self.counters.filtered.fetch_add(1, Ordering::Relaxed);
                    trace!("Filtered {} on {}: {:?}", key, connection, reason);
                    continue;
                }
            };

            let notification = Notification {
                connection: connection.clone(),
                key: key_arc.clone(),
                raw: raw.clone(),
                quality,
                timestamp_ms,
                previous,
            };

            self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
            let engine = self.clone();
            self.tracker
                .spawn_on(engine.dispatch(subscription, notification), &self.runtime);
        }
    }

    async fn dispatch(self: Arc<Self>, subscription: Arc<RuntimeSubscription>, notification: Notification) {
        let key = notification.key.clone();

        let outcome = AssertUnwindSafe(self.invoke(&subscription, notification))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(DispatchError::HandlerPanicked {
                    handler: subscription.invoker.name(),
                })
            });

        match outcome {
            Ok(()) => {
                subscription.consecutive_failures.store(0, Ordering::Relaxed);
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.record_failure(&subscription, &key, e),
        }
    }

    async fn invoke(&self, subscription: &RuntimeSubscription, notification: Notification) -> Result<(), DispatchError> {
        match &subscription.invoker {
            Invoker::Handler(binding) => {
                // dropping the scoped instance on an early return releases it
                let scoped = self.activator.create_scoped_instance(&binding.handler_type())?;
                let payload = self.marshaller.to_typed(&notification.raw, &subscription.payload_type)?;

                let result = binding
                    .invoke(scoped.instance.clone(), notification, payload, self.cancel.child_token())
                    .await;
                scoped.release.release();
                result
            }
            Invoker::Callback(callback) => {
                let payload = self.marshaller.to_typed(&notification.raw, &subscription.payload_type)?;
                callback(notification, payload, self.cancel.child_token()).await
            }
        }
    }

    fn record_failure(&self, subscription: &Arc<RuntimeSubscription>, key: &str, error: DispatchError) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        let failures = subscription.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        // offset by one so that 0 keeps meaning "never logged"
        let now = self.started.elapsed().as_millis() as u64 + 1;
        let last = subscription.last_error_log.load(Ordering::Relaxed);
        let due = last == 0 || now.saturating_sub(last) >= self.config.error_log_interval_ms;

        if due
            && subscription
                .last_error_log
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            error!(
                "❌ Dispatch of {} on {} failed ({} consecutive): {}",
                key, subscription.connection, failures, error
            );
        } else {
            debug!("Dispatch of {} on {} failed: {}", key, subscription.connection, error);
        }

        if failures > self.config.error_threshold {
            self.suppress(subscription, failures);
        }
    }

    fn suppress(&self, subscription: &Arc<RuntimeSubscription>, failures: u32) {
        let Some(table) = self.table(&subscription.connection) else {
            return;
        };

        let removed = table
            .subscriptions
            .remove_if(&subscription.key, |_, live| live.id == subscription.id)
            .is_some();
        if !removed {
            return;
        }

        table.suppressed.insert(subscription.key.clone());
        self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
        warn!(
            "🚫 Suppressing {} on {} after {} consecutive failures",
            subscription.key, subscription.connection, failures
        );

        if let Some(connection) = self.connections.get(&subscription.connection) {
            let key = subscription.key.to_string();
            self.tracker.spawn_on(
                async move {
                    if let Err(e) = connection.unsubscribe(&key).await {
                        warn!("⚠️ Failed to unsubscribe suppressed key {}: {}", key, e);
                    }
                },
                &self.runtime,
            );
        }
    }

    // ========================================================================
    // Subscription Management
    // ========================================================================

    /// Subscribes every registration that belongs to `connection_name`.
    ///
    /// Individual failures are logged and skipped. Returns the number of
    /// subscriptions that became active.
    pub async fn start_connection(
        self: &Arc<Self>,
        connection_name: &str,
        registrations: &[Registration],
    ) -> Result<usize, DispatchError> {
        let connection = self
            .connections
            .get(connection_name)
            .ok_or_else(|| DispatchError::UnknownConnection(connection_name.to_string()))?;
        self.ensure_table(&connection);

        let mut active = 0;
        for registration in registrations
            .iter()
            .filter(|registration| registration.connection_name() == connection_name)
        {
            match self.subscribe_registration(registration).await {
                Ok(_) => active += 1,
                Err(e) => warn!(
                    "⚠️ Could not subscribe {} to {} on {}: {}",
                    registration.handler_type(),
                    registration.key(),
                    connection_name,
                    e
                ),
            }
        }

        info!("📡 Connection {} started with {} subscription(s)", connection_name, active);
        Ok(active)
    }

    /// Subscribes a single registration, replacing any subscription on the
    /// same key. Also lifts a suppression of that key.
    pub async fn subscribe_registration(
        self: &Arc<Self>,
        registration: &Registration,
    ) -> Result<SubscriptionId, DispatchError> {
        self.marshaller.register_codec(registration.codec());

        self.install(
            registration.connection_name(),
            registration.key(),
            registration.payload_type(),
            Invoker::Handler(registration.binding().clone()),
            registration.mode(),
            registration.poll_interval_ms(),
            ChangeFilter {
                on_change_only: registration.on_change_only(),
                deadband: registration.deadband(),
            },
        )
        .await
    }

    /// Subscribes a callback on demand.
    ///
    /// The callback receives the same typed message a handler would.
    pub async fn subscribe_callback<T, F, Fut>(
        self: &Arc<Self>,
        subscription: Subscribe,
        callback: F,
    ) -> Result<SubscriptionId, DispatchError>
    where
        T: TagValue,
        F: Fn(TagMessage<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.marshaller.register::<T>();

        let callback = Arc::new(callback);
        let erased: Arc<CallbackFn> = Arc::new(move |notification: Notification, payload: TypedPayload, cancel: CancellationToken| {
            let callback = callback.clone();
            async move {
                let degraded = payload.is_degraded();
                let value = payload.downcast::<T>()?;
                let message = TagMessage::from_notification(notification, value, degraded);
                callback(message, cancel)
                    .await
                    .map_err(|source| DispatchError::Handler {
                        handler: "callback",
                        source,
                    })
            }
            .boxed()
        });

        self.install(
            &subscription.connection,
            &subscription.key,
            PayloadType::of::<T>(),
            Invoker::Callback(erased),
            subscription.mode,
            subscription.poll_interval_ms,
            ChangeFilter {
                on_change_only: subscription.on_change_only,
                deadband: subscription.deadband,
            },
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn install(
        self: &Arc<Self>,
        connection_name: &str,
        key: &str,
        payload_type: PayloadType,
        invoker: Invoker,
        mode: SubscriptionMode,
        poll_interval_ms: u64,
        filter: ChangeFilter,
    ) -> Result<SubscriptionId, DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::ShutDown);
        }

        if key.is_empty() || !topic::is_valid_pattern(key) {
            return Err(DispatchError::InvalidKey(key.to_string()));
        }

        let connection = self
            .connections
            .get(connection_name)
            .ok_or_else(|| DispatchError::UnknownConnection(connection_name.to_string()))?;
        let table = self.ensure_table(&connection);

        let id = SubscriptionId::new();
        let poll_interval = self.config.effective_poll_interval(poll_interval_ms);
        let handler = invoker.name();
        let subscription = Arc::new(RuntimeSubscription {
            id,
            connection: Arc::from(connection_name),
            key: CompactString::new(key),
            payload_type,
            invoker,
            mode,
            poll_interval,
            filter,
            is_pattern: topic::has_wildcards(key),
            last_values: DashMap::new(),
            consecutive_failures: AtomicU32::new(0),
            last_error_log: AtomicU64::new(0),
        });

        // live before the transport call so early notifications are not lost
        let previous = table
            .subscriptions
            .insert(subscription.key.clone(), subscription);
        if previous.is_some() {
            debug!("Replacing subscription on {} ({})", key, connection_name);
        }

        if let Err(e) = connection.subscribe(key, mode, poll_interval).await {
            match previous {
                Some(previous) => {
                    if let Some(mut live) = table.subscriptions.get_mut(key) {
                        if live.id == id {
                            *live = previous;
                        }
                    }
                }
                None => {
                    table.subscriptions.remove_if(key, |_, live| live.id == id);
                }
            }
            return Err(DispatchError::Comm(e));
        }
        table.suppressed.remove(key);

        debug!(
            "📡 Subscribed {} to {} on {} ({:?}, {:?})",
            handler, key, connection_name, mode, poll_interval
        );
        Ok(id)
    }

    /// Removes the subscription on `key` and clears any suppression of it.
    ///
    /// Returns `false` when nothing was subscribed. A failing transport
    /// unsubscribe is logged; the local subscription is gone either way.
    pub async fn unsubscribe(&self, connection_name: &str, key: &str) -> Result<bool, DispatchError> {
        let Some(table) = self.table(connection_name) else {
            return Ok(false);
        };

        let was_suppressed = table.suppressed.remove(key).is_some();
        if table.subscriptions.remove(key).is_none() {
            return Ok(was_suppressed);
        }

        if let Some(connection) = self.connections.get(connection_name) {
            if let Err(e) = connection.unsubscribe(key).await {
                warn!("⚠️ Transport unsubscribe of {} on {} failed: {}", key, connection_name, e);
            }
        }
        debug!("Unsubscribed {} on {}", key, connection_name);
        Ok(true)
    }

    /// Drops every subscription of a connection.
    ///
    /// Transport errors are logged; the local state is removed regardless.
    pub async fn teardown_connection(&self, connection_name: &str) -> usize {
        let Some((_, table)) = self.tables.remove(connection_name) else {
            return 0;
        };

        let keys: Vec<CompactString> = table
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        if let Some(connection) = self.connections.get(connection_name) {
            for key in &keys {
                if let Err(e) = connection.unsubscribe(key).await {
                    debug!("Unsubscribe of {} during teardown failed: {}", key, e);
                }
            }
        }

        info!("🧹 Tore down {} subscription(s) on {}", keys.len(), connection_name);
        keys.len()
    }

    /// Re-issues the transport subscriptions of every live subscription on a
    /// connection, after it reconnected.
    pub async fn resubscribe_connection(&self, connection_name: &str) -> Result<usize, DispatchError> {
        let connection = self
            .connections
            .get(connection_name)
            .ok_or_else(|| DispatchError::UnknownConnection(connection_name.to_string()))?;
        let Some(table) = self.table(connection_name) else {
            return Ok(0);
        };

        let live: Vec<Arc<RuntimeSubscription>> = table
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut restored = 0;
        for subscription in live {
            match connection
                .subscribe(&subscription.key, subscription.mode, subscription.poll_interval)
                .await
            {
                Ok(()) => restored += 1,
                Err(e) => warn!("⚠️ Resubscribe of {} on {} failed: {}", subscription.key, connection_name, e),
            }
        }

        info!("🔄 Restored {} subscription(s) on {}", restored, connection_name);
        Ok(restored)
    }

    fn on_fault(self: &Arc<Self>, connection_name: &str, reason: &str) {
        if self.cancel.is_cancelled() {
            return;
        }

        warn!("⚠️ Connection {} faulted: {}", connection_name, reason);

        if !self.reconnecting.insert(connection_name.to_string()) {
            return;
        }

        let Some(connection) = self.connections.get(connection_name) else {
            self.reconnecting.remove(connection_name);
            return;
        };

        let engine = self.clone();
        let name = connection_name.to_string();
        self.tracker.spawn_on(
            async move {
                let policy = engine.config.reconnect.to_policy();
                match connect_with_retry(&connection, policy, &engine.cancel).await {
                    Ok(_) => {
                        if let Err(e) = engine.resubscribe_connection(&name).await {
                            warn!("⚠️ Resubscribe after reconnect of {} failed: {}", name, e);
                        }
                    }
                    Err(e) => debug!("Reconnect of {} abandoned: {}", name, e),
                }
                engine.reconnecting.remove(&name);
            },
            &self.runtime,
        );
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// The state of `key` on a connection.
    pub fn state(&self, connection_name: &str, key: &str) -> SubscriptionState {
        let Some(table) = self.table(connection_name) else {
            return SubscriptionState::Idle;
        };

        if table.subscriptions.contains_key(key) {
            SubscriptionState::Active
        } else if table.suppressed.contains(key) {
            SubscriptionState::Suppressed
        } else {
            SubscriptionState::Idle
        }
    }

    /// Live subscriptions of a connection, ordered by key.
    pub fn subscriptions(&self, connection_name: &str) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = self
            .table(connection_name)
            .map(|table| {
                table
                    .subscriptions
                    .iter()
                    .map(|entry| entry.value().info())
                    .collect()
            })
            .unwrap_or_default();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    pub fn stats(&self) -> DispatchStats {
        let active_subscriptions = self
            .tables
            .iter()
            .map(|table| table.value().subscriptions.len())
            .sum();

        DispatchStats {
            notifications_received: self.counters.received.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            filtered: self.counters.filtered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            suppressed_keys: self.counters.suppressed.load(Ordering::Relaxed),
            active_subscriptions,
            in_flight: self.tracker.len(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops accepting notifications and waits for running handler tasks.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("✅ Dispatch engine stopped");
    }

    /// Waits for running handler tasks up to `timeout`. Returns `true` when
    /// none are left.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.tracker.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn table(&self, connection_name: &str) -> Option<Arc<ConnectionTable>> {
        self.tables
            .get(connection_name)
            .map(|entry| entry.value().clone())
    }

    /// Returns the table of a connection, creating it and installing the
    /// engine as the connection's notification sink on first use.
    fn ensure_table(self: &Arc<Self>, connection: &Arc<dyn Connection>) -> Arc<ConnectionTable> {
        match self.tables.entry(connection.name().to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                connection.set_notification_sink(Arc::new(EngineSink {
                    engine: Arc::downgrade(self),
                    connection: Arc::from(connection.name()),
                }));
                entry.insert(Arc::new(ConnectionTable::default())).clone()
            }
        }
    }
}

/// Sink installed on every connection the engine subscribes through.
struct EngineSink {
    engine: Weak<DispatchEngine>,
    connection: Arc<str>,
}

impl NotificationSink for EngineSink {
    fn on_changed(&self, key: &str, raw: RawValue, quality: Quality) {
        if let Some(engine) = self.engine.upgrade() {
            engine.on_changed(&self.connection, key, raw, quality);
        }
    }

    fn on_fault(&self, reason: &str) {
        if let Some(engine) = self.engine.upgrade() {
            engine.on_fault(&self.connection, reason);
        }
    }
}
