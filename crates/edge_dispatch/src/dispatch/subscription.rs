//! Live subscription state.

use super::filter::ChangeFilter;
use crate::error::DispatchError;
use crate::handler::{MessageBinding, Notification};
use crate::marshal::{PayloadType, TypedPayload};
use crate::topic;
use crate::types::{RawValue, SubscriptionId, SubscriptionMode};
use compact_str::CompactString;
use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) type CallbackFn = dyn Fn(Notification, TypedPayload, CancellationToken) -> BoxFuture<'static, Result<(), DispatchError>>
    + Send
    + Sync;

/// What a subscription calls when a notification is delivered.
#[derive(Clone)]
pub(crate) enum Invoker {
    /// A discovered handler type, activated per invocation
    Handler(MessageBinding),
    /// A directly supplied callback
    Callback(Arc<CallbackFn>),
}

impl Invoker {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Invoker::Handler(binding) => binding.handler_type().name(),
            Invoker::Callback(_) => "callback",
        }
    }
}

/// Runtime state of one subscribed key (or pattern) on one connection.
pub(crate) struct RuntimeSubscription {
    pub id: SubscriptionId,
    pub connection: Arc<str>,
    pub key: CompactString,
    pub payload_type: PayloadType,
    pub invoker: Invoker,
    pub mode: SubscriptionMode,
    pub poll_interval: Duration,
    pub filter: ChangeFilter,
    pub is_pattern: bool,
    /// Last good value per concrete key. Pattern subscriptions add one entry
    /// per distinct matched key, bounded by [`filter::MAX_CACHED_KEYS`]; the
    /// cache is dropped with the subscription.
    ///
    /// [`filter::MAX_CACHED_KEYS`]: super::filter::MAX_CACHED_KEYS
    pub last_values: DashMap<CompactString, RawValue>,
    pub consecutive_failures: AtomicU32,
    /// Milliseconds since engine start of the last failure log, `0` for never
    pub last_error_log: AtomicU64,
}

impl RuntimeSubscription {
    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id,
            connection: self.connection.to_string(),
            key: self.key.to_string(),
            handler: self.invoker.name().to_string(),
            payload_type: self.payload_type.to_string(),
            mode: self.mode,
            poll_interval_ms: self.poll_interval.as_millis() as u64,
            on_change_only: self.filter.on_change_only,
            deadband: self.filter.deadband,
            is_pattern: self.is_pattern,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

/// Per-connection subscription table.
#[derive(Default)]
pub(crate) struct ConnectionTable {
    pub subscriptions: DashMap<CompactString, Arc<RuntimeSubscription>>,
    pub suppressed: DashSet<CompactString>,
}

impl ConnectionTable {
    /// Subscriptions that should see a notification for `key`.
    ///
    /// An exact subscription wins; otherwise every matching pattern does.
    pub fn lookup(&self, key: &str) -> Vec<Arc<RuntimeSubscription>> {
        if let Some(exact) = self.subscriptions.get(key) {
            return vec![exact.value().clone()];
        }

        self.subscriptions
            .iter()
            .filter(|entry| entry.value().is_pattern && topic::matches(entry.key(), key))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// Serializable view of a live subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub connection: String,
    pub key: String,
    pub handler: String,
    pub payload_type: String,
    pub mode: SubscriptionMode,
    pub poll_interval_ms: u64,
    pub on_change_only: bool,
    pub deadband: f64,
    pub is_pattern: bool,
    pub consecutive_failures: u32,
}
