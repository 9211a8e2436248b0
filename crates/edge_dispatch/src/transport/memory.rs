//! In-memory transport.
//!
//! [`MemoryConnection`] keeps a value table and pushes a notification to its
//! sink whenever a subscribed key (or a key matched by a subscribed pattern)
//! changes. It backs the unit tests and the simulated connections of the host
//! process. Failures can be scripted: refused connects, failing reads and
//! connection faults.

use super::connection::{Connection, NotificationSink, Publisher};
use crate::error::CommError;
use crate::marshal::PayloadType;
use crate::topic;
use crate::types::{DeliverySemantics, Quality, RawValue, ReadValue, SubscriptionMode};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Parameters of one active subscription on a memory connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySubscription {
    pub mode: SubscriptionMode,
    pub poll_interval: Duration,
}

/// In-memory controller or broker.
pub struct MemoryConnection {
    name: String,
    kind: String,
    values: DashMap<String, ReadValue>,
    subscriptions: DashMap<String, MemorySubscription>,
    sink: ArcSwapOption<SinkSlot>,
    connected: AtomicBool,
    refused_connects: AtomicU32,
    connect_attempts: AtomicU32,
    failing_reads: DashMap<String, String>,
    writes: Mutex<Vec<(String, RawValue)>>,
    publisher: Option<Arc<MemoryPublisher>>,
}

// ArcSwapOption needs a sized payload
struct SinkSlot(Arc<dyn NotificationSink>);

impl MemoryConnection {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            values: DashMap::new(),
            subscriptions: DashMap::new(),
            sink: ArcSwapOption::empty(),
            connected: AtomicBool::new(false),
            refused_connects: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            failing_reads: DashMap::new(),
            writes: Mutex::new(Vec::new()),
            publisher: None,
        }
    }

    /// Adds a publishing side of the given kind.
    pub fn with_publisher(mut self, kind: impl Into<String>) -> Self {
        self.publisher = Some(Arc::new(MemoryPublisher::new(kind)));
        self
    }

    pub fn memory_publisher(&self) -> Option<Arc<MemoryPublisher>> {
        self.publisher.clone()
    }

    /// Sets a good-quality value and notifies matching subscriptions.
    pub fn set_value(&self, key: &str, value: impl Into<RawValue>) {
        self.set_value_with_quality(key, value, Quality::Good);
    }

    /// Sets a value with explicit quality and notifies matching subscriptions.
    pub fn set_value_with_quality(&self, key: &str, value: impl Into<RawValue>, quality: Quality) {
        let read = ReadValue::with_quality(value, quality);
        let raw = read.value.clone();
        self.values.insert(key.to_string(), read);
        self.notify(key, raw, quality);
    }

    /// Stores a value without notifying anyone.
    pub fn seed_value(&self, key: &str, value: impl Into<RawValue>) {
        self.values.insert(key.to_string(), ReadValue::good(value));
    }

    pub fn value(&self, key: &str) -> Option<RawValue> {
        self.values.get(key).map(|entry| entry.value.clone())
    }

    /// Makes the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.refused_connects.store(count, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Makes reads of `key` fail until [`clear_read_failure`](Self::clear_read_failure).
    pub fn fail_reads(&self, key: &str, reason: impl Into<String>) {
        self.failing_reads.insert(key.to_string(), reason.into());
    }

    pub fn clear_read_failure(&self, key: &str) {
        self.failing_reads.remove(key);
    }

    /// Drops the link, forgets its subscriptions and reports the fault to
    /// the sink.
    pub fn inject_fault(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.subscriptions.clear();
        if let Some(slot) = self.sink.load_full() {
            slot.0.on_fault(reason);
        }
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        self.subscriptions.contains_key(key)
    }

    pub fn subscription(&self, key: &str) -> Option<MemorySubscription> {
        self.subscriptions.get(key).map(|entry| *entry)
    }

    pub fn subscribed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Every successful `write_once`, in order.
    pub fn writes(&self) -> Vec<(String, RawValue)> {
        self.writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn notify(&self, key: &str, raw: RawValue, quality: Quality) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }

        let subscribed = self
            .subscriptions
            .iter()
            .any(|entry| entry.key() == key || topic::matches(entry.key(), key));
        if !subscribed {
            return;
        }

        if let Some(slot) = self.sink.load_full() {
            slot.0.on_changed(key, raw, quality);
        }
    }

    fn ensure_connected(&self) -> Result<(), CommError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CommError::NotConnected(self.name.clone()))
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    async fn connect(&self) -> Result<(), CommError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refused_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if refused {
            return Err(CommError::ConnectFailed {
                connection: self.name.clone(),
                reason: "connection refused".to_string(),
            });
        }

        self.connected.store(true, Ordering::SeqCst);
        debug!("🔌 Memory connection {} connected", self.name);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CommError> {
        self.connected.store(false, Ordering::SeqCst);
        self.subscriptions.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read_once(
        &self,
        key: &str,
        _value_type: Option<PayloadType>,
    ) -> Result<ReadValue, CommError> {
        self.ensure_connected()?;

        if let Some(reason) = self.failing_reads.get(key) {
            return Err(CommError::ReadFailed {
                key: key.to_string(),
                reason: reason.value().clone(),
            });
        }

        self.values
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CommError::UnknownKey {
                connection: self.name.clone(),
                key: key.to_string(),
            })
    }

    async fn write_once(&self, key: &str, value: RawValue) -> Result<(), CommError> {
        self.ensure_connected()?;
        self.writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((key.to_string(), value.clone()));
        self.set_value(key, value);
        Ok(())
    }

    async fn subscribe(
        &self,
        key: &str,
        mode: SubscriptionMode,
        poll_interval: Duration,
    ) -> Result<(), CommError> {
        self.ensure_connected()?;
        self.subscriptions.insert(
            key.to_string(),
            MemorySubscription {
                mode,
                poll_interval,
            },
        );
        Ok(())
    }

    async fn unsubscribe(&self, key: &str) -> Result<(), CommError> {
        self.ensure_connected()?;
        self.subscriptions.remove(key);
        Ok(())
    }

    fn set_notification_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.sink.store(Some(Arc::new(SinkSlot(sink))));
    }

    fn publisher(&self) -> Option<Arc<dyn Publisher>> {
        self.publisher
            .clone()
            .map(|publisher| publisher as Arc<dyn Publisher>)
    }
}

/// One message recorded by a [`MemoryPublisher`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub destination: String,
    pub payload: Vec<u8>,
    pub semantics: DeliverySemantics,
}

/// Publisher that records every message.
pub struct MemoryPublisher {
    kind: String,
    messages: Mutex<Vec<PublishedMessage>>,
}

impl MemoryPublisher {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn publish(
        &self,
        destination: &str,
        payload: Vec<u8>,
        semantics: DeliverySemantics,
    ) -> Result<(), CommError> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(PublishedMessage {
                destination: destination.to_string(),
                payload,
                semantics,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, RawValue, Quality)>>,
        faults: Mutex<Vec<String>>,
    }

    impl NotificationSink for Recorder {
        fn on_changed(&self, key: &str, raw: RawValue, quality: Quality) {
            self.seen.lock().unwrap().push((key.to_string(), raw, quality));
        }

        fn on_fault(&self, reason: &str) {
            self.faults.lock().unwrap().push(reason.to_string());
        }
    }

    #[tokio::test]
    async fn test_notifies_exact_and_pattern_subscriptions() {
        let connection = MemoryConnection::new("broker", "mqtt");
        let recorder = Arc::new(Recorder::default());
        connection.set_notification_sink(recorder.clone());
        connection.connect().await.unwrap();
        connection
            .subscribe("plant/+/temp", SubscriptionMode::Unsolicited, Duration::ZERO)
            .await
            .unwrap();

        connection.set_value("plant/line1/temp", 21.5);
        connection.set_value("plant/line1/pressure", 3.0);

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "plant/line1/temp");
        assert_eq!(seen[0].1, RawValue::Float(21.5));
    }

    #[tokio::test]
    async fn test_read_failures() {
        let connection = MemoryConnection::new("plc1", "plc");
        assert!(matches!(
            connection.read_once("Tag", None).await,
            Err(CommError::NotConnected(_))
        ));

        connection.connect().await.unwrap();
        assert!(matches!(
            connection.read_once("Tag", None).await,
            Err(CommError::UnknownKey { .. })
        ));

        connection.seed_value("Tag", 5);
        connection.fail_reads("Tag", "timeout");
        assert!(matches!(
            connection.read_once("Tag", None).await,
            Err(CommError::ReadFailed { .. })
        ));

        connection.clear_read_failure("Tag");
        let read = connection.read_once("Tag", None).await.unwrap();
        assert_eq!(read.value, RawValue::Int(5));
    }

    #[tokio::test]
    async fn test_fault_reaches_sink() {
        let connection = MemoryConnection::new("plc1", "plc");
        let recorder = Arc::new(Recorder::default());
        connection.set_notification_sink(recorder.clone());
        connection.connect().await.unwrap();

        connection.inject_fault("cable unplugged");

        assert!(!connection.is_connected());
        assert_eq!(recorder.faults.lock().unwrap().as_slice(), ["cable unplugged"]);
    }

    #[tokio::test]
    async fn test_publisher_records_json() {
        let connection = MemoryConnection::new("broker", "mqtt").with_publisher("mqtt");
        let publisher = connection.publisher().unwrap();

        publisher
            .publish_value("line1/status", &RawValue::Bool(true), DeliverySemantics::AtLeastOnce)
            .await
            .unwrap();

        let messages = connection.memory_publisher().unwrap().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"true".to_vec());
    }
}
