//! # Change-Tracking Reads
//!
//! [`ReadTracker`] performs one-shot reads through the live connections and
//! remembers the last good value per connection and key, so callers polling a
//! value can tell first reads and changes apart without a subscription.

use crate::error::CommError;
use crate::marshal::{Decoded, PayloadType, TagValue, ValueMarshaller};
use crate::transport::ConnectionSet;
use crate::types::{Quality, RawValue};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

/// The outcome of one tracked read.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedRead {
    pub value: RawValue,
    pub quality: Quality,
    pub timestamp_ms: u64,
    /// No good value was recorded for the key before this read
    pub is_initial_read: bool,
    /// The value differs from the previously recorded one
    pub has_changed: bool,
    pub previous_value: Option<RawValue>,
}

impl TrackedRead {
    /// Typed view of the value, with the usual default fallback.
    pub fn value_as<T: TagValue>(&self) -> Decoded<T> {
        ValueMarshaller::decode::<T>(&self.value)
    }
}

/// Read-once helper with per-key change bookkeeping.
pub struct ReadTracker {
    connections: Arc<ConnectionSet>,
    last: DashMap<(String, String), RawValue>,
}

impl ReadTracker {
    pub fn new(connections: Arc<ConnectionSet>) -> Self {
        Self {
            connections,
            last: DashMap::new(),
        }
    }

    /// Reads `key` once and compares it with the last good reading.
    ///
    /// Readings of non-good quality are returned but not recorded.
    pub async fn read(
        &self,
        connection: &str,
        key: &str,
        value_type: Option<PayloadType>,
    ) -> Result<TrackedRead, CommError> {
        let link = self
            .connections
            .get(connection)
            .ok_or_else(|| CommError::UnknownConnection(connection.to_string()))?;

        let reading = link.read_once(key, value_type).await?;
        let slot = (connection.to_string(), key.to_string());

        let previous_value = if reading.quality.is_good() {
            self.last.insert(slot, reading.value.clone())
        } else {
            self.last.get(&slot).map(|entry| entry.value().clone())
        };

        let is_initial_read = previous_value.is_none();
        let has_changed = reading.quality.is_good()
            && previous_value
                .as_ref()
                .is_some_and(|previous| *previous != reading.value);

        trace!(
            "Tracked read {} on {}: initial={} changed={}",
            key,
            connection,
            is_initial_read,
            has_changed
        );

        Ok(TrackedRead {
            value: reading.value,
            quality: reading.quality,
            timestamp_ms: reading.timestamp_ms,
            is_initial_read,
            has_changed,
            previous_value,
        })
    }

    /// Forgets the recorded value of a key.
    pub fn reset(&self, connection: &str, key: &str) -> bool {
        self.last
            .remove(&(connection.to_string(), key.to_string()))
            .is_some()
    }

    pub fn tracked_keys(&self) -> usize {
        self.last.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connection, MemoryConnection};

    async fn tracker_with_plc() -> (ReadTracker, Arc<MemoryConnection>) {
        let plc = Arc::new(MemoryConnection::new("plc1", "plc"));
        plc.connect().await.unwrap();
        let connections = Arc::new(ConnectionSet::new());
        connections.insert(plc.clone());
        (ReadTracker::new(connections), plc)
    }

    #[tokio::test]
    async fn test_first_read_then_change() {
        let (tracker, plc) = tracker_with_plc().await;

        plc.seed_value("Temp", 21.5);
        let first = tracker.read("plc1", "Temp", None).await.unwrap();
        assert!(first.is_initial_read);
        assert!(!first.has_changed);
        assert_eq!(first.previous_value, None);

        plc.seed_value("Temp", 22.0);
        let second = tracker.read("plc1", "Temp", None).await.unwrap();
        assert!(!second.is_initial_read);
        assert!(second.has_changed);
        assert_eq!(second.previous_value, Some(RawValue::Float(21.5)));
        assert_eq!(second.value_as::<f64>().value, 22.0);

        let third = tracker.read("plc1", "Temp", None).await.unwrap();
        assert!(!third.has_changed);
    }

    #[tokio::test]
    async fn test_read_errors_propagate() {
        let (tracker, plc) = tracker_with_plc().await;

        assert!(matches!(
            tracker.read("plc9", "Temp", None).await,
            Err(CommError::UnknownConnection(_))
        ));

        plc.fail_reads("Temp", "timeout");
        assert!(matches!(
            tracker.read("plc1", "Temp", None).await,
            Err(CommError::ReadFailed { .. })
        ));
        assert_eq!(tracker.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_reset_makes_next_read_initial() {
        let (tracker, plc) = tracker_with_plc().await;
        plc.seed_value("Count", 3i32);

        tracker.read("plc1", "Count", None).await.unwrap();
        assert!(tracker.reset("plc1", "Count"));

        let again = tracker.read("plc1", "Count", None).await.unwrap();
        assert!(again.is_initial_read);
    }
}
