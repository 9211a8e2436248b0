//! Transport contracts.
//!
//! Controllers and brokers live behind these traits. The dispatch core never
//! talks a wire protocol itself: it reads, writes and subscribes through a
//! [`Connection`], receives change notifications through a
//! [`NotificationSink`] and publishes through a [`Publisher`].

use crate::error::CommError;
use crate::marshal::PayloadType;
use crate::types::{DeliverySemantics, Quality, RawValue, ReadValue, SubscriptionMode};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A live link to one controller or broker.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Unique name of the connection within the connection set.
    fn name(&self) -> &str;

    /// Transport kind, for example `"plc"` or `"mqtt"`.
    fn kind(&self) -> &str;

    async fn connect(&self) -> Result<(), CommError>;

    async fn disconnect(&self) -> Result<(), CommError>;

    fn is_connected(&self) -> bool;

    /// Reads the current value of a key.
    ///
    /// `value_type` is a hint for transports that need to know the expected
    /// layout before reading (structured controller tags).
    async fn read_once(
        &self,
        key: &str,
        value_type: Option<PayloadType>,
    ) -> Result<ReadValue, CommError>;

    async fn write_once(&self, key: &str, value: RawValue) -> Result<(), CommError>;

    /// Registers interest in a key or wildcard pattern.
    async fn subscribe(
        &self,
        key: &str,
        mode: SubscriptionMode,
        poll_interval: Duration,
    ) -> Result<(), CommError>;

    async fn unsubscribe(&self, key: &str) -> Result<(), CommError>;

    /// Installs the sink that receives change notifications and faults.
    fn set_notification_sink(&self, sink: Arc<dyn NotificationSink>);

    /// The publishing side of the connection, if it has one.
    fn publisher(&self) -> Option<Arc<dyn Publisher>> {
        None
    }
}

/// Receiver of change notifications raised by a connection.
///
/// Called from transport threads; implementations must not block.
pub trait NotificationSink: Send + Sync {
    fn on_changed(&self, key: &str, raw: RawValue, quality: Quality);

    /// The connection was lost and needs to be re-established.
    fn on_fault(&self, _reason: &str) {}
}

/// Outbound message publishing.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn kind(&self) -> &str;

    async fn publish(
        &self,
        destination: &str,
        payload: Vec<u8>,
        semantics: DeliverySemantics,
    ) -> Result<(), CommError>;

    /// Publishes a raw value as a JSON document.
    async fn publish_value(
        &self,
        destination: &str,
        value: &RawValue,
        semantics: DeliverySemantics,
    ) -> Result<(), CommError> {
        let payload =
            serde_json::to_vec(&value.to_json()).map_err(|e| CommError::PublishFailed {
                destination: destination.to_string(),
                reason: e.to_string(),
            })?;
        self.publish(destination, payload, semantics).await
    }
}
