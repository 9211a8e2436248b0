//! # Handler Contracts
//!
//! User code implements [`MessageHandler`] to react to change notifications
//! and [`EventHandler`] to serve on-demand events. The bindings in this
//! module capture the concrete handler and payload types at registration time
//! and erase them, so the dispatch engine and the mediator can invoke any
//! handler through a uniform, type-erased call.

use crate::error::{ActivationError, DispatchError, HandlerError, MediatorError};
use crate::marshal::{PayloadType, TagValue, TypedPayload};
use crate::mediator::ReadResult;
use crate::types::{HandlerType, Quality, RawValue};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::{Any, TypeId};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type Instance = Arc<dyn Any + Send + Sync>;

// ============================================================================
// Change Notifications
// ============================================================================

/// A change notification, before the payload is typed.
#[derive(Debug, Clone)]
pub struct Notification {
    pub connection: Arc<str>,
    pub key: Arc<str>,
    pub raw: RawValue,
    pub quality: Quality,
    pub timestamp_ms: u64,
    /// Last delivered value of the key, when change filtering keeps one
    pub previous: Option<RawValue>,
}

/// The typed message handed to a [`MessageHandler`].
#[derive(Debug, Clone)]
pub struct TagMessage<T> {
    /// Name of the connection that raised the notification
    pub connection: Arc<str>,
    /// Concrete key, even when the subscription is a wildcard pattern
    pub key: Arc<str>,
    pub value: T,
    /// The untyped value as observed on the wire
    pub raw: RawValue,
    pub quality: Quality,
    pub timestamp_ms: u64,
    pub previous: Option<RawValue>,
    /// True when `value` is a fallback default because conversion failed
    pub degraded: bool,
}

impl<T> TagMessage<T> {
    pub(crate) fn from_notification(notification: Notification, value: T, degraded: bool) -> Self {
        Self {
            connection: notification.connection,
            key: notification.key,
            value,
            raw: notification.raw,
            quality: notification.quality,
            timestamp_ms: notification.timestamp_ms,
            previous: notification.previous,
            degraded,
        }
    }

    pub fn is_good(&self) -> bool {
        self.quality.is_good() && !self.degraded
    }
}

/// Reacts to change notifications of payload type `T`.
///
/// # Examples
///
/// ```rust
/// use edge_dispatch::{async_trait, CancellationToken, HandlerError, MessageHandler, TagMessage};
///
/// #[derive(Default)]
/// struct TemperatureAlarm;
///
/// #[async_trait]
/// impl MessageHandler<f64> for TemperatureAlarm {
///     async fn handle(
///         &self,
///         message: TagMessage<f64>,
///         _cancel: CancellationToken,
///     ) -> Result<(), HandlerError> {
///         if message.value > 90.0 {
///             return Err(HandlerError::msg("over temperature"));
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler<T: TagValue>: Send + Sync + 'static {
    async fn handle(&self, message: TagMessage<T>, cancel: CancellationToken)
        -> Result<(), HandlerError>;
}

type MessageInvoker = dyn Fn(Instance, Notification, TypedPayload, CancellationToken) -> BoxFuture<'static, Result<(), DispatchError>>
    + Send
    + Sync;

/// Type-erased call into a `MessageHandler<T>` implementation.
#[derive(Clone)]
pub struct MessageBinding {
    handler_type: HandlerType,
    payload_type: PayloadType,
    invoker: Arc<MessageInvoker>,
}

impl MessageBinding {
    pub fn of<H, T>() -> Self
    where
        H: MessageHandler<T>,
        T: TagValue,
    {
        let invoker = |instance: Instance,
                       notification: Notification,
                       payload: TypedPayload,
                       cancel: CancellationToken| {
            async move {
                let handler_name = std::any::type_name::<H>();
                let handler = instance.downcast::<H>().map_err(|_| {
                    DispatchError::Activation(ActivationError::InstanceTypeMismatch {
                        handler: handler_name,
                    })
                })?;

                let degraded = payload.is_degraded();
                let value = payload.downcast::<T>()?;
                let message = TagMessage::from_notification(notification, value, degraded);

                handler
                    .handle(message, cancel)
                    .await
                    .map_err(|source| DispatchError::Handler {
                        handler: handler_name,
                        source,
                    })
            }
            .boxed()
        };

        Self {
            handler_type: HandlerType::of::<H>(),
            payload_type: PayloadType::of::<T>(),
            invoker: Arc::new(invoker),
        }
    }

    pub fn handler_type(&self) -> HandlerType {
        self.handler_type
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    pub fn invoke(
        &self,
        instance: Instance,
        notification: Notification,
        payload: TypedPayload,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<(), DispatchError>> {
        (self.invoker)(instance, notification, payload, cancel)
    }
}

impl std::fmt::Debug for MessageBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBinding")
            .field("handler_type", &self.handler_type)
            .field("payload_type", &self.payload_type)
            .finish()
    }
}

// ============================================================================
// On-Demand Events
// ============================================================================

/// Everything an event handler receives besides the cancellation token.
#[derive(Debug)]
pub struct EventContext<E> {
    pub event_name: Arc<str>,
    pub data: Arc<E>,
    /// Values fetched by the registration's pre-reads, keyed by alias
    pub reads: Arc<ReadResult>,
}

/// Serves an on-demand event carrying data of type `E`.
///
/// Handlers without a result use `type Output = ()`.
#[async_trait]
pub trait EventHandler<E: Send + Sync + 'static>: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn handle(
        &self,
        context: EventContext<E>,
        cancel: CancellationToken,
    ) -> Result<Self::Output, HandlerError>;
}

type EventOutput = Box<dyn Any + Send>;

type EventInvoker = dyn Fn(Instance, Arc<str>, Arc<dyn Any + Send + Sync>, Arc<ReadResult>, CancellationToken) -> BoxFuture<'static, Result<EventOutput, MediatorError>>
    + Send
    + Sync;

/// Type-erased call into an `EventHandler<E>` implementation.
#[derive(Clone)]
pub struct EventBinding {
    handler_type: HandlerType,
    data_type: TypeId,
    data_type_name: &'static str,
    result_type: Option<(TypeId, &'static str)>,
    invoker: Arc<EventInvoker>,
}

impl EventBinding {
    pub fn of<H, E>() -> Self
    where
        H: EventHandler<E>,
        E: Send + Sync + 'static,
    {
        let invoker = |instance: Instance,
                       event_name: Arc<str>,
                       data: Arc<dyn Any + Send + Sync>,
                       reads: Arc<ReadResult>,
                       cancel: CancellationToken| {
            async move {
                let handler_name = std::any::type_name::<H>();
                let handler = instance.downcast::<H>().map_err(|_| {
                    MediatorError::Activation(ActivationError::InstanceTypeMismatch {
                        handler: handler_name,
                    })
                })?;
                let data = data.downcast::<E>().map_err(|_| MediatorError::DataTypeMismatch {
                    event: event_name.to_string(),
                    expected: std::any::type_name::<E>(),
                })?;

                let context = EventContext {
                    event_name: event_name.clone(),
                    data,
                    reads,
                };

                match handler.handle(context, cancel).await {
                    Ok(output) => Ok(Box::new(output) as EventOutput),
                    Err(source) => Err(MediatorError::Handler {
                        event: event_name.to_string(),
                        handler: handler_name,
                        source,
                    }),
                }
            }
            .boxed()
        };

        let result_type = (TypeId::of::<H::Output>() != TypeId::of::<()>())
            .then(|| (TypeId::of::<H::Output>(), std::any::type_name::<H::Output>()));

        Self {
            handler_type: HandlerType::of::<H>(),
            data_type: TypeId::of::<E>(),
            data_type_name: std::any::type_name::<E>(),
            result_type,
            invoker: Arc::new(invoker),
        }
    }

    pub fn handler_type(&self) -> HandlerType {
        self.handler_type
    }

    pub fn data_type(&self) -> TypeId {
        self.data_type
    }

    pub fn data_type_name(&self) -> &'static str {
        self.data_type_name
    }

    /// The declared result type, `None` for handlers returning `()`.
    pub fn result_type(&self) -> Option<(TypeId, &'static str)> {
        self.result_type
    }

    pub fn invoke(
        &self,
        instance: Instance,
        event_name: Arc<str>,
        data: Arc<dyn Any + Send + Sync>,
        reads: Arc<ReadResult>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<EventOutput, MediatorError>> {
        (self.invoker)(instance, event_name, data, reads, cancel)
    }
}

impl std::fmt::Debug for EventBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBinding")
            .field("handler_type", &self.handler_type)
            .field("data_type", &crate::utils::short_type_name(self.data_type_name))
            .field("result_type", &self.result_type.map(|(_, name)| name))
            .finish()
    }
}
