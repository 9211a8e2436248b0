//! # Handler Discovery
//!
//! Handler types describe themselves with a [`HandlerDeclaration`]: whether
//! they implement the message-handler capability, which payload type they
//! take and which keys they subscribe to. [`discover`] turns a set of
//! declarations into immutable [`Registration`] records, one per subscription.
//!
//! Discovery is pure and deterministic: output order follows input order and
//! then subscription declaration order.
//!
//! ```rust
//! use edge_dispatch::{async_trait, discover, CancellationToken, HandlerDeclaration,
//!     HandlerError, MessageHandler, Subscribe, TagMessage};
//!
//! #[derive(Default)]
//! struct Counter;
//!
//! #[async_trait]
//! impl MessageHandler<i32> for Counter {
//!     async fn handle(&self, _m: TagMessage<i32>, _c: CancellationToken) -> Result<(), HandlerError> {
//!         Ok(())
//!     }
//! }
//!
//! let declarations = vec![HandlerDeclaration::message_handler::<Counter, i32>()
//!     .subscribe(Subscribe::new("plc1", "Program:Main.Count"))
//!     .subscribe(Subscribe::new("plc1", "Program:Main.Rejects").deadband(2.0))];
//!
//! let registrations = discover(&declarations);
//! assert_eq!(registrations.len(), 2);
//! assert_eq!(registrations[1].key(), "Program:Main.Rejects");
//! ```

use crate::error::DiscoveryError;
use crate::handler::{EventBinding, EventHandler, MessageBinding, MessageHandler};
use crate::marshal::{PayloadCodec, PayloadType, TagValue};
use crate::mediator::EventRegistration;
use crate::types::{HandlerType, SubscriptionMode};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Subscription Declarations
// ============================================================================

/// One subscription declared by a handler type.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub connection: String,
    pub key: String,
    /// `0` uses the connection default
    pub poll_interval_ms: u64,
    pub on_change_only: bool,
    pub deadband: f64,
    pub mode: SubscriptionMode,
}

impl Subscribe {
    pub fn new(connection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            key: key.into(),
            poll_interval_ms: 0,
            on_change_only: true,
            deadband: 0.0,
            mode: SubscriptionMode::Polling,
        }
    }

    pub fn poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    pub fn on_change_only(mut self, enabled: bool) -> Self {
        self.on_change_only = enabled;
        self
    }

    /// Absolute numeric change below which a notification is suppressed.
    pub fn deadband(mut self, deadband: f64) -> Self {
        self.deadband = deadband;
        self
    }

    pub fn mode(mut self, mode: SubscriptionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn unsolicited(self) -> Self {
        self.mode(SubscriptionMode::Unsolicited)
    }
}

#[derive(Debug, Clone)]
struct MessageCapability {
    typed: Option<(MessageBinding, PayloadCodec)>,
}

/// Metadata a handler type declares about itself.
#[derive(Debug, Clone)]
pub struct HandlerDeclaration {
    handler_type: HandlerType,
    capability: Option<MessageCapability>,
    subscriptions: Vec<Subscribe>,
    disabled: bool,
}

impl HandlerDeclaration {
    /// A message handler for payload type `T`.
    pub fn message_handler<H, T>() -> Self
    where
        H: MessageHandler<T>,
        T: TagValue,
    {
        Self {
            handler_type: HandlerType::of::<H>(),
            capability: Some(MessageCapability {
                typed: Some((MessageBinding::of::<H, T>(), PayloadCodec::of::<T>())),
            }),
            subscriptions: Vec::new(),
            disabled: false,
        }
    }

    /// A type that claims the message-handler capability without naming its
    /// payload type.
    pub fn untyped_message_handler<H: 'static>() -> Self {
        Self {
            handler_type: HandlerType::of::<H>(),
            capability: Some(MessageCapability { typed: None }),
            subscriptions: Vec::new(),
            disabled: false,
        }
    }

    /// A type without the message-handler capability.
    pub fn plain<H: 'static>() -> Self {
        Self {
            handler_type: HandlerType::of::<H>(),
            capability: None,
            subscriptions: Vec::new(),
            disabled: false,
        }
    }

    pub fn subscribe(mut self, subscription: Subscribe) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    /// Excludes the handler from discovery.
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn handler_type(&self) -> HandlerType {
        self.handler_type
    }

    pub fn subscriptions(&self) -> &[Subscribe] {
        &self.subscriptions
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// The payload codec, when the declaration names a payload type.
    pub fn payload_codec(&self) -> Option<PayloadCodec> {
        self.capability
            .as_ref()
            .and_then(|capability| capability.typed.as_ref())
            .map(|(_, codec)| *codec)
    }
}

/// Implemented by handler types that carry their own declaration.
pub trait DeclaredHandler {
    fn declare() -> HandlerDeclaration;
}

/// Builds a declaration list from types implementing [`DeclaredHandler`].
#[macro_export]
macro_rules! declarations {
    ($($handler:ty),* $(,)?) => {
        vec![$(<$handler as $crate::discovery::DeclaredHandler>::declare()),*]
    };
}

// ============================================================================
// Registrations
// ============================================================================

/// An immutable binding of one key on one connection to one handler type.
#[derive(Debug, Clone)]
pub struct Registration {
    key: Arc<str>,
    connection_name: Arc<str>,
    handler_type: HandlerType,
    payload_type: PayloadType,
    poll_interval_ms: u64,
    on_change_only: bool,
    deadband: f64,
    mode: SubscriptionMode,
    binding: MessageBinding,
    codec: PayloadCodec,
}

impl Registration {
    fn from_parts(subscription: &Subscribe, binding: &MessageBinding, codec: PayloadCodec) -> Self {
        Self {
            key: Arc::from(subscription.key.as_str()),
            connection_name: Arc::from(subscription.connection.as_str()),
            handler_type: binding.handler_type(),
            payload_type: binding.payload_type(),
            poll_interval_ms: subscription.poll_interval_ms,
            on_change_only: subscription.on_change_only,
            deadband: subscription.deadband,
            mode: subscription.mode,
            binding: binding.clone(),
            codec,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    pub fn handler_type(&self) -> HandlerType {
        self.handler_type
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms
    }

    pub fn on_change_only(&self) -> bool {
        self.on_change_only
    }

    pub fn deadband(&self) -> f64 {
        self.deadband
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    pub fn binding(&self) -> &MessageBinding {
        &self.binding
    }

    pub fn codec(&self) -> PayloadCodec {
        self.codec
    }
}

/// Scans declarations and produces one registration per subscription.
///
/// Declarations without the capability, without subscriptions, disabled or
/// without an extractable payload type are skipped.
pub fn discover(declarations: &[HandlerDeclaration]) -> Vec<Registration> {
    let mut registrations = Vec::new();

    for declaration in declarations {
        match register_single(declaration) {
            Ok(mut found) => registrations.append(&mut found),
            Err(e) => debug!("🔍 Skipping {}: {}", declaration.handler_type, e),
        }
    }

    registrations
}

/// Explicit registration of a single handler declaration.
pub fn register_single(declaration: &HandlerDeclaration) -> Result<Vec<Registration>, DiscoveryError> {
    let handler = declaration.handler_type.name();

    let capability = declaration
        .capability
        .as_ref()
        .ok_or(DiscoveryError::MissingCapability { handler })?;

    let (binding, codec) = capability
        .typed
        .as_ref()
        .ok_or(DiscoveryError::MissingPayloadType { handler })?;

    if declaration.disabled {
        return Err(DiscoveryError::Disabled { handler });
    }

    if declaration.subscriptions.is_empty() {
        return Err(DiscoveryError::NoSubscriptions { handler });
    }

    Ok(declaration
        .subscriptions
        .iter()
        .map(|subscription| Registration::from_parts(subscription, binding, *codec))
        .collect())
}

// ============================================================================
// Event Declarations
// ============================================================================

/// A value to fetch before an event handler runs.
#[derive(Debug, Clone, PartialEq)]
pub struct PreRead {
    pub connection: String,
    pub key: String,
    pub value_type: Option<PayloadType>,
    /// Name under which the value appears in the handler's read result
    pub alias: String,
    /// When false, a failed read aborts the handler invocation
    pub continue_on_failure: bool,
}

impl PreRead {
    pub fn new(connection: impl Into<String>, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            connection: connection.into(),
            alias: key.clone(),
            key,
            value_type: None,
            continue_on_failure: true,
        }
    }

    pub fn value_type<T: TagValue>(mut self) -> Self {
        self.value_type = Some(PayloadType::of::<T>());
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn continue_on_failure(mut self, enabled: bool) -> Self {
        self.continue_on_failure = enabled;
        self
    }

    /// Shorthand for `continue_on_failure(false)`.
    pub fn required(self) -> Self {
        self.continue_on_failure(false)
    }
}

/// Metadata of one on-demand event handler.
#[derive(Debug, Clone)]
pub struct EventDeclaration {
    pub(crate) event_name: String,
    pub(crate) binding: EventBinding,
    pub(crate) priority: i32,
    pub(crate) fire_and_forget: bool,
    pub(crate) pre_reads: Vec<PreRead>,
    pub(crate) disabled: bool,
}

impl EventDeclaration {
    pub fn new<H, E>(event_name: impl Into<String>) -> Self
    where
        H: EventHandler<E>,
        E: Send + Sync + 'static,
    {
        Self {
            event_name: event_name.into(),
            binding: EventBinding::of::<H, E>(),
            priority: 0,
            fire_and_forget: false,
            pre_reads: Vec::new(),
            disabled: false,
        }
    }

    /// Higher priorities run first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Spawn the handler instead of awaiting it.
    pub fn fire_and_forget(mut self) -> Self {
        self.fire_and_forget = true;
        self
    }

    pub fn pre_read(mut self, pre_read: PreRead) -> Self {
        self.pre_reads.push(pre_read);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn handler_type(&self) -> HandlerType {
        self.binding.handler_type()
    }
}

/// Scans event declarations in order, skipping disabled and unnamed ones.
///
/// Sequence numbers follow input order starting at `first_sequence`.
pub fn discover_events(declarations: &[EventDeclaration], first_sequence: u64) -> Vec<EventRegistration> {
    declarations
        .iter()
        .filter(|declaration| {
            let usable = !declaration.disabled && !declaration.event_name.is_empty();
            if !usable {
                debug!("🔍 Skipping event handler {}", declaration.binding.handler_type());
            }
            usable
        })
        .zip(first_sequence..)
        .map(|(declaration, sequence)| EventRegistration::from_declaration(declaration, sequence))
        .collect()
}
