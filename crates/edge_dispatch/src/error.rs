//! # Error Types
//!
//! One error enum per concern of the dispatch core. Errors that cross the
//! notification boundary (`DispatchError`) are never returned to the
//! transport; they are logged and counted instead. Everything else is an
//! ordinary `Result` error for the caller.

/// Failures talking to an external transport (controller or broker).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CommError {
    /// The named connection is not part of the live connection set
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// The connection exists but is not connected
    #[error("Connection {0} is not connected")]
    NotConnected(String),

    /// Connecting to the transport failed
    #[error("Connect failed for {connection}: {reason}")]
    ConnectFailed { connection: String, reason: String },

    /// The key is not known to the transport
    #[error("Unknown key {key} on connection {connection}")]
    UnknownKey { connection: String, key: String },

    /// Reading a key failed
    #[error("Read of {key} failed: {reason}")]
    ReadFailed { key: String, reason: String },

    /// Writing a key failed
    #[error("Write of {key} failed: {reason}")]
    WriteFailed { key: String, reason: String },

    /// Registering interest in a key failed
    #[error("Subscribe to {key} failed: {reason}")]
    SubscribeFailed { key: String, reason: String },

    /// Publishing to a destination failed
    #[error("Publish to {destination} failed: {reason}")]
    PublishFailed { destination: String, reason: String },

    /// The operation did not complete in time
    #[error("{operation} timed out")]
    Timeout { operation: String },

    /// The operation was cancelled before it completed
    #[error("Operation cancelled")]
    Cancelled,
}

/// Raw ⇄ typed value conversion failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MarshalError {
    /// The raw value cannot be represented as the target type
    #[error("Cannot convert {from} to {to}")]
    Conversion { from: &'static str, to: &'static str },

    /// Encoded text does not fit the declared fixed capacity
    #[error("Encoded length {actual} exceeds fixed capacity {capacity}")]
    CapacityExceeded { capacity: usize, actual: usize },

    /// The structured buffer ended before all fields were read
    #[error("Buffer truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// No codec is registered for the payload type
    #[error("No codec registered for payload type {0}")]
    UnknownPayloadType(&'static str),

    /// A typed payload holds a different type than requested
    #[error("Payload type mismatch: expected {expected}, found {actual}")]
    TypeMismatch { expected: &'static str, actual: &'static str },
}

/// Handler construction failures. Always carry the handler type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActivationError {
    /// No constructor was registered and the factory produced nothing
    #[error("No usable constructor for handler {handler}")]
    NoUsableConstructor { handler: &'static str },

    /// More than one constructor shares the greatest parameter count
    #[error("Handler {handler} has {count} constructors with {arity} parameters")]
    AmbiguousConstructors {
        handler: &'static str,
        arity: usize,
        count: usize,
    },

    /// A constructor parameter could not be resolved
    #[error("Cannot resolve parameter {parameter} for handler {handler}: {reason}")]
    UnresolvedDependency {
        parameter: String,
        handler: &'static str,
        reason: String,
    },

    /// Several live instances satisfy one parameter and none was named
    #[error("Parameter {parameter} for handler {handler} is ambiguous between {candidates:?}")]
    AmbiguousDependency {
        parameter: String,
        handler: &'static str,
        candidates: Vec<String>,
    },

    /// The constructor itself returned an error
    #[error("Constructor for handler {handler} failed: {reason}")]
    ConstructorFailed {
        handler: &'static str,
        reason: String,
    },

    /// The produced instance is not of the requested handler type
    #[error("Instance produced for {handler} has the wrong type")]
    InstanceTypeMismatch { handler: &'static str },
}

/// Malformed or incomplete handler declarations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DiscoveryError {
    /// The type does not declare the message-handler capability
    #[error("Handler {handler} does not implement the message handler capability")]
    MissingCapability { handler: &'static str },

    /// The capability is declared without a payload type
    #[error("Cannot extract payload type for handler {handler}")]
    MissingPayloadType { handler: &'static str },

    /// The type carries no subscription declarations
    #[error("Handler {handler} declares no subscriptions")]
    NoSubscriptions { handler: &'static str },

    /// The type is marked disabled
    #[error("Handler {handler} is disabled")]
    Disabled { handler: &'static str },

    /// An event handler was declared without an event name
    #[error("Event handler {handler} declares no event name")]
    MissingEventName { handler: &'static str },
}

/// Errors returned by user handler code.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Free-form handler failure
    #[error("{0}")]
    Failed(String),

    /// A transport call made by the handler failed
    #[error("Transport error: {0}")]
    Comm(#[from] CommError),

    /// A conversion made by the handler failed
    #[error("Marshalling error: {0}")]
    Marshal(#[from] MarshalError),

    /// A required pre-read value was missing or unconvertible
    #[error("Read result error: {0}")]
    Read(#[from] ReadResultError),
}

impl HandlerError {
    /// Shorthand for a free-form failure.
    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Failures dispatching one change notification. Never propagated to the
/// notification source.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The raw value could not be turned into the payload type
    #[error("Marshalling failed: {0}")]
    Marshal(#[from] MarshalError),

    /// The handler could not be constructed
    #[error("Activation failed: {0}")]
    Activation(#[from] ActivationError),

    /// The handler ran and returned an error
    #[error("Handler {handler} failed: {source}")]
    Handler {
        handler: &'static str,
        #[source]
        source: HandlerError,
    },

    /// The handler panicked
    #[error("Handler {handler} panicked")]
    HandlerPanicked { handler: &'static str },

    /// The registration refers to a connection that does not exist
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// The transport rejected a subscribe or unsubscribe
    #[error("Transport error: {0}")]
    Comm(#[from] CommError),

    /// The key is not a usable key or wildcard pattern
    #[error("Invalid key or pattern: {0}")]
    InvalidKey(String),

    /// The dispatch engine is shutting down
    #[error("Dispatch engine is shut down")]
    ShutDown,
}

/// Lookups into a pre-read result set.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReadResultError {
    /// No value was recorded under the alias
    #[error("No read result for alias {alias}")]
    Missing { alias: String },

    /// A value exists but cannot be converted to the requested type
    #[error("Read result {alias} cannot be converted: {source}")]
    Conversion {
        alias: String,
        #[source]
        source: MarshalError,
    },
}

/// Failures surfaced by the event mediator.
#[derive(Debug, thiserror::Error)]
pub enum MediatorError {
    /// A pre-read marked `continue_on_failure = false` failed
    #[error("Pre-read {alias} for event {event} failed: {source}")]
    PreReadFailed {
        event: String,
        alias: String,
        #[source]
        source: CommError,
    },

    /// The handler could not be constructed
    #[error("Activation failed: {0}")]
    Activation(#[from] ActivationError),

    /// An awaited handler returned an error
    #[error("Handler {handler} for event {event} failed: {source}")]
    Handler {
        event: String,
        handler: &'static str,
        #[source]
        source: HandlerError,
    },

    /// An awaited handler panicked
    #[error("Handler {handler} for event {event} panicked")]
    HandlerPanicked { event: String, handler: &'static str },

    /// The event data is not of the type the handler was registered for
    #[error("Event {event} carries data that is not a {expected}")]
    DataTypeMismatch { event: String, expected: &'static str },

    /// An explicit registration was rejected
    #[error("Registration rejected: {0}")]
    Discovery(#[from] DiscoveryError),

    /// The mediator was cancelled
    #[error("Event mediator cancelled")]
    Cancelled,
}

/// Invalid configuration values.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Failures building or starting an [`EdgeRuntime`](crate::EdgeRuntime).
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The runtime was built outside a tokio runtime
    #[error("No tokio runtime is available")]
    NoRuntime,

    #[error("Activation error: {0}")]
    Activation(#[from] ActivationError),

    #[error("Transport error: {0}")]
    Comm(#[from] CommError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}
