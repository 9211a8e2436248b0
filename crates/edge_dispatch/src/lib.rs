//! # Edge Dispatch
//!
//! A protocol-agnostic handler dispatch core for industrial edge messaging.
//! It routes named data-change notifications (PLC tags, MQTT topics) to user
//! handlers and mediates on-demand events that pre-fetch values before a
//! handler runs.
//!
//! ## Core Features
//!
//! - **Declarative Discovery**: Handlers declare their payload type and
//!   subscriptions; discovery turns them into immutable registrations
//! - **Dependency-Free Activation**: Handlers are built per invocation from an
//!   external factory or from explicit constructors with capability injection
//! - **Change Filtering**: On-change and deadband filtering per concrete key,
//!   including wildcard subscriptions
//! - **Runtime Typing**: Raw wire values are marshalled into the payload type
//!   known only at registration time
//! - **Event Mediation**: Priority-ordered on-demand handlers with pre-reads
//! - **Failure Containment**: Handler errors and panics are logged, counted and
//!   eventually suppress the offending key
//!
//! ## Architecture Overview
//!
//! - [`topic`] - Wildcard matching of hierarchical keys
//! - [`marshal`] - Raw ⇄ typed value conversion
//! - [`activator`] - Handler instantiation
//! - [`discovery`] - Handler and event declarations, registrations
//! - [`dispatch`] - Live subscriptions and the notification entry point
//! - [`mediator`] - On-demand events
//! - [`transport`] - Connection contracts, supervision and an in-memory
//!   implementation
//! - [`runtime`] - The assembled core
//!
//! ## Quick Start Example
//!
//! ```rust,no_run
//! use edge_dispatch::*;
//! use std::sync::Arc;
//!
//! #[derive(Default)]
//! struct LevelLogger;
//!
//! #[async_trait]
//! impl MessageHandler<f64> for LevelLogger {
//!     async fn handle(&self, message: TagMessage<f64>, _cancel: CancellationToken) -> Result<(), HandlerError> {
//!         tracing::info!("{} = {}", message.key, message.value);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let plc = Arc::new(MemoryConnection::new("plc1", "plc"));
//!
//!     let runtime = EdgeRuntime::builder()
//!         .connection(plc.clone())
//!         .handler(
//!             HandlerDeclaration::message_handler::<LevelLogger, f64>()
//!                 .subscribe(Subscribe::new("plc1", "Tank1.Level").deadband(0.5)),
//!         )
//!         .constructors(|activator| activator.register_default::<LevelLogger>())
//!         .build()?;
//!
//!     runtime.start().await?;
//!     plc.set_value("Tank1.Level", 42.0);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod activator;
pub mod backoff;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod marshal;
pub mod mediator;
pub mod runtime;
pub mod shutdown;
pub mod topic;
pub mod tracking;
pub mod transport;
pub mod types;
pub mod utils;

// Re-export commonly used items for convenience
pub use activator::{
    Activator, Constructor, Dependency, HandlerFactory, HandlerLogger, ReleaseHandle,
    ResolvedDependencies, ScopedInstance, ServiceType,
};
pub use backoff::BackoffPolicy;
pub use config::{DispatchConfig, MediatorConfig, ReconnectConfig};
pub use discovery::{
    discover, discover_events, register_single, DeclaredHandler, EventDeclaration,
    HandlerDeclaration, PreRead, Registration, Subscribe,
};
pub use dispatch::{DispatchEngine, DispatchStats, SubscriptionInfo};
pub use error::{
    ActivationError, CommError, ConfigError, DiscoveryError, DispatchError, HandlerError,
    MarshalError, MediatorError, ReadResultError, RuntimeError,
};
pub use handler::{
    EventBinding, EventContext, EventHandler, MessageBinding, MessageHandler, Notification,
    TagMessage,
};
pub use marshal::{
    Decoded, FixedString, PayloadCodec, PayloadType, TagValue, TypedPayload, ValueMarshaller,
    ValueShape,
};
pub use mediator::{EventMediator, EventRegistration, MediatorStats, ReadResult};
pub use runtime::{EdgeRuntime, EdgeRuntimeBuilder, RuntimeStats};
pub use shutdown::ShutdownState;
pub use tracking::{ReadTracker, TrackedRead};
pub use transport::{
    connect_with_retry, Connection, ConnectionSet, MemoryConnection, MemoryPublisher,
    NotificationSink, Publisher,
};
pub use types::*;
pub use utils::current_timestamp_ms;

// External dependencies that handler crates commonly need
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;

/// Returns a build info string with the crate version.
pub fn build_info() -> String {
    format!("Edge Dispatch v{}", env!("CARGO_PKG_VERSION"))
}
