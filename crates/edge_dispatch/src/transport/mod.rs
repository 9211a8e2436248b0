//! # Transports
//!
//! Contracts for the controllers and brokers the core talks to, the live
//! [`ConnectionSet`], reconnect supervision and an in-memory implementation.

pub mod connection;
pub mod memory;
pub mod set;
pub mod supervisor;

pub use connection::{Connection, NotificationSink, Publisher};
pub use memory::{MemoryConnection, MemoryPublisher, MemorySubscription, PublishedMessage};
pub use set::ConnectionSet;
pub use supervisor::connect_with_retry;
