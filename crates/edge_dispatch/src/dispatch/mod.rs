//! # Change Notification Dispatch
//!
//! - [`DispatchEngine`] - Live subscriptions and the notification entry point
//! - [`filter`] - Change and deadband filtering
//! - [`SubscriptionInfo`] - Serializable view of a live subscription

mod engine;
pub mod filter;
mod subscription;

pub use engine::{DispatchEngine, DispatchStats};
pub use filter::{ChangeFilter, FilterDecision, SuppressReason};
pub use subscription::SubscriptionInfo;

#[cfg(test)]
mod tests;
