//! # Event Mediator
//!
//! On-demand ("pull") events. Application code calls
//! [`EventMediator::emit`], [`emit_one`](EventMediator::emit_one) or
//! [`emit_all`](EventMediator::emit_all); every handler registered for the
//! event name runs in priority order after its pre-reads were fetched.
//!
//! ## Ordering and Failures
//!
//! - Handlers run by descending priority, then registration order.
//! - A handler whose required pre-read fails is skipped and its
//!   [`MediatorError::PreReadFailed`](crate::MediatorError::PreReadFailed) is
//!   surfaced after the remaining handlers ran.
//! - Fire-and-forget handlers are spawned; their failures are only logged.

mod core;
mod read_result;
mod registration;

pub use self::core::{EventMediator, MediatorStats};
pub use read_result::ReadResult;
pub use registration::EventRegistration;
