//! Event handler registrations.

use crate::discovery::{EventDeclaration, PreRead};
use crate::handler::EventBinding;
use crate::types::HandlerType;
use std::any::TypeId;
use std::cmp::Reverse;
use std::sync::Arc;

/// One on-demand handler bound to an event name.
///
/// Registrations of an event run by descending priority, ties broken by
/// ascending sequence number (registration order).
#[derive(Debug, Clone)]
pub struct EventRegistration {
    event_name: Arc<str>,
    handler_type: HandlerType,
    event_data_type: TypeId,
    result_type: Option<(TypeId, &'static str)>,
    priority: i32,
    fire_and_forget: bool,
    pre_reads: Vec<PreRead>,
    sequence: u64,
    pub(crate) binding: EventBinding,
}

impl EventRegistration {
    pub(crate) fn from_declaration(declaration: &EventDeclaration, sequence: u64) -> Self {
        Self {
            event_name: Arc::from(declaration.event_name.as_str()),
            handler_type: declaration.binding.handler_type(),
            event_data_type: declaration.binding.data_type(),
            result_type: declaration.binding.result_type(),
            priority: declaration.priority,
            fire_and_forget: declaration.fire_and_forget,
            pre_reads: declaration.pre_reads.clone(),
            sequence,
            binding: declaration.binding.clone(),
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn handler_type(&self) -> HandlerType {
        self.handler_type
    }

    pub fn event_data_type(&self) -> TypeId {
        self.event_data_type
    }

    pub fn event_data_type_name(&self) -> &'static str {
        self.binding.data_type_name()
    }

    /// The declared result type, `None` for handlers without a result.
    pub fn result_type(&self) -> Option<(TypeId, &'static str)> {
        self.result_type
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn fire_and_forget(&self) -> bool {
        self.fire_and_forget
    }

    pub fn pre_reads(&self) -> &[PreRead] {
        &self.pre_reads
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn order_key(&self) -> (Reverse<i32>, u64) {
        (Reverse(self.priority), self.sequence)
    }
}
