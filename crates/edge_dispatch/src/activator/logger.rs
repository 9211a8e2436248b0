//! Loggers injected into handlers.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A category-scoped logger handed to handlers.
///
/// Emits through `tracing` with the category as a field. The no-op variant
/// swallows everything and is injected when no factory supplies a logger.
#[derive(Clone, Debug)]
pub struct HandlerLogger {
    category: Option<Arc<str>>,
    enabled: bool,
}

impl HandlerLogger {
    pub fn new(category: Option<&str>) -> Self {
        Self {
            category: category.map(Arc::from),
            enabled: true,
        }
    }

    pub fn noop() -> Self {
        Self {
            category: None,
            enabled: false,
        }
    }

    pub fn is_noop(&self) -> bool {
        !self.enabled
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn info(&self, message: &str) {
        if self.enabled {
            info!(category = self.category().unwrap_or("handler"), "{}", message);
        }
    }

    pub fn debug(&self, message: &str) {
        if self.enabled {
            debug!(category = self.category().unwrap_or("handler"), "{}", message);
        }
    }

    pub fn warn(&self, message: &str) {
        if self.enabled {
            warn!(category = self.category().unwrap_or("handler"), "{}", message);
        }
    }

    pub fn error(&self, message: &str) {
        if self.enabled {
            error!(category = self.category().unwrap_or("handler"), "{}", message);
        }
    }
}

impl Default for HandlerLogger {
    fn default() -> Self {
        Self::noop()
    }
}
