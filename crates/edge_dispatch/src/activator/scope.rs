//! Scoped handler instances.

use crate::types::HandlerType;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Runs the release callbacks of a scoped instance exactly once.
///
/// Calling [`release`](Self::release) again is a no-op, and dropping an
/// unreleased handle releases it.
pub struct ReleaseHandle {
    released: AtomicBool,
    callback: Mutex<Option<ReleaseFn>>,
}

impl ReleaseHandle {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            released: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    /// A handle with nothing to release.
    pub fn noop() -> Self {
        Self {
            released: AtomicBool::new(false),
            callback: Mutex::new(None),
        }
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for ReleaseHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("released", &self.is_released())
            .finish()
    }
}

/// A handler instance resolved for one invocation.
#[derive(Debug)]
pub struct ScopedInstance {
    pub handler_type: HandlerType,
    pub instance: Arc<dyn Any + Send + Sync>,
    pub release: ReleaseHandle,
}

impl ScopedInstance {
    /// Typed access to the instance.
    pub fn downcast<H: Send + Sync + 'static>(&self) -> Option<Arc<H>> {
        self.instance.clone().downcast::<H>().ok()
    }
}
