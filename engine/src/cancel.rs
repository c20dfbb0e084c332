//! Cooperative cancellation.
//!
//! A `CancelToken` is shared by the state machine, the verification workers
//! and the supervisor of whichever child process is currently running.
//! Cancelling sets the flag the cooperative parts poll and force-kills the
//! attached child, if any.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::supervisor::ProcessControl;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    active: Mutex<Option<ProcessControl>>,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(control) = active.as_ref() {
            control.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register the running child so `cancel` can kill it.
    ///
    /// If cancellation was already requested the child is killed right away.
    pub fn attach(&self, control: ProcessControl) {
        let mut active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.is_cancelled() {
            control.cancel();
        }
        *active = Some(control);
    }

    pub fn detach(&self) {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}
