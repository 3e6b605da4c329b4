use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Callback invoked when cancellation is requested.
pub type CancelCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`CancelManager::register_on_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Something through which a blocking operation can be asked to stop early.
///
/// Blocking operations poll [`is_cancel_requested`](Self::is_cancel_requested)
/// and register a callback so they are woken when a cancel arrives.
pub trait CancelManager: Send + Sync {
    /// Has a cancel been requested.
    fn is_cancel_requested(&self) -> bool;

    /// Register a callback fired when a cancel is requested.
    fn register_on_cancel(&self, callback: CancelCallback) -> CallbackId;

    /// Remove a previously registered callback.
    fn unregister_on_cancel(&self, id: CallbackId);
}

/// A cancel manager that never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancel;

impl CancelManager for NeverCancel {
    fn is_cancel_requested(&self) -> bool {
        false
    }

    fn register_on_cancel(&self, _callback: CancelCallback) -> CallbackId {
        CallbackId(0)
    }

    fn unregister_on_cancel(&self, _id: CallbackId) {}
}

/// Cloneable cancellation flag shared between the requester and the operation.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(CallbackId, CancelCallback)>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and fire all registered callbacks.
    ///
    /// Only the first call fires callbacks.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        // Callbacks run without the list lock held so they may take other locks.
        let callbacks: Vec<CancelCallback> = self
            .inner
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        tracing::trace!(callbacks = callbacks.len(), "cancel requested");
        for callback in callbacks {
            callback();
        }
    }
}

impl CancelManager for CancelToken {
    fn is_cancel_requested(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn register_on_cancel(&self, callback: CancelCallback) -> CallbackId {
        let id = CallbackId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.inner.callbacks.lock().push((id, callback));
        id
    }

    fn unregister_on_cancel(&self, id: CallbackId) {
        self.inner.callbacks.lock().retain(|(cb_id, _)| *cb_id != id);
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancel_requested())
            .field("callbacks", &self.inner.callbacks.lock().len())
            .finish()
    }
}
