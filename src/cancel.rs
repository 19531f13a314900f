//! Cooperative cancellation tokens.
//!
//! Ownership rule: only the holder of a [`CancellationTokenSource`] can
//! cancel; a [`CancellationToken`] can only *observe*. Callees poll
//! `token.cancelled()` at safe points or register a callback for
//! asynchronous notification. The engine never interrupts running code
//! forcibly.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::error;

type CancelCallback = Box<dyn FnOnce() + Send>;

struct TokenInner {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<CancelCallback>>,
}

/// Read-only cancellation handle. Cheap to clone; all clones observe the
/// same source.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    /// Permanently `true` once the owning source has cancelled.
    pub fn cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register `f` to run when the source cancels.
    ///
    /// If cancellation already happened, `f` runs synchronously right here.
    /// Otherwise callbacks run in registration order inside `cancel()`.
    /// Each callback runs exactly once.
    pub fn add_callback<F: FnOnce() + Send + 'static>(&self, f: F) {
        {
            let mut callbacks = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !self.inner.cancelled.load(Ordering::SeqCst) {
                callbacks.push(Box::new(f));
                return;
            }
        }
        // Already cancelled: invoke immediately, outside the lock
        invoke_callback(Box::new(f));
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.cancelled())
            .finish()
    }
}

/// Owner side of a cancellation pair.
pub struct CancellationTokenSource {
    inner: Arc<TokenInner>,
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The observing token. Stable: every call hands out a handle to the
    /// same underlying state.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Flip the token to cancelled and run the registered callbacks in
    /// registration order. Idempotent; later calls are no-ops.
    ///
    /// A misbehaving callback cannot abort cancellation: panics are caught
    /// and logged, and the remaining callbacks still run.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks: Vec<CancelCallback> = std::mem::take(
            &mut *self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for cb in callbacks {
            invoke_callback(cb);
        }
    }

    pub fn cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for CancellationTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationTokenSource")
            .field("cancelled", &self.cancelled())
            .finish()
    }
}

fn invoke_callback(cb: CancelCallback) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(cb)) {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic>".to_string());
        error!("Failed to invoke callback: {}", msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_token_starts_uncancelled() {
        let source = CancellationTokenSource::new();
        assert!(!source.token().cancelled());
    }

    #[test]
    fn test_cancel_is_permanent() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        source.cancel();
        assert!(token.cancelled());
        source.cancel();
        assert!(token.cancelled());
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let o = Arc::clone(&order);
            token.add_callback(move || o.lock().unwrap().push(i));
        }
        source.cancel();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_late_callback_fires_immediately_exactly_once() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        source.cancel();

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        token.add_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        // Registered after cancel: invoked synchronously, exactly once
        assert_eq!(count.load(Ordering::SeqCst), 1);
        source.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_callback_does_not_block_others() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        let ran = Arc::new(AtomicBool::new(false));

        token.add_callback(|| panic!("observer misbehaved"));
        let r = Arc::clone(&ran);
        token.add_callback(move || r.store(true, Ordering::SeqCst));

        source.cancel();
        assert!(ran.load(Ordering::SeqCst));
        assert!(token.cancelled());
    }

    #[test]
    fn test_token_clones_share_state() {
        let source = CancellationTokenSource::new();
        let a = source.token();
        let b = a.clone();
        source.cancel();
        assert!(a.cancelled() && b.cancelled());
    }
}
