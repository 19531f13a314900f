//! Per-slot notification lists.
//!
//! Architecture:
//! - Observers subscribe with callbacks; `emit()` invokes them in FIFO
//!   (first-subscribed, first-called) order within one signal. Cross-signal
//!   order is undefined - don't rely on ordering between different slots.
//! - Subscribing returns a [`Subscription`] guard; dropping it unregisters
//!   the callback. This replaces manual register/unregister pairs, which
//!   leak whenever a teardown path forgets one half.
//!
//! Callbacks run outside the subscriber lock, so an observer may re-enter
//! the engine (e.g. issue a request from a dirty callback).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use log::debug;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalInner<T> {
    subscribers: RwLock<Vec<(u64, Callback<T>)>>,
    next_id: AtomicU64,
}

/// Observable notification channel carrying `&T` to each subscriber.
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register `callback`; it stays registered for the lifetime of the
    /// returned guard.
    #[must_use = "dropping the Subscription unregisters the callback"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));

        let weak: Weak<SignalInner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .subscribers
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .retain(|(sub_id, _)| *sub_id != id);
                }
            })),
        }
    }

    /// Invoke all subscribers in registration order.
    ///
    /// The subscriber list is snapshotted first: callbacks registered or
    /// dropped *during* emission take effect from the next emit.
    pub fn emit(&self, arg: &T) {
        let snapshot: Vec<Callback<T>> = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in snapshot {
            cb(arg);
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscriber at once (slot teardown).
    pub fn clear(&self) {
        let mut subs = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if !subs.is_empty() {
            debug!("Signal cleared with {} live subscribers", subs.len());
        }
        subs.clear();
    }
}

/// Scoped registration handle returned by [`Signal::subscribe`].
///
/// Dropping it removes the callback. Call [`Subscription::forever`] for
/// observers that should outlive the handle (process-lifetime logging,
/// etc.).
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Leak the registration: the callback stays subscribed until the
    /// signal itself is torn down.
    pub fn forever(mut self) {
        self.unsubscribe = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsub) = self.unsubscribe.take() {
            unsub();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("live", &self.unsubscribe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn test_subscribe_emit() {
        let sig: Signal<i32> = Signal::new();
        let counter = Arc::new(AtomicI32::new(0));
        let c = Arc::clone(&counter);

        let _sub = sig.subscribe(move |v| {
            c.fetch_add(*v, Ordering::SeqCst);
        });

        sig.emit(&10);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        sig.emit(&5);
        assert_eq!(counter.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn test_fifo_order() {
        let sig: Signal<()> = Signal::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        let _a = sig.subscribe(move |_| o1.lock().unwrap().push("first"));
        let o2 = Arc::clone(&order);
        let _b = sig.subscribe(move |_| o2.lock().unwrap().push("second"));

        sig.emit(&());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let sig: Signal<i32> = Signal::new();
        let counter = Arc::new(AtomicI32::new(0));

        let c = Arc::clone(&counter);
        let sub = sig.subscribe(move |v| {
            c.fetch_add(*v, Ordering::SeqCst);
        });
        sig.emit(&1);
        assert_eq!(sig.len(), 1);

        drop(sub);
        assert_eq!(sig.len(), 0);
        sig.emit(&1);
        // Counter unchanged - callback was unregistered
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forever_detaches() {
        let sig: Signal<i32> = Signal::new();
        let counter = Arc::new(AtomicI32::new(0));

        let c = Arc::clone(&counter);
        sig.subscribe(move |v| {
            c.fetch_add(*v, Ordering::SeqCst);
        })
        .forever();

        sig.emit(&7);
        assert_eq!(counter.load(Ordering::SeqCst), 7);
        assert_eq!(sig.len(), 1);
    }

    #[test]
    fn test_clear() {
        let sig: Signal<()> = Signal::new();
        let _sub = sig.subscribe(|_| {});
        sig.clear();
        assert!(sig.is_empty());
    }
}
