//! Typed synchronous event emitter.
//!
//! Listeners are stored as `Arc<dyn Fn(&T)>` and emission works on a snapshot
//! of the listener list, so:
//!   - a listener removed during emission is still called in that round,
//!   - a listener added during emission is first called on the next emit.
//!
//! The lock is never held while a listener runs, so listeners may register or
//! remove listeners, and may trigger further emissions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Identifier of a registered listener.
pub type ListenerId = u64;

/// Closure type for event listeners.
pub type ListenerFn<T> = dyn Fn(&T) + Send + Sync;

/// Typed synchronous event emitter.
pub struct EventEmitter<T> {
    listeners: Mutex<Vec<(ListenerId, Arc<ListenerFn<T>>)>>,
    next_id: AtomicU64,
}

impl<T: 'static> EventEmitter<T> {
    /// Create a new, empty emitter.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` and return its id.
    pub fn on(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove the listener identified by `id`. Unknown ids are ignored.
    pub fn off(&self, id: ListenerId) {
        let removed = {
            let mut listeners = self.listeners.lock();
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *listeners)
                .into_iter()
                .partition(|(lid, _)| *lid == id);
            *listeners = kept;
            gone
        };
        // Listeners may own handles whose drop re-enters this emitter.
        drop(removed);
    }

    /// Emit `event` to every listener registered before this call.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Arc<ListenerFn<T>>> = {
            let guard = self.listeners.lock();
            guard.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in snapshot {
            cb(event);
        }
    }

    /// Number of registered listeners.
    pub fn size(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl<T: 'static> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> EventEmitter<T> {
    /// Register `callback` on a shared emitter; the listener is removed when
    /// the returned guard is dropped.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let id = self.on(callback);
        let emitter: Weak<Self> = Arc::downgrade(self);
        ListenerGuard {
            off: Some(Box::new(move || {
                if let Some(emitter) = emitter.upgrade() {
                    emitter.off(id);
                }
            })),
        }
    }
}

/// Removes a listener when dropped.
#[must_use = "dropping a listener guard removes the listener"]
pub struct ListenerGuard {
    off: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerGuard {
    /// Keep the listener registered for the emitter's whole lifetime.
    pub fn forget(mut self) {
        self.off = None;
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(off) = self.off.take() {
            off();
        }
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("active", &self.off.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_listeners_in_order() {
        let emitter = EventEmitter::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (seen.clone(), seen.clone());
        emitter.on(move |v| a.lock().push(("a", *v)));
        emitter.on(move |v| b.lock().push(("b", *v)));

        emitter.emit(&7);
        assert_eq!(*seen.lock(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn test_off_removes_listener() {
        let emitter = EventEmitter::<u32>::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let id = emitter.on(move |_| *c.lock() += 1);

        emitter.emit(&1);
        emitter.off(id);
        emitter.off(id);
        emitter.emit(&2);
        assert_eq!(*count.lock(), 1);
        assert_eq!(emitter.size(), 0);
    }

    #[test]
    fn test_listener_added_during_emit_waits_for_next_round() {
        let emitter = Arc::new(EventEmitter::<u32>::new());
        let count = Arc::new(Mutex::new(0));
        let (inner_emitter, c) = (emitter.clone(), count.clone());
        emitter.on(move |_| {
            let c = c.clone();
            inner_emitter.on(move |_| *c.lock() += 1);
        });

        emitter.emit(&1);
        assert_eq!(*count.lock(), 0);
        emitter.emit(&2);
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_guard_unsubscribes_on_drop() {
        let emitter = Arc::new(EventEmitter::<u32>::new());
        let guard = emitter.subscribe(|_| {});
        assert_eq!(emitter.size(), 1);
        drop(guard);
        assert_eq!(emitter.size(), 0);
    }

    #[test]
    fn test_guard_outliving_emitter() {
        let emitter = Arc::new(EventEmitter::<u32>::new());
        let guard = emitter.subscribe(|_| {});
        drop(emitter);
        drop(guard);
    }
}
