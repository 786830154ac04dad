//! Synchronous callback registry with subscription handles.
//!
//! `HookRegistry::subscribe` returns a [`Subscription`]; the callback stays
//! registered until the handle is unsubscribed or dropped. The registry only
//! holds a weak link from the handle back to itself, so neither side keeps the
//! other alive.
//!
//! Callbacks run on the emitting task. A panicking callback is caught and
//! logged; it never unwinds into the emitter and never prevents the remaining
//! callbacks from running.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback<E>>,
}

/// A set of callbacks invoked for every emitted event of type `E`.
pub struct HookRegistry<E> {
    name: &'static str,
    inner: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> HookRegistry<E> {
    /// Create an empty registry. `name` labels log lines from failing callbacks.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: BTreeMap::new(),
            })),
        }
    }

    /// Register a callback. Keep the returned handle for as long as the
    /// callback should stay registered.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock(&self.inner);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.callbacks.insert(id, Arc::new(callback));
            id
        };

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner).callbacks.remove(&id);
                }
            })),
        }
    }

    /// Invoke every registered callback with `event`.
    pub fn emit(&self, event: &E) {
        // Snapshot so callbacks may subscribe or unsubscribe without deadlocking.
        let callbacks: Vec<(u64, Callback<E>)> = lock(&self.inner)
            .callbacks
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect();

        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!(hook = self.name, subscription = id, "hook callback panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Clone for HookRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> std::fmt::Debug for HookRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry").field("name", &self.name).finish()
    }
}

fn lock<E>(inner: &Mutex<Registry<E>>) -> MutexGuard<'_, Registry<E>> {
    // A poisoned registry is still structurally valid: callbacks run outside the lock.
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle for a registered callback. Dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes the callback"]
pub struct Subscription {
    id: u64,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the callback from its registry.
    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_every_subscriber() {
        let hooks: HookRegistry<u32> = HookRegistry::new("test");
        let total = Arc::new(AtomicUsize::new(0));

        let t1 = total.clone();
        let _a = hooks.subscribe(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t2 = total.clone();
        let _b = hooks.subscribe(move |v| {
            t2.fetch_add(*v as usize * 10, Ordering::SeqCst);
        });

        hooks.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 22);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let hooks: HookRegistry<()> = HookRegistry::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = hooks.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        hooks.emit(&());
        sub.unsubscribe();
        hooks.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(hooks.is_empty());
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let hooks: HookRegistry<()> = HookRegistry::new("test");
        {
            let _sub = hooks.subscribe(|_| {});
            assert_eq!(hooks.len(), 1);
        }
        assert_eq!(hooks.len(), 0);
    }

    #[test]
    fn panicking_callback_is_isolated() {
        let hooks: HookRegistry<()> = HookRegistry::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        let _bad = hooks.subscribe(|_| panic!("listener bug"));
        let c = count.clone();
        let _good = hooks.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        hooks.emit(&());
        hooks.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handle_outliving_registry_is_harmless() {
        let hooks: HookRegistry<()> = HookRegistry::new("test");
        let sub = hooks.subscribe(|_| {});
        drop(hooks);
        sub.unsubscribe();
    }
}
