//! An in-process typed event bus with synchronous, publication-order fan-out.
//!
//! Each event type is declared once by implementing [`Event`] (its `NAME`
//! doubles as the schema tag seen by wildcard subscribers). Subscription is
//! by concrete type (`Bus::subscribe`) or by every event published
//! (`Bus::subscribe_all`); callbacks run synchronously, in publication order,
//! on the publisher's thread. `subscribe`/`subscribe_all` return a
//! [`Subscription`] whose `unsubscribe` is idempotent.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Marker trait for types that can travel over the bus.
///
/// `NAME` is the event's registered schema name, used to tag wildcard
/// deliveries and in diagnostics; it plays the role the source's
/// runtime-registered event schema plays, but fixed at compile time.
pub trait Event: Any + Send + Sync + Clone + 'static {
    const NAME: &'static str;
}

type TypedCallback = Arc<dyn Fn(&dyn Any) + Send + Sync>;
type WildcardCallback = Arc<dyn Fn(&str, &dyn Any) + Send + Sync>;

struct TypedSubscriber {
    id: u64,
    callback: TypedCallback,
}

struct WildcardSubscriber {
    id: u64,
    callback: WildcardCallback,
}

#[derive(Default)]
struct Registry {
    typed: HashMap<TypeId, Vec<TypedSubscriber>>,
    wildcard: Vec<WildcardSubscriber>,
}

struct Inner {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

/// The process-wide event bus. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Bus {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribe to one event type. The callback must not block; offload
    /// long-running work to a task.
    pub fn subscribe<E, F>(&self, callback: F) -> Subscription
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.alloc_id();
        let type_id = TypeId::of::<E>();
        let wrapped: TypedCallback = Arc::new(move |any| {
            if let Some(event) = any.downcast_ref::<E>() {
                callback(event);
            }
        });
        self.inner
            .registry
            .lock()
            .expect("bus registry mutex poisoned")
            .typed
            .entry(type_id)
            .or_default()
            .push(TypedSubscriber {
                id,
                callback: wrapped,
            });
        Subscription {
            bus: self.inner.clone(),
            id,
            type_id: Some(type_id),
        }
    }

    /// Subscribe to every event published on the bus, regardless of type.
    /// The callback receives the event's schema name and an `Any` it can
    /// downcast if it cares about the payload.
    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str, &dyn Any) + Send + Sync + 'static,
    {
        let id = self.alloc_id();
        self.inner
            .registry
            .lock()
            .expect("bus registry mutex poisoned")
            .wildcard
            .push(WildcardSubscriber {
                id,
                callback: Arc::new(callback),
            });
        Subscription {
            bus: self.inner.clone(),
            id,
            type_id: None,
        }
    }

    /// Publish an event. Subscribers registered for `E` and all wildcard
    /// subscribers are invoked synchronously, in the order they were
    /// published for this event type. The subscriber list is cloned under
    /// the lock and invoked after the lock is released, so callbacks may
    /// themselves subscribe or unsubscribe without deadlocking.
    pub fn publish<E: Event>(&self, event: E) {
        let type_id = TypeId::of::<E>();
        let (typed, wildcard) = {
            let registry = self.inner.registry.lock().expect("bus registry mutex poisoned");
            let typed = registry
                .typed
                .get(&type_id)
                .map(|subs| subs.iter().map(|s| s.callback.clone()).collect::<Vec<_>>())
                .unwrap_or_default();
            let wildcard = registry
                .wildcard
                .iter()
                .map(|s| s.callback.clone())
                .collect::<Vec<_>>();
            (typed, wildcard)
        };
        for callback in typed {
            callback(&event);
        }
        for callback in wildcard {
            callback(E::NAME, &event);
        }
    }
}

/// A handle returned by `subscribe`/`subscribe_all`. Dropping it does not
/// unsubscribe; call `unsubscribe` explicitly. Calling it more than once
/// (or after the bus has already dropped the entry) is a no-op.
pub struct Subscription {
    bus: Arc<Inner>,
    id: u64,
    type_id: Option<TypeId>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        let mut registry = self.bus.registry.lock().expect("bus registry mutex poisoned");
        match self.type_id {
            Some(type_id) => {
                if let Some(subs) = registry.typed.get_mut(&type_id) {
                    subs.retain(|s| s.id != self.id);
                }
            }
            None => {
                registry.wildcard.retain(|s| s.id != self.id);
            }
        }
    }
}
