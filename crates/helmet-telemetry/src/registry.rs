//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry link, frame decoding and fan-out."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Listener registry and failure-isolated fan-out.
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::error;

use crate::error::ObserverError;

/// Receives decoded events of type `E`.
///
/// Called on the link's dispatch task; implementations should update their
/// own state and return quickly.
pub trait Listener<E>: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &E) -> Result<(), ObserverError>;
}

impl<E, F> Listener<E> for F
where
    F: Fn(&E) -> Result<(), ObserverError> + Send + Sync,
{
    fn on_event(&self, event: &E) -> Result<(), ObserverError> {
        self(event)
    }
}

/// Registry-assigned listener identity. Never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Outcome of delivering one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that handled the event.
    pub delivered: usize,
    /// Listeners that returned an error or panicked.
    pub failed: usize,
}

struct RegistryInner<E> {
    next_id: u64,
    listeners: IndexMap<ListenerId, Arc<dyn Listener<E>>>,
}

trait Deregister: Send + Sync {
    fn deregister(&self, id: ListenerId) -> bool;
}

impl<E> Deregister for RwLock<RegistryInner<E>> {
    fn deregister(&self, id: ListenerId) -> bool {
        self.write().listeners.shift_remove(&id).is_some()
    }
}

/// Disposer returned by [`ListenerRegistry::register`].
///
/// Disposing is idempotent and remains safe after the registry was cleared or
/// dropped. Dropping a `Subscription` does not deregister.
#[derive(Clone)]
#[must_use = "keep the subscription to be able to deregister the listener"]
pub struct Subscription {
    id: ListenerId,
    registry: Weak<dyn Deregister>,
}

impl Subscription {
    /// Identity of the registered listener.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener. Returns whether this call removed it.
    pub fn dispose(&self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.deregister(self.id))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Set of listeners for one event type.
///
/// Registering the same `Arc` twice yields the existing registration, so a
/// listener is never invoked twice for one event. Dispatch snapshots the set
/// before invoking anyone, so listeners may register or dispose (themselves
/// included) from inside a callback.
pub struct ListenerRegistry<E> {
    name: &'static str,
    inner: Arc<RwLock<RegistryInner<E>>>,
}

impl<E: 'static> ListenerRegistry<E> {
    /// Create an empty registry; `name` labels log events.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(RwLock::new(RegistryInner {
                next_id: 0,
                listeners: IndexMap::new(),
            })),
        }
    }

    /// Register a listener.
    pub fn register<L>(&self, listener: Arc<L>) -> Subscription
    where
        L: Listener<E> + 'static,
    {
        let listener: Arc<dyn Listener<E>> = listener;
        let mut inner = self.inner.write();
        let existing = inner
            .listeners
            .iter()
            .find(|(_, known)| std::ptr::addr_eq(Arc::as_ptr(known), Arc::as_ptr(&listener)))
            .map(|(id, _)| *id);
        let id = match existing {
            Some(id) => id,
            None => {
                inner.next_id += 1;
                let id = ListenerId(inner.next_id);
                inner.listeners.insert(id, listener);
                id
            }
        };
        drop(inner);
        self.subscription(id)
    }

    /// Register a closure. Every call creates a distinct registration.
    pub fn register_fn<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) -> Result<(), ObserverError> + Send + Sync + 'static,
    {
        self.register(Arc::new(listener))
    }

    fn subscription(&self, id: ListenerId) -> Subscription {
        let shared: Arc<dyn Deregister> = self.inner.clone();
        Subscription {
            id,
            registry: Arc::downgrade(&shared),
        }
    }

    /// Deliver `event` to every listener registered at the time of the call.
    ///
    /// A listener that errors or panics is logged and skipped; the rest still
    /// receive the event.
    pub fn dispatch(&self, event: &E) -> DispatchReport {
        let snapshot: Vec<(ListenerId, Arc<dyn Listener<E>>)> = self
            .inner
            .read()
            .listeners
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        let mut report = DispatchReport::default();
        for (id, listener) in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event)))
                .unwrap_or_else(|payload| Err(ObserverError::from_panic(payload)));
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    error!(registry = self.name, listener = %id, error = %err, "listener failed");
                }
            }
        }
        report
    }

    /// Remove every listener. Outstanding subscriptions become no-ops.
    pub fn clear(&self) {
        self.inner.write().listeners.clear();
    }

    /// Whether `id` is still registered.
    pub fn contains(&self, id: ListenerId) -> bool {
        self.inner.read().listeners.contains_key(&id)
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.read().listeners.len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
