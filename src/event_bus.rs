use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, trace, warn};

pub type Listener<P> = Arc<dyn Fn(&P) -> anyhow::Result<()> + Send + Sync>;

struct Registry<K, P> {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<K, Vec<(u64, Listener<P>)>>>,
}

/// In-process publish/subscribe keyed by event kind. Delivery is synchronous
/// and in subscription order.
pub struct EventBus<K, P> {
    registry: Arc<Registry<K, P>>,
}

impl<K, P> Clone for EventBus<K, P> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<K, P> Default for EventBus<K, P>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P> EventBus<K, P>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, kind: K, listener: F) -> Subscription<K, P>
    where
        F: Fn(&P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .listeners
            .lock()
            .entry(kind.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        trace!(target: "event_bus", ?kind, id, "listener subscribed");
        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Delivers `payload` to the current listeners of `kind`. A listener that
    /// errors or panics is logged and skipped.
    pub fn publish(&self, kind: &K, payload: &P) {
        let snapshot: Vec<(u64, Listener<P>)> = match self.registry.listeners.lock().get(kind) {
            Some(listeners) => listeners.clone(),
            None => return,
        };

        for (id, listener) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(target: "event_bus", ?kind, id, error = ?err, "listener failed");
                }
                Err(_) => {
                    error!(target: "event_bus", ?kind, id, "listener panicked");
                }
            }
        }
    }

    pub fn subscriber_count(&self, kind: &K) -> usize {
        self.registry
            .listeners
            .lock()
            .get(kind)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Disposer returned by [`EventBus::subscribe`]. Dropping it keeps the
/// listener registered; call [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the subscription to be able to unsubscribe later"]
pub struct Subscription<K, P> {
    registry: Weak<Registry<K, P>>,
    kind: K,
    id: u64,
}

impl<K, P> Subscription<K, P>
where
    K: Eq + Hash,
{
    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut listeners = registry.listeners.lock();
        if let Some(entries) = listeners.get_mut(&self.kind) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                listeners.remove(&self.kind);
            }
        }
    }
}
