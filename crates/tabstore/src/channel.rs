//! In-process broadcast channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::traits::{BroadcastChannel, RevisionListener, Subscription};

/// Hub connecting several simulated processes.
///
/// Each process takes its own [`LocalEndpoint`]; a revision published on one
/// endpoint reaches the listeners of every other endpoint, synchronously and
/// in subscription order.
///
/// # Example
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use tabstore::{BroadcastChannel, LocalChannel};
///
/// let hub = LocalChannel::new();
/// let (a, b) = (hub.endpoint(), hub.endpoint());
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let s = seen.clone();
/// let _sub = b.subscribe(Arc::new(move |rev| s.lock().unwrap().push(rev)));
///
/// a.publish(3);
/// assert_eq!(*seen.lock().unwrap(), vec![3]);
/// ```
#[derive(Clone, Default)]
pub struct LocalChannel {
    hub: Arc<Hub>,
}

#[derive(Default)]
struct Hub {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Entry>>,
}

struct Entry {
    endpoint: u64,
    id: u64,
    listener: RevisionListener,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new endpoint, one per simulated process.
    pub fn endpoint(&self) -> LocalEndpoint {
        LocalEndpoint {
            id: self.hub.next_id.fetch_add(1, Ordering::Relaxed),
            hub: Arc::clone(&self.hub),
        }
    }
}

/// One process's view of a [`LocalChannel`].
pub struct LocalEndpoint {
    id: u64,
    hub: Arc<Hub>,
}

impl BroadcastChannel for LocalEndpoint {
    fn publish(&self, revision: u64) {
        let targets: Vec<RevisionListener> = self
            .hub
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.endpoint != self.id)
            .map(|e| Arc::clone(&e.listener))
            .collect();
        tracing::trace!(endpoint = self.id, revision, receivers = targets.len(), "publish");
        for listener in targets {
            listener(revision);
        }
    }

    fn subscribe(&self, listener: RevisionListener) -> Subscription {
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        self.hub
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Entry {
                endpoint: self.id,
                id,
                listener,
            });
        let hub = Arc::downgrade(&self.hub);
        Subscription::new(move || {
            if let Some(hub) = hub.upgrade() {
                hub.listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|e| e.id != id);
            }
        })
    }
}
