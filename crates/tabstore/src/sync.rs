//! Cross-process synchronization over a shared [`ObjectStore`].
//!
//! Each process keeps a full in-memory mirror of the store. Writes land in
//! the mirror immediately and are queued; one deferred flush per batch
//! commits the queue in a single compare-and-swap transaction on a revision
//! counter, then announces the new revision on a [`BroadcastChannel`].
//! Processes hearing a newer revision reload their mirror and tell their
//! listeners to reconcile.
//!
//! A flush that finds the stored revision moved since the last sync writes
//! nothing: its batch is dropped and the mirror is reloaded from the store.
//! Last committed batch wins; there is no merge.

use std::collections::BTreeMap;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Deserialize;

use crate::error::BackendError;
use crate::traits::{
    Backend, BroadcastChannel, ChangeListener, ObjectStore, Scheduler, Subscription,
};

/// Default key holding the revision counter inside the object store.
pub const REVISION_KEY: &str = "__tabstore_revision__";

/// Sync adapter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Reserved key storing the revision counter. Never visible as data.
    pub revision_key: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            revision_key: REVISION_KEY.to_owned(),
        }
    }
}

impl SyncConfig {
    pub fn revision_key(mut self, key: impl Into<String>) -> Self {
        self.revision_key = key.into();
        self
    }
}

/// [`Backend`] that keeps several processes consistent through one shared
/// [`ObjectStore`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tabstore::{Backend, LocalChannel, MemoryObjectStore, SyncAdapter, TaskQueue};
///
/// let shared = MemoryObjectStore::new();
/// let hub = LocalChannel::new();
/// let queue = TaskQueue::new();
///
/// let tab_a = SyncAdapter::open(shared.clone(), Arc::new(hub.endpoint()), Arc::new(queue.clone())).unwrap();
/// let tab_b = SyncAdapter::open(shared.clone(), Arc::new(hub.endpoint()), Arc::new(queue.clone())).unwrap();
///
/// tab_a.set_item("app:theme", "dark").unwrap();
/// assert_eq!(tab_b.get_item("app:theme").unwrap(), None);
///
/// queue.run_until_idle();
/// assert_eq!(tab_b.get_item("app:theme").unwrap().as_deref(), Some("dark"));
/// assert_eq!(tab_b.revision(), 1);
/// ```
pub struct SyncAdapter<S: ObjectStore + 'static> {
    shared: Arc<Shared<S>>,
    _channel: Subscription,
}

struct Shared<S> {
    store: S,
    channel: Arc<dyn BroadcastChannel>,
    scheduler: Arc<dyn Scheduler>,
    config: SyncConfig,
    state: Mutex<State>,
    // Serializes flushes within this process.
    flush_lock: Mutex<()>,
    listeners: Mutex<Vec<(u64, ChangeListener)>>,
    next_listener: AtomicU64,
    this: Weak<Shared<S>>,
}

#[derive(Default)]
struct State {
    mirror: BTreeMap<String, String>,
    revision: u64,
    pending: BTreeMap<String, Option<String>>,
    in_flight: BTreeMap<String, Option<String>>,
    flush_scheduled: bool,
}

enum Outcome {
    Committed(u64),
    Conflict { stored: u64 },
}

impl<S: ObjectStore + 'static> SyncAdapter<S> {
    /// Load the mirror and join the channel with the default configuration.
    pub fn open(
        store: S,
        channel: Arc<dyn BroadcastChannel>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self, BackendError> {
        Self::open_with_config(store, channel, scheduler, SyncConfig::default())
    }

    /// Load the mirror and join the channel.
    ///
    /// A store without a revision counter gets one initialised to 0.
    pub fn open_with_config(
        store: S,
        channel: Arc<dyn BroadcastChannel>,
        scheduler: Arc<dyn Scheduler>,
        config: SyncConfig,
    ) -> Result<Self, BackendError> {
        let mut mirror = store.read_all()?;
        let revision = match mirror.remove(&config.revision_key) {
            Some(raw) => parse_revision(&raw)?,
            None => init_revision(&store, &config.revision_key)?,
        };
        tracing::debug!(revision, entries = mirror.len(), "sync adapter opened");

        let shared = Arc::new_cyclic(|this| Shared {
            store,
            channel,
            scheduler,
            config,
            state: Mutex::new(State {
                mirror,
                revision,
                ..State::default()
            }),
            flush_lock: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            this: this.clone(),
        });

        let weak = Arc::downgrade(&shared);
        let subscription = shared.channel.subscribe(Arc::new(move |revision| {
            if let Some(shared) = weak.upgrade() {
                shared.receive(revision);
            }
        }));

        Ok(Self {
            shared,
            _channel: subscription,
        })
    }

    /// Revision this process last synchronized with.
    pub fn revision(&self) -> u64 {
        self.shared.state().revision
    }

    /// Number of mutations waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.shared.state().pending.len()
    }

    /// Flush queued mutations on the calling thread.
    pub fn flush_now(&self) {
        self.shared.flush();
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    pub fn object_store(&self) -> &S {
        &self.shared.store
    }
}

impl<S: ObjectStore + 'static> Backend for SyncAdapter<S> {
    fn get_item(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.shared.state().mirror.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), BackendError> {
        self.shared.enqueue(key, Some(value.to_owned()))
    }

    fn remove_item(&self, key: &str) -> Result<(), BackendError> {
        self.shared.enqueue(key, None)
    }

    fn keys(&self) -> Result<Option<Vec<String>>, BackendError> {
        Ok(Some(self.shared.state().mirror.keys().cloned().collect()))
    }

    fn on_external_change(&self, listener: ChangeListener) -> Option<Subscription> {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        let weak = Arc::downgrade(&self.shared);
        Some(Subscription::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared
                    .listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(other, _)| *other != id);
            }
        }))
    }
}

impl<S: ObjectStore + 'static> Shared<S> {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, key: &str, value: Option<String>) -> Result<(), BackendError> {
        if key == self.config.revision_key {
            return Err(BackendError::Other(format!(
                "`{key}` is reserved for the sync revision"
            )));
        }
        let schedule = {
            let mut state = self.state();
            match &value {
                Some(v) => state.mirror.insert(key.to_owned(), v.clone()),
                None => state.mirror.remove(key),
            };
            state.pending.insert(key.to_owned(), value);
            !mem::replace(&mut state.flush_scheduled, true)
        };
        if schedule {
            let this = self.this.clone();
            self.scheduler.schedule(Box::new(move || {
                if let Some(shared) = this.upgrade() {
                    shared.flush();
                }
            }));
        }
        Ok(())
    }

    fn flush(&self) {
        let _flushing = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let (batch, expected) = {
            let mut state = self.state();
            state.flush_scheduled = false;
            if state.pending.is_empty() {
                return;
            }
            let batch = mem::take(&mut state.pending);
            state.in_flight = batch.clone();
            (batch, state.revision)
        };

        let revision_key = self.config.revision_key.as_str();
        let outcome = self.store.transaction(|txn| {
            let stored = match txn.get(revision_key)? {
                Some(raw) => parse_revision(&raw)?,
                None => 0,
            };
            if stored != expected {
                return Ok(Outcome::Conflict { stored });
            }
            for (key, value) in &batch {
                match value {
                    Some(v) => txn.put(key, v)?,
                    None => txn.delete(key)?,
                }
            }
            let next = expected + 1;
            txn.put(revision_key, &next.to_string())?;
            Ok(Outcome::Committed(next))
        });
        self.state().in_flight.clear();

        match outcome {
            Ok(Outcome::Committed(next)) => {
                {
                    let mut state = self.state();
                    state.revision = state.revision.max(next);
                }
                tracing::debug!(revision = next, writes = batch.len(), "flush committed");
                self.channel.publish(next);
            }
            Ok(Outcome::Conflict { stored }) => {
                tracing::warn!(
                    expected,
                    stored,
                    discarded = batch.len(),
                    "revision moved, batch discarded"
                );
                self.resync();
            }
            Err(e) => {
                tracing::warn!(error = %e, discarded = batch.len(), "flush failed, batch discarded");
                self.resync();
            }
        }
    }

    fn receive(&self, revision: u64) {
        let local = self.state().revision;
        if revision <= local {
            tracing::trace!(revision, local, "stale revision ignored");
            return;
        }
        tracing::debug!(revision, local, "newer revision announced");
        self.resync();
    }

    /// Reload the mirror from the store, keep mutations not yet committed
    /// on top, and tell listeners to reconcile everything.
    fn resync(&self) {
        let mut all = match self.store.read_all() {
            Ok(all) => all,
            Err(e) => {
                tracing::warn!(error = %e, "resync failed, mirror kept");
                return;
            }
        };
        let revision = match all.remove(&self.config.revision_key) {
            Some(raw) => match parse_revision(&raw) {
                Ok(revision) => revision,
                Err(e) => {
                    tracing::warn!(error = %e, "resync failed, mirror kept");
                    return;
                }
            },
            None => 0,
        };

        {
            let mut guard = self.state();
            let state = &mut *guard;
            // Read before a commit this process made meanwhile.
            if revision < state.revision {
                tracing::debug!(revision, local = state.revision, "stale snapshot discarded");
                return;
            }
            for (key, value) in state.in_flight.iter().chain(state.pending.iter()) {
                match value {
                    Some(v) => all.insert(key.clone(), v.clone()),
                    None => all.remove(key),
                };
            }
            state.mirror = all;
            state.revision = revision;
        }
        tracing::debug!(revision, "mirror resynchronized");
        self.notify(None);
    }

    fn notify(&self, changed: Option<&[String]>) {
        let listeners: Vec<ChangeListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(changed))).is_err() {
                tracing::warn!("external change listener panicked");
            }
        }
    }
}

fn parse_revision(raw: &str) -> Result<u64, BackendError> {
    raw.trim()
        .parse()
        .map_err(|_| BackendError::Other(format!("corrupt sync revision `{raw}`")))
}

fn init_revision<S: ObjectStore>(store: &S, key: &str) -> Result<u64, BackendError> {
    store.transaction(|txn| match txn.get(key)? {
        // Another process initialised it first.
        Some(raw) => parse_revision(&raw),
        None => {
            txn.put(key, "0")?;
            Ok(0)
        }
    })
}
