//! Namespaced read-through / write-through cache over a [`Backend`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::error::BackendError;
use crate::traits::{Backend, Subscription};

/// Notification that a key's snapshot may have changed. Re-read with
/// [`NamespacedStore::get_snapshot`].
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Cache of raw envelope strings for one namespace.
///
/// Every key is stored in the backend as `"{namespace}:{key}"`. Reads go
/// through the cache (negative results included), writes update the cache
/// first and the backend second, and subscribers hear about every change
/// synchronously. Backend failures never surface: reads degrade to absent,
/// writes stay cache-only.
///
/// Snapshots are `Arc<str>`; two snapshots of a key taken without an
/// intervening write are the same allocation.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tabstore::{MemoryBackend, NamespacedStore};
///
/// let store = NamespacedStore::new("app", MemoryBackend::new());
/// store.set_raw("theme", r#"{"version":0,"payload":"\"dark\""}"#);
///
/// let a = store.get_snapshot("theme").unwrap();
/// let b = store.get_snapshot("theme").unwrap();
/// assert!(Arc::ptr_eq(&a, &b));
/// ```
pub struct NamespacedStore<B: Backend + 'static> {
    inner: Arc<StoreInner<B>>,
    _external: Option<Subscription>,
}

struct StoreInner<B> {
    namespace: String,
    prefix: String,
    backend: B,
    cache: RwLock<HashMap<String, Option<Arc<str>>>>,
    subscribers: Mutex<HashMap<String, Vec<(u64, Listener)>>>,
    next_id: AtomicU64,
    // Set after a storage-access warning; cleared by the next backend success.
    squelched: AtomicBool,
}

impl<B: Backend + 'static> NamespacedStore<B> {
    /// Wrap `backend` and start listening for external changes.
    pub fn new(namespace: impl Into<String>, backend: B) -> Self {
        let namespace = namespace.into();
        let inner = Arc::new(StoreInner {
            prefix: format!("{namespace}:"),
            namespace,
            backend,
            cache: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            squelched: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&inner);
        let external = inner
            .backend
            .on_external_change(Arc::new(move |changed: Option<&[String]>| {
                if let Some(inner) = weak.upgrade() {
                    inner.reconcile(changed);
                }
            }));
        Self {
            inner,
            _external: external,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Fully-qualified backend key for `key`.
    pub fn qualify(&self, key: &str) -> String {
        self.inner.qualify(key)
    }

    /// Current raw value of `key`, read through the cache. Never fails.
    pub fn get_snapshot(&self, key: &str) -> Option<Arc<str>> {
        self.inner.get_snapshot(key)
    }

    /// Store `raw` under `key` and notify subscribers.
    pub fn set_raw(&self, key: &str, raw: &str) {
        self.inner.cache_write().insert(key.to_owned(), Some(Arc::from(raw)));
        let result = self.inner.backend.set_item(&self.inner.qualify(key), raw);
        self.inner.observe(result, key, "write");
        self.inner.notify(key);
    }

    /// Store `raw` only if `key` still holds the `current` snapshot.
    ///
    /// Returns whether the write happened. Used to persist migrations
    /// without clobbering a value written since `current` was read.
    pub fn replace_raw(&self, key: &str, current: &Arc<str>, raw: &str) -> bool {
        {
            let mut cache = self.inner.cache_write();
            match cache.get(key) {
                Some(Some(held)) if Arc::ptr_eq(held, current) => {
                    cache.insert(key.to_owned(), Some(Arc::from(raw)));
                }
                _ => return false,
            }
        }
        let result = self.inner.backend.set_item(&self.inner.qualify(key), raw);
        self.inner.observe(result, key, "write");
        self.inner.notify(key);
        true
    }

    /// Remove `key` and notify subscribers.
    pub fn remove_raw(&self, key: &str) {
        self.inner.cache_write().insert(key.to_owned(), None);
        let result = self.inner.backend.remove_item(&self.inner.qualify(key));
        self.inner.observe(result, key, "remove");
        self.inner.notify(key);
    }

    /// Call `listener` whenever `key` changes.
    ///
    /// The key's snapshot is loaded first so the listener is only told about
    /// changes relative to a known value.
    pub fn subscribe<F>(&self, key: &str, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.get_snapshot(key);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let listener: Listener = Arc::new(listener);
        self.inner
            .subscribers()
            .entry(key.to_owned())
            .or_default()
            .push((id, listener));

        let weak = Arc::downgrade(&self.inner);
        let key = key.to_owned();
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.unsubscribe(&key, id);
            }
        })
    }

    /// Number of live listeners on `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner.subscribers().get(key).map_or(0, Vec::len)
    }

    /// Keys stored in this namespace, unqualified and sorted. Empty when the
    /// backend cannot enumerate.
    pub fn keys(&self) -> Vec<String> {
        let all = match self.inner.backend.keys() {
            Ok(Some(all)) => {
                self.inner.recovered();
                all
            }
            Ok(None) => return Vec::new(),
            Err(e) => {
                self.inner.report(&e, "*", "list");
                return Vec::new();
            }
        };
        let mut keys: Vec<String> = all
            .iter()
            .filter_map(|k| k.strip_prefix(&self.inner.prefix))
            .map(str::to_owned)
            .collect();
        keys.sort();
        keys
    }

    /// Every key of the namespace with its current snapshot.
    pub fn dump(&self) -> BTreeMap<String, Arc<str>> {
        self.keys()
            .into_iter()
            .filter_map(|key| {
                let value = self.inner.get_snapshot(&key)?;
                Some((key, value))
            })
            .collect()
    }

    /// Bring the cache in line with the backend after an external change.
    ///
    /// `changed` holds fully-qualified keys; `None` means everything cached
    /// or subscribed.
    pub fn reconcile(&self, changed: Option<&[String]>) {
        self.inner.reconcile(changed);
    }
}

impl<B: Backend> StoreInner<B> {
    fn qualify(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn cache_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Option<Arc<str>>>> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, Listener)>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_snapshot(&self, key: &str) -> Option<Arc<str>> {
        if let Some(entry) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return entry.clone();
        }
        let loaded = self.load(key);
        // A concurrent writer may have filled the entry meanwhile; keep theirs.
        self.cache_write()
            .entry(key.to_owned())
            .or_insert(loaded)
            .clone()
    }

    fn load(&self, key: &str) -> Option<Arc<str>> {
        match self.backend.get_item(&self.qualify(key)) {
            Ok(value) => {
                self.recovered();
                value.map(Arc::from)
            }
            Err(e) => {
                self.report(&e, key, "read");
                None
            }
        }
    }

    fn observe(&self, result: Result<(), BackendError>, key: &str, op: &'static str) {
        match result {
            Ok(()) => self.recovered(),
            Err(e) => self.report(&e, key, op),
        }
    }

    fn recovered(&self) {
        self.squelched.store(false, Ordering::Relaxed);
    }

    fn report(&self, error: &BackendError, key: &str, op: &'static str) {
        if !error.is_storage_access() {
            tracing::warn!(namespace = %self.namespace, key, op, error = %error, "backend call failed");
            return;
        }
        if !self.squelched.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                namespace = %self.namespace,
                key,
                op,
                error = %error,
                "storage unavailable, continuing from cache"
            );
        }
    }

    fn notify(&self, key: &str) {
        let listeners: Vec<Listener> = match self.subscribers().get(key) {
            Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                tracing::warn!(namespace = %self.namespace, key, "subscriber panicked");
            }
        }
    }

    fn unsubscribe(&self, key: &str, id: u64) {
        let mut subscribers = self.subscribers();
        if let Some(list) = subscribers.get_mut(key) {
            list.retain(|(other, _)| *other != id);
            if list.is_empty() {
                subscribers.remove(key);
            }
        }
    }

    fn reconcile(&self, changed: Option<&[String]>) {
        let candidates: BTreeSet<String> = match changed {
            Some(keys) => keys
                .iter()
                .filter_map(|k| k.strip_prefix(&self.prefix))
                .map(str::to_owned)
                .collect(),
            None => {
                let mut all: BTreeSet<String> = self
                    .cache
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .cloned()
                    .collect();
                all.extend(self.subscribers().keys().cloned());
                all
            }
        };

        for key in candidates {
            let subscribed = self.subscribers().contains_key(&key);
            if !subscribed {
                self.cache_write().remove(&key);
                continue;
            }
            let fresh = self.load(&key);
            let changed = {
                let mut cache = self.cache_write();
                match cache.get(&key) {
                    Some(old) if old.as_deref() == fresh.as_deref() => false,
                    _ => {
                        cache.insert(key.clone(), fresh);
                        true
                    }
                }
            };
            if changed {
                self.notify(&key);
            }
        }
    }
}
