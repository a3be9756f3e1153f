use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::BackendError;
use crate::traits::{Backend, ChangeListener, ObjectStore, Subscription, Txn};

/// In-process backend over a `BTreeMap`.
///
/// Clones share the same map. [`apply_external`](Self::apply_external)
/// simulates a write made by another context and fires the external change
/// feed; [`set_unavailable`](Self::set_unavailable) makes every call fail.
///
/// # Example
///
/// ```
/// use tabstore::{Backend, MemoryBackend};
///
/// let backend = MemoryBackend::new();
/// backend.set_item("ns:k", "v").unwrap();
/// assert_eq!(backend.get_item("ns:k").unwrap().as_deref(), Some("v"));
/// ```
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    data: Mutex<BTreeMap<String, String>>,
    listeners: Mutex<Vec<(u64, ChangeListener)>>,
    next_listener: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`BackendError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Write (or with `None`, delete) as another context would, then tell
    /// every external-change listener.
    pub fn apply_external(&self, key: &str, value: Option<&str>) {
        {
            let mut data = self.inner.data.lock().unwrap_or_else(PoisonError::into_inner);
            match value {
                Some(v) => data.insert(key.to_owned(), v.to_owned()),
                None => data.remove(key),
            };
        }
        let listeners: Vec<ChangeListener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        let changed = [key.to_owned()];
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(Some(&changed[..])))).is_err() {
                tracing::warn!(key, "external change listener panicked");
            }
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.data.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("memory backend switched off".into()));
        }
        Ok(())
    }

    fn data(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, BackendError> {
        self.check()?;
        self.inner.data.lock().map_err(|_| BackendError::LockPoisoned)
    }
}

impl Backend for MemoryBackend {
    fn get_item(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.data()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), BackendError> {
        self.data()?.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), BackendError> {
        self.data()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Option<Vec<String>>, BackendError> {
        Ok(Some(self.data()?.keys().cloned().collect()))
    }

    fn on_external_change(&self, listener: ChangeListener) -> Option<Subscription> {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        let weak = Arc::downgrade(&self.inner);
        Some(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(other, _)| *other != id);
            }
        }))
    }
}

/// Backend for contexts without storage (server-side rendering).
///
/// Reads are absent and writes fail with [`BackendError::Unavailable`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackend;

impl Backend for NoopBackend {
    fn get_item(&self, _key: &str) -> Result<Option<String>, BackendError> {
        Ok(None)
    }

    fn set_item(&self, _key: &str, _value: &str) -> Result<(), BackendError> {
        Err(BackendError::Unavailable("no storage in this context".into()))
    }

    fn remove_item(&self, _key: &str) -> Result<(), BackendError> {
        Err(BackendError::Unavailable("no storage in this context".into()))
    }

    fn keys(&self) -> Result<Option<Vec<String>>, BackendError> {
        Ok(Some(Vec::new()))
    }
}

/// Shared in-memory [`ObjectStore`].
///
/// Every clone is a handle onto the same map, standing in for one storage
/// database opened by several processes. Transactions hold the map lock for
/// their whole duration and stage writes until the closure succeeds.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<ObjectInner>,
}

#[derive(Default)]
struct ObjectInner {
    data: Mutex<BTreeMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make reads and transactions fail with [`BackendError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Write directly, bypassing any adapter (another process at work).
    pub fn put_raw(&self, key: &str, value: &str) {
        self.inner
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
    }

    /// Read directly, bypassing any adapter.
    pub fn get_raw(&self, key: &str) -> Option<String> {
        self.inner
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn data(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, BackendError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("object store switched off".into()));
        }
        self.inner.data.lock().map_err(|_| BackendError::LockPoisoned)
    }
}

struct StagedTxn<'a> {
    base: &'a BTreeMap<String, String>,
    staged: BTreeMap<String, Option<String>>,
}

impl Txn for StagedTxn<'_> {
    fn get(&mut self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(match self.staged.get(key) {
            Some(staged) => staged.clone(),
            None => self.base.get(key).cloned(),
        })
    }

    fn put(&mut self, key: &str, value: &str) -> Result<(), BackendError> {
        self.staged.insert(key.to_owned(), Some(value.to_owned()));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), BackendError> {
        self.staged.insert(key.to_owned(), None);
        Ok(())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn read_all(&self) -> Result<BTreeMap<String, String>, BackendError> {
        Ok(self.data()?.clone())
    }

    fn transaction<F, R>(&self, f: F) -> Result<R, BackendError>
    where
        F: FnOnce(&mut dyn Txn) -> Result<R, BackendError>,
    {
        let mut data = self.data()?;
        let mut txn = StagedTxn {
            base: &data,
            staged: BTreeMap::new(),
        };
        let result = f(&mut txn)?;
        let staged = txn.staged;
        for (key, value) in staged {
            match value {
                Some(v) => data.insert(key, v),
                None => data.remove(&key),
            };
        }
        Ok(result)
    }
}
