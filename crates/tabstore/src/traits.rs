use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::BackendError;

/// Callback told which fully-qualified keys changed outside this process.
/// `None` means "anything may have changed, reload".
pub type ChangeListener = Arc<dyn Fn(Option<&[String]>) + Send + Sync>;

/// Callback receiving a revision announced on a [`BroadcastChannel`].
pub type RevisionListener = Arc<dyn Fn(u64) + Send + Sync>;

/// Unit of deferred work handed to a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send>;

/// Slow string key/value storage underneath a namespaced store.
///
/// Keys are fully qualified (`"{namespace}:{key}"`); values are envelope
/// strings the backend never interprets.
pub trait Backend: Send + Sync {
    /// Read a value. `Ok(None)` when the key is absent.
    fn get_item(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Store a value, replacing any previous one.
    fn set_item(&self, key: &str, value: &str) -> Result<(), BackendError>;

    /// Delete a value. Deleting an absent key is not an error.
    fn remove_item(&self, key: &str) -> Result<(), BackendError>;

    /// Every stored key, or `Ok(None)` when the backend cannot enumerate.
    fn keys(&self) -> Result<Option<Vec<String>>, BackendError> {
        Ok(None)
    }

    /// Register for changes made by other processes. Backends without an
    /// external change feed return `None`.
    fn on_external_change(&self, _listener: ChangeListener) -> Option<Subscription> {
        None
    }
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn get_item(&self, key: &str) -> Result<Option<String>, BackendError> {
        (**self).get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), BackendError> {
        (**self).set_item(key, value)
    }

    fn remove_item(&self, key: &str) -> Result<(), BackendError> {
        (**self).remove_item(key)
    }

    fn keys(&self) -> Result<Option<Vec<String>>, BackendError> {
        (**self).keys()
    }

    fn on_external_change(&self, listener: ChangeListener) -> Option<Subscription> {
        (**self).on_external_change(listener)
    }
}

/// Operations available inside an [`ObjectStore::transaction`].
pub trait Txn {
    fn get(&mut self, key: &str) -> Result<Option<String>, BackendError>;
    fn put(&mut self, key: &str, value: &str) -> Result<(), BackendError>;
    fn delete(&mut self, key: &str) -> Result<(), BackendError>;
}

/// Transactional store shared by every process.
///
/// A transaction sees a consistent view and is serialized against
/// transactions from other handles; it commits when the closure returns
/// `Ok` and rolls back otherwise.
pub trait ObjectStore: Send + Sync {
    /// Snapshot of every entry.
    fn read_all(&self) -> Result<BTreeMap<String, String>, BackendError>;

    /// Run `f` atomically.
    fn transaction<F, R>(&self, f: F) -> Result<R, BackendError>
    where
        F: FnOnce(&mut dyn Txn) -> Result<R, BackendError>;
}

/// Cross-process pub/sub carrying revision numbers.
pub trait BroadcastChannel: Send + Sync {
    /// Announce a revision to every other subscriber. The publisher's own
    /// listeners are not called.
    fn publish(&self, revision: u64);

    /// Listen for revisions published elsewhere.
    fn subscribe(&self, listener: RevisionListener) -> Subscription;
}

/// Runs deferred work outside the calling frame.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, task: Task);
}

/// Guard for a registered listener.
///
/// The listener is removed by [`unsubscribe`](Self::unsubscribe) or when the
/// guard is dropped, whichever comes first.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A guard with nothing to cancel.
    pub fn empty() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
