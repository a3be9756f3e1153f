/// Failure reported by a [`Backend`](crate::Backend) or
/// [`ObjectStore`](crate::ObjectStore).
///
/// The namespaced store never propagates these; they are logged and the
/// operation degrades (absent reads, cache-only writes).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Storage is disabled or forbidden in this context.
    #[error("storage access denied: {0}")]
    AccessDenied(String),

    /// The backend refused a write for lack of space.
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// No storage exists here (server-side rendering, closed handle).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// SQLite failure, carried as text so the error stays `Clone`.
    #[error("sqlite error: {0}")]
    Sqlite(String),

    /// A lock guarding backend state was poisoned.
    #[error("backend lock poisoned")]
    LockPoisoned,

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Whether this is a storage-access failure (denied, full, missing).
    ///
    /// These tend to repeat on every call, so they are logged once until
    /// storage recovers.
    pub fn is_storage_access(&self) -> bool {
        matches!(
            self,
            Self::AccessDenied(_) | Self::QuotaExceeded(_) | Self::Unavailable(_)
        )
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for BackendError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e.to_string())
    }
}
