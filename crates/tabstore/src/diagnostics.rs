use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tabstore_schema::{Error, ErrorKind};

/// Which path produced a [`Diagnostic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

/// One swallowed failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub op: Operation,
    pub key: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Bounded record of the failures a [`Kv`](crate::Kv) recovered from.
///
/// Clones share one buffer, so a handle can be given to the builder and
/// inspected later. The oldest entry is dropped once capacity is reached.
#[derive(Clone)]
pub struct Diagnostics {
    entries: Arc<Mutex<VecDeque<Diagnostic>>>,
    capacity: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

impl Diagnostics {
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    /// Log `error` and keep it.
    pub fn record(&self, op: Operation, key: &str, error: &Error) {
        let kind = error.kind();
        tracing::warn!(?op, key, %kind, error = %error, "value error recovered");
        let mut entries = self.entries();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(Diagnostic {
            op,
            key: key.to_owned(),
            kind,
            message: error.to_string(),
        });
    }

    /// Entries oldest first.
    pub fn recent(&self) -> Vec<Diagnostic> {
        self.entries().iter().cloned().collect()
    }

    pub fn last(&self) -> Option<Diagnostic> {
        self.entries().back().cloned()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<Diagnostic>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
