//! # tabstore
//!
//! Namespaced, versioned key-value persistence for applications that run
//! as several cooperating processes over one shared store.
//!
//! A [`Kv`] serializes values with serde, wraps them in a versioned
//! envelope (see [`tabstore_schema`]), and keeps them in a
//! [`NamespacedStore`]: a read-through, write-through cache over a
//! [`Backend`]. Subscribers are told about every change, whether it was made
//! locally or by another process.
//!
//! ## Quick Start
//!
//! ```
//! use tabstore::{Kv, MemoryBackend};
//!
//! let kv = Kv::builder(MemoryBackend::new()).namespace("app").build().unwrap();
//! let _sub = kv.subscribe("theme", || println!("theme changed"));
//!
//! kv.save("theme", "dark").unwrap();
//! assert_eq!(kv.get_or("theme", String::from("light")), "dark");
//! ```
//!
//! ## Backends
//!
//! | Backend | Feature flag | Use case |
//! |---------|-------------|----------|
//! | [`MemoryBackend`] | *(always available)* | Testing, single process |
//! | [`NoopBackend`] | *(always available)* | No storage; cache only |
//! | [`SyncAdapter`] | *(always available)* | Processes sharing an [`ObjectStore`] |
//! | `SqliteObjectStore` | `sqlite` | Shared on-disk object store |
//!
//! ## Cross-process sync
//!
//! [`SyncAdapter`] overlays pending writes on a local snapshot and flushes
//! them in one compare-and-swap transaction guarded by a revision counter.
//! Peers learn of commits over a [`BroadcastChannel`] and resync when the
//! broadcast revision is newer than theirs. Flushes run on a [`Scheduler`]:
//! [`TaskQueue`] for deterministic tests, `TokioScheduler` (feature `tokio`)
//! in services.

mod channel;
mod diagnostics;
mod error;
mod kv;
mod memory;
mod scheduler;
#[cfg(feature = "sqlite")]
mod sqlite;
mod store;
mod sync;
mod traits;

pub use channel::{LocalChannel, LocalEndpoint};
pub use diagnostics::{Diagnostic, Diagnostics, Operation};
pub use error::BackendError;
pub use kv::{Kv, KvBuilder, KvConfig};
pub use memory::{MemoryBackend, MemoryObjectStore, NoopBackend};
#[cfg(feature = "tokio")]
pub use scheduler::TokioScheduler;
pub use scheduler::TaskQueue;
#[cfg(feature = "sqlite")]
pub use sqlite::{JournalMode, SqliteConfig, SqliteObjectStore};
pub use store::{Listener, NamespacedStore};
pub use sync::{SyncAdapter, SyncConfig, REVISION_KEY};
pub use traits::*;

pub use tabstore_schema;
pub use tabstore_schema::{
    Codec, Error, ErrorKind, JsonCodec, JsonType, MemoryRegistry, MigrationEngine, SchemaBody,
    SchemaMode, SchemaRegistry, StringCodec,
};
