//! # tabstore-schema
//!
//! Versioned values for a key-value persistence layer.
//!
//! Every value is stored as a `{"version", "payload"}` [`Envelope`]. Version
//! 0 carries codec text and is never validated; versions 1 and up carry the
//! structured value and are checked against a [`Schema`] registered for the
//! key. When the registry gains a newer schema, stored values are upgraded
//! lazily on read by a chain of [`MigrationRule`]s, and the upgraded envelope
//! is handed back so callers can persist it once.
//!
//! ## Key Concepts
//!
//! - **Envelope**: the only persisted format, `{"version":1,"payload":9}`.
//! - **Registry**: schemas per `(key, version)` plus forward migration edges.
//! - **Modes**: [`SchemaMode::Default`], [`SchemaMode::Strict`] and
//!   [`SchemaMode::Autoschema`] decide what happens when a schema is missing.
//! - **Errors are values**: every failure is an [`Error`] with an
//!   [`ErrorKind`], nothing panics.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use tabstore_schema::{JsonCodec, JsonType, MemoryRegistry, MigrationEngine, SchemaBody, SchemaMode};
//! use serde_json::json;
//!
//! let registry = MemoryRegistry::new()
//!     .with_schema("count", 1, SchemaBody::of_type(JsonType::Integer))
//!     .unwrap();
//! let engine = MigrationEngine::new(SchemaMode::Strict, Some(Arc::new(registry))).unwrap();
//!
//! let raw = engine.encode("count", json!(9), None, &JsonCodec).unwrap();
//! assert_eq!(raw, r#"{"version":1,"payload":9}"#);
//!
//! let bad = engine.encode("count", json!("nine"), None, &JsonCodec);
//! assert!(bad.is_err());
//! ```

mod codec;
mod engine;
mod envelope;
mod error;
mod file;
mod registry;
mod validator;

pub use codec::{Codec, JsonCodec, StringCodec};
pub use engine::{Decoded, MigrationEngine, SchemaMode};
pub use envelope::{Envelope, CODEC_VERSION};
pub use error::{Error, ErrorKind, Result};
pub use file::{SchemaEntry, SchemaFile};
pub use registry::{MemoryRegistry, MigrationRule, Schema, SchemaRegistry, Transform};
pub use validator::{
    validate, AdditionalProperties, JsonType, SchemaBody, TypeSet, ValidationError, Validator,
};
