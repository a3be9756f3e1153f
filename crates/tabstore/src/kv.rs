//! Typed, schema-aware key-value API.
//!
//! `Kv` wraps a [`NamespacedStore`] with a [`MigrationEngine`]: values are
//! serialized with serde, checked and versioned on write, and decoded,
//! validated and lazily migrated on read. Migrated values are written back
//! so each stored value is upgraded once.
//!
//! # Example
//!
//! ```
//! use tabstore::{Kv, MemoryBackend};
//!
//! let kv = Kv::builder(MemoryBackend::new()).namespace("ns").build().unwrap();
//! kv.save("count", &7).unwrap();
//!
//! assert_eq!(kv.snapshot("count").as_deref(), Some(r#"{"version":0,"payload":"7"}"#));
//! assert_eq!(kv.get_or("count", 0), 7);
//! assert_eq!(kv.get_or("missing", 0), 0);
//! ```

use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tabstore_schema::{Codec, Error, JsonCodec, MigrationEngine, SchemaMode, SchemaRegistry};

use crate::diagnostics::{Diagnostics, Operation};
use crate::store::NamespacedStore;
use crate::traits::{Backend, Subscription};

/// The default namespace used when none is specified.
const DEFAULT_NAMESPACE: &str = "default";

/// Configuration for [`Kv`].
///
/// ```
/// use tabstore::{KvConfig, SchemaMode};
///
/// let config = KvConfig::from_toml_str(r#"
///     namespace = "settings"
///     mode = "strict"
/// "#).unwrap();
/// assert_eq!(config.mode, SchemaMode::Strict);
/// assert!(config.write_back_on_read);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KvConfig {
    /// Prefix isolating this instance's keys in the backend.
    pub namespace: String,
    /// How the schema registry is consulted.
    pub mode: SchemaMode,
    /// Persist values upgraded by a migration on read.
    pub write_back_on_read: bool,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_owned(),
            mode: SchemaMode::Default,
            write_back_on_read: true,
        }
    }
}

impl KvConfig {
    /// Parse from TOML; missing fields keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, Error> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Builder for a [`Kv`].
pub struct KvBuilder<B: Backend + 'static> {
    backend: B,
    config: KvConfig,
    registry: Option<Arc<dyn SchemaRegistry>>,
    codec: Arc<dyn Codec>,
    diagnostics: Diagnostics,
}

impl<B: Backend + 'static> KvBuilder<B> {
    /// Replace the whole configuration.
    pub fn config(mut self, config: KvConfig) -> Self {
        self.config = config;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn mode(mut self, mode: SchemaMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn write_back_on_read(mut self, enabled: bool) -> Self {
        self.config.write_back_on_read = enabled;
        self
    }

    pub fn registry(mut self, registry: Arc<dyn SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Codec for values no schema governs. Defaults to [`JsonCodec`].
    pub fn codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Share a diagnostics handle instead of creating a private one.
    pub fn diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Build the `Kv`. Fails when the mode cannot work with the registry
    /// given (strict without one).
    pub fn build(self) -> Result<Kv<B>, Error> {
        let engine = MigrationEngine::new(self.config.mode, self.registry)?;
        let store = NamespacedStore::new(self.config.namespace.clone(), self.backend);
        tracing::debug!(
            namespace = %self.config.namespace,
            mode = ?self.config.mode,
            codec = self.codec.name(),
            "kv opened"
        );
        Ok(Kv {
            store,
            engine,
            codec: self.codec,
            diagnostics: self.diagnostics,
            config: self.config,
        })
    }
}

/// Namespaced, versioned key-value store.
pub struct Kv<B: Backend + 'static> {
    store: NamespacedStore<B>,
    engine: MigrationEngine,
    codec: Arc<dyn Codec>,
    diagnostics: Diagnostics,
    config: KvConfig,
}

impl<B: Backend + 'static> Kv<B> {
    /// Create a builder with the default configuration.
    pub fn builder(backend: B) -> KvBuilder<B> {
        KvBuilder {
            backend,
            config: KvConfig::default(),
            registry: None,
            codec: Arc::new(JsonCodec),
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        self.store.namespace()
    }

    pub fn config(&self) -> &KvConfig {
        &self.config
    }

    pub fn store(&self) -> &NamespacedStore<B> {
        &self.store
    }

    pub fn engine(&self) -> &MigrationEngine {
        &self.engine
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Read and decode `key`.
    ///
    /// `Ok(None)` when absent. Failures are also recorded on the
    /// diagnostics handle.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        let result = self.load_value(key).and_then(|value| {
            value
                .map(|v| serde_json::from_value(v).map_err(serde_error))
                .transpose()
        });
        if let Err(e) = &result {
            self.diagnostics.record(Operation::Read, key, e);
        }
        result
    }

    /// Read `key`, substituting `default` when it is absent or unreadable.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get_or_report(key, default, |_| {})
    }

    /// Like [`get_or`](Self::get_or), handing any failure to `on_error`.
    pub fn get_or_report<T, F>(&self, key: &str, default: T, on_error: F) -> T
    where
        T: DeserializeOwned,
        F: FnOnce(&Error),
    {
        match self.load(key) {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(e) => {
                on_error(&e);
                default
            }
        }
    }

    /// Encode and store `value` at the latest schema version (or the codec
    /// path when `key` has none). On failure the stored value is untouched.
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), Error> {
        self.write(key, value, None)
    }

    /// Store `value` under an explicit schema version.
    pub fn save_versioned<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        version: u32,
    ) -> Result<(), Error> {
        self.write(key, value, Some(version))
    }

    pub fn remove(&self, key: &str) {
        self.store.remove_raw(key);
    }

    /// Call `listener` whenever `key` changes, locally or in another
    /// process.
    pub fn subscribe<F>(&self, key: &str, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.store.subscribe(key, listener)
    }

    /// Raw envelope currently stored under `key`.
    pub fn snapshot(&self, key: &str) -> Option<Arc<str>> {
        self.store.get_snapshot(key)
    }

    /// Value to render where no storage exists: always `default`.
    pub fn server_snapshot<T>(&self, default: T) -> T {
        default
    }

    pub fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    fn load_value(&self, key: &str) -> Result<Option<Value>, Error> {
        let Some(raw) = self.store.get_snapshot(key) else {
            return Ok(None);
        };
        let decoded = self.engine.decode(key, &raw, self.codec.as_ref())?;
        if let Some(rewrite) = decoded.rewrite {
            if self.config.write_back_on_read && self.store.replace_raw(key, &raw, &rewrite) {
                tracing::debug!(key, version = decoded.version, "migrated value written back");
            }
        }
        Ok(Some(decoded.value))
    }

    fn write<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        version: Option<u32>,
    ) -> Result<(), Error> {
        let encoded = serde_json::to_value(value)
            .map_err(serde_error)
            .and_then(|v| self.engine.encode(key, v, version, self.codec.as_ref()));
        match encoded {
            Ok(raw) => {
                self.store.set_raw(key, &raw);
                Ok(())
            }
            Err(e) => {
                self.diagnostics.record(Operation::Write, key, &e);
                Err(e)
            }
        }
    }
}

fn serde_error(e: serde_json::Error) -> Error {
    Error::CodecError {
        codec: "serde",
        message: e.to_string(),
    }
}
