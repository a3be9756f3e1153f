use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::envelope::CODEC_VERSION;
use crate::error::{Error, Result};
use crate::validator::{SchemaBody, ValidationError, Validator};

/// A schema registered for one `(key, version)`.
///
/// The body is compiled once at construction; identity is `(key, version)`
/// and two schemas are equal when their bodies are equal.
#[derive(Debug, Clone)]
pub struct Schema {
    key: String,
    version: u32,
    validator: Validator,
}

impl Schema {
    /// Build a schema. Version 0 is reserved for codec-only values.
    pub fn new(key: impl Into<String>, version: u32, body: SchemaBody) -> Result<Self> {
        let key = key.into();
        if version == CODEC_VERSION {
            return Err(Error::ReservedVersion { key });
        }
        let validator = Validator::compile(&body).map_err(|e| Error::InvalidSchema {
            key: key.clone(),
            version,
            message: e.to_string(),
        })?;
        Ok(Self {
            key,
            version,
            validator,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn body(&self) -> &SchemaBody {
        self.validator.body()
    }

    /// Violations of `value` against this schema.
    pub fn validate(&self, value: &Value) -> Vec<ValidationError> {
        self.validator.validate(value)
    }

    /// Validate, turning violations into [`Error::TypeMismatch`].
    pub fn check(&self, value: &Value) -> Result<()> {
        let errors = self.validate(value);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                key: self.key.clone(),
                version: self.version,
                errors,
            })
        }
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.version == other.version && self.body() == other.body()
    }
}

/// A fallible value transform.
pub type Transform = Arc<dyn Fn(Value) -> std::result::Result<Value, String> + Send + Sync>;

/// A migration edge (`from < to`) or a write-time normalizer (`from == to`).
///
/// Transforms must be deterministic: every process upgrading the same
/// stored value has to produce the same result.
#[derive(Clone)]
pub struct MigrationRule {
    pub key: String,
    pub from_version: u32,
    pub to_version: u32,
    transform: Transform,
}

impl MigrationRule {
    /// A migration edge from `from` to `to`.
    pub fn new<F>(key: impl Into<String>, from: u32, to: u32, transform: F) -> Self
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            from_version: from,
            to_version: to,
            transform: Arc::new(transform),
        }
    }

    /// A normalizer applied on every write at `version`.
    pub fn normalizer<F>(key: impl Into<String>, version: u32, transform: F) -> Self
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        Self::new(key, version, version, transform)
    }

    pub fn is_normalizer(&self) -> bool {
        self.from_version == self.to_version
    }

    /// Run the transform.
    pub fn apply(&self, value: Value) -> std::result::Result<Value, String> {
        (self.transform)(value)
    }
}

impl fmt::Debug for MigrationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationRule")
            .field("key", &self.key)
            .field("from_version", &self.from_version)
            .field("to_version", &self.to_version)
            .finish_non_exhaustive()
    }
}

/// Lookup of schemas and migration rules per key.
///
/// The store and migration engine only see this trait, so in-memory,
/// file-loaded or remote registries are interchangeable.
pub trait SchemaRegistry: Send + Sync {
    /// Exact `(key, version)` lookup.
    fn get_schema(&self, key: &str, version: u32) -> Option<Arc<Schema>>;

    /// Highest registered version for `key`.
    fn get_latest_schema(&self, key: &str) -> Option<Arc<Schema>>;

    /// Contiguous chain of edges `from → … → to`, or `None`.
    ///
    /// When several edges leave the same version the first registered one
    /// is tried first.
    fn get_migration_path(&self, key: &str, from: u32, to: u32) -> Option<Vec<MigrationRule>>;

    /// The normalizer registered for `version`, if any.
    fn get_write_migration(&self, key: &str, version: u32) -> Option<MigrationRule>;

    /// Register a schema. Re-registering an identical body is a no-op.
    fn register_schema(&self, schema: Schema) -> Result<()>;

    /// Whether any schema was ever registered for `key`.
    fn has_schemas(&self, key: &str) -> bool {
        self.get_latest_schema(key).is_some()
    }
}

#[derive(Default)]
struct Inner {
    schemas: BTreeMap<String, BTreeMap<u32, Arc<Schema>>>,
    // Per key, in registration order.
    rules: BTreeMap<String, Vec<MigrationRule>>,
}

/// In-memory [`SchemaRegistry`].
///
/// # Example
///
/// ```
/// use tabstore_schema::{MemoryRegistry, SchemaBody, SchemaRegistry, JsonType};
/// use serde_json::json;
///
/// let registry = MemoryRegistry::new();
/// registry.register("count", 1, SchemaBody::of_type(JsonType::Number)).unwrap();
/// registry.register("count", 2, SchemaBody::of_type(JsonType::Object)).unwrap();
/// registry
///     .migration("count", 1, 2, |v| Ok(json!({ "n": v })))
///     .unwrap();
///
/// assert_eq!(registry.get_latest_schema("count").unwrap().version(), 2);
/// let path = registry.get_migration_path("count", 1, 2).unwrap();
/// assert_eq!(path.len(), 1);
/// ```
#[derive(Default)]
pub struct MemoryRegistry {
    inner: RwLock<Inner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and register a schema in one call.
    pub fn register(&self, key: &str, version: u32, body: SchemaBody) -> Result<()> {
        self.register_schema(Schema::new(key, version, body)?)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_schema(self, key: &str, version: u32, body: SchemaBody) -> Result<Self> {
        self.register(key, version, body)?;
        Ok(self)
    }

    /// Builder-style [`migration`](Self::migration).
    pub fn with_migration<F>(self, key: &str, from: u32, to: u32, transform: F) -> Result<Self>
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.migration(key, from, to, transform)?;
        Ok(self)
    }

    /// Register a migration edge or normalizer.
    pub fn register_migration(&self, rule: MigrationRule) -> Result<()> {
        if rule.from_version > rule.to_version {
            return Err(Error::InvalidMigrationRule {
                key: rule.key,
                from: rule.from_version,
                to: rule.to_version,
            });
        }
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.rules.entry(rule.key.clone()).or_default().push(rule);
        Ok(())
    }

    /// Register a migration edge from a closure.
    pub fn migration<F>(&self, key: &str, from: u32, to: u32, transform: F) -> Result<()>
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.register_migration(MigrationRule::new(key, from, to, transform))
    }

    /// Register a write-time normalizer from a closure.
    pub fn normalizer<F>(&self, key: &str, version: u32, transform: F) -> Result<()>
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.register_migration(MigrationRule::normalizer(key, version, transform))
    }

    /// All registered `(from, to)` pairs for `key`, in registration order.
    pub fn registered_migrations(&self, key: &str) -> Vec<(u32, u32)> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .rules
            .get(key)
            .map(|rules| {
                rules
                    .iter()
                    .map(|r| (r.from_version, r.to_version))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check that data stored at `from` can reach the latest schema of `key`.
    pub fn validate_chain(&self, key: &str, from: u32) -> Result<()> {
        let Some(latest) = self.get_latest_schema(key) else {
            return Ok(());
        };
        match self.get_migration_path(key, from, latest.version()) {
            Some(_) => Ok(()),
            None => Err(Error::MigrationPathNotFound {
                key: key.to_owned(),
                from,
                to: latest.version(),
            }),
        }
    }

    /// Keys with at least one schema.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.schemas.keys().cloned().collect()
    }
}

impl SchemaRegistry for MemoryRegistry {
    fn get_schema(&self, key: &str, version: u32) -> Option<Arc<Schema>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.schemas.get(key)?.get(&version).cloned()
    }

    fn get_latest_schema(&self, key: &str) -> Option<Arc<Schema>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .schemas
            .get(key)?
            .last_key_value()
            .map(|(_, s)| Arc::clone(s))
    }

    fn get_migration_path(&self, key: &str, from: u32, to: u32) -> Option<Vec<MigrationRule>> {
        if from == to {
            return Some(Vec::new());
        }
        if from > to {
            return None;
        }
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let edges = inner.rules.get(key)?;
        let mut dead_ends = BTreeSet::new();
        let mut path = Vec::new();
        if find_path(edges, from, to, &mut dead_ends, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn get_write_migration(&self, key: &str, version: u32) -> Option<MigrationRule> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .rules
            .get(key)?
            .iter()
            .find(|r| r.is_normalizer() && r.from_version == version)
            .cloned()
    }

    fn register_schema(&self, schema: Schema) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let versions = inner.schemas.entry(schema.key().to_owned()).or_default();
        if let Some(existing) = versions.get(&schema.version()) {
            if existing.body() == schema.body() {
                return Ok(());
            }
            return Err(Error::RegistrationConflict {
                key: schema.key().to_owned(),
                version: schema.version(),
            });
        }
        tracing::debug!(key = schema.key(), version = schema.version(), "schema registered");
        versions.insert(schema.version(), Arc::new(schema));
        Ok(())
    }
}

// Depth-first over edges in registration order. Edges only go forward, so
// the graph is acyclic; versions already proven unable to reach `to` are
// skipped.
fn find_path(
    edges: &[MigrationRule],
    from: u32,
    to: u32,
    dead_ends: &mut BTreeSet<u32>,
    path: &mut Vec<MigrationRule>,
) -> bool {
    if from == to {
        return true;
    }
    if dead_ends.contains(&from) {
        return false;
    }
    for edge in edges
        .iter()
        .filter(|e| e.from_version == from && !e.is_normalizer() && e.to_version <= to)
    {
        path.push(edge.clone());
        if find_path(edges, edge.to_version, to, dead_ends, path) {
            return true;
        }
        path.pop();
    }
    dead_ends.insert(from);
    false
}
