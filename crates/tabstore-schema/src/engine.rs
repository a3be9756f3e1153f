use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::Codec;
use crate::envelope::{Envelope, CODEC_VERSION};
use crate::error::{Error, Result};
use crate::registry::{MemoryRegistry, MigrationRule, Schema, SchemaRegistry};
use crate::validator::SchemaBody;

/// How strictly the registry is consulted on reads and writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaMode {
    /// Schemas are optional; values without one are codec-only.
    #[default]
    Default,
    /// Every read and write needs a schema once the key has any.
    Strict,
    /// Like `Default`, but a schema is inferred from the first value seen.
    Autoschema,
}

/// Outcome of the read path.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// The value, upgraded to the latest version when a migration ran.
    pub value: Value,
    /// Version `value` is now at.
    pub version: u32,
    /// Upgraded envelope the caller should persist, present only when a
    /// migration actually ran.
    pub rewrite: Option<String>,
}

/// Resolves decoders, validators and transforms for every read and write.
///
/// Reads migrate lazily: a value stored at an older version is upgraded
/// through the registry's migration path, validated against the latest
/// schema and handed back together with the envelope to write back. A value
/// already at the latest version never produces a rewrite, so upgrades
/// happen once.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tabstore_schema::{
///     Envelope, JsonCodec, JsonType, MemoryRegistry, MigrationEngine, SchemaBody, SchemaMode,
/// };
/// use serde_json::json;
///
/// let registry = MemoryRegistry::new();
/// registry.register("temp", 1, SchemaBody::of_type(JsonType::Number)).unwrap();
/// registry.register("temp", 2, SchemaBody::of_type(JsonType::Object)).unwrap();
/// registry.migration("temp", 1, 2, |v| Ok(json!({ "celsius": v }))).unwrap();
///
/// let engine = MigrationEngine::new(SchemaMode::Default, Some(Arc::new(registry))).unwrap();
///
/// let stored = Envelope::wrap(1, json!(21.5)).unwrap();
/// let decoded = engine.decode("temp", &stored, &JsonCodec).unwrap();
/// assert_eq!(decoded.value, json!({ "celsius": 21.5 }));
/// assert_eq!(decoded.version, 2);
/// assert!(decoded.rewrite.is_some());
/// ```
#[derive(Clone)]
pub struct MigrationEngine {
    mode: SchemaMode,
    registry: Option<Arc<dyn SchemaRegistry>>,
}

impl MigrationEngine {
    /// Create an engine.
    ///
    /// Strict mode without a registry is rejected. Autoschema without a
    /// registry gets a private in-memory one to record inferred schemas.
    pub fn new(mode: SchemaMode, registry: Option<Arc<dyn SchemaRegistry>>) -> Result<Self> {
        let registry = match (mode, registry) {
            (SchemaMode::Strict, None) => {
                return Err(Error::ModeConfigurationInvalid(
                    "strict mode requires a schema registry".into(),
                ))
            }
            (SchemaMode::Autoschema, None) => {
                Some(Arc::new(MemoryRegistry::new()) as Arc<dyn SchemaRegistry>)
            }
            (_, registry) => registry,
        };
        Ok(Self { mode, registry })
    }

    pub fn mode(&self) -> SchemaMode {
        self.mode
    }

    pub fn registry(&self) -> Option<&Arc<dyn SchemaRegistry>> {
        self.registry.as_ref()
    }

    /// Upgrade `value` from `stored_version` to `target_version`.
    ///
    /// Equal (or newer) stored versions are returned untouched; normalizers
    /// never run here.
    pub fn migrate(
        &self,
        key: &str,
        stored_version: u32,
        value: Value,
        target_version: u32,
    ) -> Result<Value> {
        if stored_version >= target_version {
            return Ok(value);
        }
        let path = self
            .registry
            .as_ref()
            .and_then(|r| r.get_migration_path(key, stored_version, target_version))
            .ok_or_else(|| Error::MigrationPathNotFound {
                key: key.to_owned(),
                from: stored_version,
                to: target_version,
            })?;
        self.apply_path(key, target_version, value, &path)
    }

    /// Run the read path on a stored string.
    pub fn decode(&self, key: &str, raw: &str, codec: &dyn Codec) -> Result<Decoded> {
        let envelope = Envelope::unwrap(raw)?;
        let stored = envelope.version;
        let value = match envelope.payload {
            Value::String(text) if stored == CODEC_VERSION => codec.decode(&text)?,
            payload => payload,
        };
        let unchanged = |value| Decoded {
            value,
            version: stored,
            rewrite: None,
        };

        let Some(registry) = &self.registry else {
            return Ok(unchanged(value));
        };

        let Some(latest) = registry.get_latest_schema(key) else {
            // No schema was ever registered for this key.
            match self.mode {
                SchemaMode::Strict => {
                    return Err(Error::SchemaNotFound {
                        key: key.to_owned(),
                        version: stored,
                    })
                }
                SchemaMode::Autoschema => self.infer(registry.as_ref(), key, &value),
                SchemaMode::Default => {}
            }
            return Ok(unchanged(value));
        };

        match registry.get_schema(key, stored) {
            Some(schema) => schema.check(&value)?,
            None if self.mode == SchemaMode::Strict => {
                return Err(Error::SchemaNotFound {
                    key: key.to_owned(),
                    version: stored,
                })
            }
            None => {}
        }

        let target = latest.version();
        if stored >= target {
            return Ok(unchanged(value));
        }

        let Some(path) = registry.get_migration_path(key, stored, target) else {
            if stored == CODEC_VERSION {
                // Unversioned data predating the schema is adopted as-is
                // when it already fits the latest shape.
                latest.check(&value)?;
                return Ok(unchanged(value));
            }
            return Err(Error::MigrationPathNotFound {
                key: key.to_owned(),
                from: stored,
                to: target,
            });
        };

        let migrated = self.apply_path(key, target, value, &path)?;
        tracing::debug!(key, from = stored, to = target, "value migrated on read");
        let rewrite = Envelope::wrap(target, migrated.clone())?;
        Ok(Decoded {
            value: migrated,
            version: target,
            rewrite: Some(rewrite),
        })
    }

    /// Run the write path and return the string to persist.
    ///
    /// `requested_version` pins the envelope version; otherwise the latest
    /// schema's version (or 0 when the key has none) is used.
    pub fn encode(
        &self,
        key: &str,
        value: Value,
        requested_version: Option<u32>,
        codec: &dyn Codec,
    ) -> Result<String> {
        let Some(registry) = &self.registry else {
            return wrap_value(requested_version.unwrap_or(CODEC_VERSION), value, codec);
        };

        if self.mode == SchemaMode::Autoschema && !registry.has_schemas(key) {
            self.infer(registry.as_ref(), key, &value);
        }

        // Strict mode degrades to the codec path for keys nobody described,
        // whatever version was asked for.
        let undescribed = self.mode == SchemaMode::Strict && !registry.has_schemas(key);
        let target = match requested_version {
            _ if undescribed => CODEC_VERSION,
            Some(version) => version,
            None => registry
                .get_latest_schema(key)
                .map_or(CODEC_VERSION, |s| s.version()),
        };

        let schema = match target {
            CODEC_VERSION => None,
            version => registry.get_schema(key, version),
        };

        // Only blocks once the key has a schema somewhere; a key nobody ever
        // described still degrades to the codec path.
        if schema.is_none() && self.mode == SchemaMode::Strict && registry.has_schemas(key) {
            return Err(Error::WriteSchemaRequired {
                key: key.to_owned(),
                version: target,
            });
        }

        let value = match registry.get_write_migration(key, target) {
            Some(rule) => run_rule(key, &rule, value)?,
            None => value,
        };

        if let Some(schema) = &schema {
            schema.check(&value)?;
        }

        wrap_value(target, value, codec)
    }

    fn apply_path(
        &self,
        key: &str,
        target_version: u32,
        value: Value,
        path: &[MigrationRule],
    ) -> Result<Value> {
        let mut current = value;
        for rule in path {
            current = run_rule(key, rule, current)?;
        }

        let target_schema = self
            .registry
            .as_ref()
            .and_then(|r| r.get_schema(key, target_version));
        match target_schema {
            Some(schema) => schema.check(&current)?,
            None if self.mode == SchemaMode::Strict => {
                return Err(Error::SchemaNotFound {
                    key: key.to_owned(),
                    version: target_version,
                })
            }
            None => {}
        }
        Ok(current)
    }

    fn infer(&self, registry: &dyn SchemaRegistry, key: &str, value: &Value) {
        let registered = Schema::new(key, 1, SchemaBody::infer(value))
            .and_then(|schema| registry.register_schema(schema));
        match registered {
            Ok(()) => tracing::debug!(key, "schema inferred at v1"),
            // Lost a race with another registration; the registry's schema wins.
            Err(e) => tracing::debug!(key, error = %e, "schema inference skipped"),
        }
    }
}

fn run_rule(key: &str, rule: &MigrationRule, value: Value) -> Result<Value> {
    rule.apply(value).map_err(|reason| Error::MigrationFailed {
        key: key.to_owned(),
        from: rule.from_version,
        to: rule.to_version,
        reason,
    })
}

fn wrap_value(version: u32, value: Value, codec: &dyn Codec) -> Result<String> {
    if version == CODEC_VERSION {
        Envelope::wrap(CODEC_VERSION, Value::String(codec.encode(&value)?))
    } else {
        Envelope::wrap(version, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, StringCodec};
    use crate::error::ErrorKind;
    use crate::validator::JsonType;
    use serde_json::json;

    fn registry() -> Arc<MemoryRegistry> {
        Arc::new(MemoryRegistry::new())
    }

    fn engine(mode: SchemaMode, reg: &Arc<MemoryRegistry>) -> MigrationEngine {
        MigrationEngine::new(mode, Some(reg.clone() as Arc<dyn SchemaRegistry>)).unwrap()
    }

    fn number() -> SchemaBody {
        SchemaBody::of_type(JsonType::Number)
    }

    #[test]
    fn strict_without_registry_is_rejected() {
        let err = MigrationEngine::new(SchemaMode::Strict, None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ModeConfigurationInvalid);
    }

    #[test]
    fn default_without_registry_uses_codec() {
        let engine = MigrationEngine::new(SchemaMode::Default, None).unwrap();
        let raw = engine.encode("count", json!(7), None, &JsonCodec).unwrap();
        assert_eq!(raw, r#"{"version":0,"payload":"7"}"#);
        let decoded = engine.decode("count", &raw, &JsonCodec).unwrap();
        assert_eq!(decoded.value, json!(7));
        assert_eq!(decoded.version, 0);
    }

    #[test]
    fn write_uses_latest_schema() {
        let reg = registry();
        let engine = engine(SchemaMode::Default, &reg);
        assert_eq!(
            engine.encode("count", json!(7), None, &JsonCodec).unwrap(),
            r#"{"version":0,"payload":"7"}"#
        );
        reg.register("count", 1, number()).unwrap();
        assert_eq!(
            engine.encode("count", json!(9), None, &JsonCodec).unwrap(),
            r#"{"version":1,"payload":9}"#
        );
    }

    #[test]
    fn write_rejects_invalid_value() {
        let reg = registry();
        reg.register("count", 1, number()).unwrap();
        let err = engine(SchemaMode::Default, &reg)
            .encode("count", json!("nine"), None, &JsonCodec)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn normalizer_runs_on_write_only() {
        let reg = registry();
        reg.register("name", 1, SchemaBody::of_type(JsonType::String))
            .unwrap();
        reg.normalizer("name", 1, |v| {
            Ok(json!(v.as_str().unwrap_or_default().trim().to_lowercase()))
        })
        .unwrap();
        let engine = engine(SchemaMode::Default, &reg);

        let raw = engine.encode("name", json!("  Ada "), None, &JsonCodec).unwrap();
        assert_eq!(raw, r#"{"version":1,"payload":"ada"}"#);

        let stored = Envelope::wrap(1, json!("  Raw ")).unwrap();
        let decoded = engine.decode("name", &stored, &JsonCodec).unwrap();
        assert_eq!(decoded.value, json!("  Raw "));
        assert!(decoded.rewrite.is_none());
    }

    #[test]
    fn failing_normalizer_aborts_write() {
        let reg = registry();
        reg.register("k", 1, number()).unwrap();
        reg.normalizer("k", 1, |_| Err("nope".into())).unwrap();
        let err = engine(SchemaMode::Default, &reg)
            .encode("k", json!(1), None, &JsonCodec)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MigrationFailed);
    }

    #[test]
    fn migration_chain_on_read() {
        let reg = registry();
        reg.register("temp", 1, number()).unwrap();
        reg.register("temp", 3, SchemaBody::of_type(JsonType::Object)).unwrap();
        reg.migration("temp", 1, 2, |v| Ok(json!([v]))).unwrap();
        reg.migration("temp", 2, 3, |v| Ok(json!({ "readings": v }))).unwrap();
        let engine = engine(SchemaMode::Default, &reg);

        let stored = Envelope::wrap(1, json!(20)).unwrap();
        let decoded = engine.decode("temp", &stored, &JsonCodec).unwrap();
        assert_eq!(decoded.value, json!({ "readings": [20] }));
        assert_eq!(decoded.version, 3);
        assert_eq!(
            decoded.rewrite.as_deref(),
            Some(r#"{"version":3,"payload":{"readings":[20]}}"#)
        );

        // The rewritten envelope is already current.
        let again = engine
            .decode("temp", decoded.rewrite.as_deref().unwrap(), &JsonCodec)
            .unwrap();
        assert!(again.rewrite.is_none());
    }

    #[test]
    fn missing_path_is_reported() {
        let reg = registry();
        reg.register("k", 1, number()).unwrap();
        reg.register("k", 3, number()).unwrap();
        let stored = Envelope::wrap(1, json!(1)).unwrap();
        let err = engine(SchemaMode::Default, &reg)
            .decode("k", &stored, &JsonCodec)
            .unwrap_err();
        assert_eq!(
            err,
            Error::MigrationPathNotFound {
                key: "k".into(),
                from: 1,
                to: 3
            }
        );
    }

    #[test]
    fn migrated_value_must_match_target() {
        let reg = registry();
        reg.register("k", 1, number()).unwrap();
        reg.register("k", 2, number()).unwrap();
        reg.migration("k", 1, 2, |_| Ok(json!("oops"))).unwrap();
        let stored = Envelope::wrap(1, json!(1)).unwrap();
        let err = engine(SchemaMode::Default, &reg)
            .decode("k", &stored, &JsonCodec)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn failing_step_is_migration_failed() {
        let reg = registry();
        reg.migration("k", 1, 2, |_| Err("bad input".into())).unwrap();
        let err = engine(SchemaMode::Default, &reg)
            .migrate("k", 1, json!(1), 2)
            .unwrap_err();
        assert_eq!(
            err,
            Error::MigrationFailed {
                key: "k".into(),
                from: 1,
                to: 2,
                reason: "bad input".into()
            }
        );
    }

    #[test]
    fn migrate_never_goes_down() {
        let reg = registry();
        let engine = engine(SchemaMode::Default, &reg);
        assert_eq!(engine.migrate("k", 3, json!(1), 3).unwrap(), json!(1));
        assert_eq!(engine.migrate("k", 4, json!(1), 3).unwrap(), json!(1));
    }

    #[test]
    fn stored_value_validated_at_its_own_version() {
        let reg = registry();
        reg.register("k", 1, number()).unwrap();
        let stored = Envelope::wrap(1, json!("text")).unwrap();
        let err = engine(SchemaMode::Default, &reg)
            .decode("k", &stored, &JsonCodec)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn unversioned_value_adopted_by_latest_schema() {
        let reg = registry();
        reg.register("count", 1, number()).unwrap();
        let engine = engine(SchemaMode::Default, &reg);

        let decoded = engine
            .decode("count", r#"{"version":0,"payload":"7"}"#, &JsonCodec)
            .unwrap();
        assert_eq!(decoded.value, json!(7));
        assert!(decoded.rewrite.is_none());

        let err = engine
            .decode("count", r#"{"version":0,"payload":"\"seven\""}"#, &JsonCodec)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn explicit_zero_path_is_applied() {
        let reg = registry();
        reg.register("count", 1, SchemaBody::of_type(JsonType::Object)).unwrap();
        reg.migration("count", 0, 1, |v| Ok(json!({ "n": v }))).unwrap();
        let decoded = engine(SchemaMode::Default, &reg)
            .decode("count", r#"{"version":0,"payload":"7"}"#, &JsonCodec)
            .unwrap();
        assert_eq!(decoded.value, json!({ "n": 7 }));
        assert_eq!(decoded.version, 1);
        assert!(decoded.rewrite.is_some());
    }

    #[test]
    fn strict_read_needs_schema_for_stored_version() {
        let reg = registry();
        reg.register("k", 2, number()).unwrap();
        let engine = engine(SchemaMode::Strict, &reg);

        let stored = Envelope::wrap(1, json!(1)).unwrap();
        let err = engine.decode("k", &stored, &JsonCodec).unwrap_err();
        assert_eq!(
            err,
            Error::SchemaNotFound {
                key: "k".into(),
                version: 1
            }
        );
    }

    #[test]
    fn strict_write_needs_schema_for_requested_version() {
        let reg = registry();
        reg.register("k", 2, number()).unwrap();
        let engine = engine(SchemaMode::Strict, &reg);

        let err = engine.encode("k", json!(1), Some(1), &JsonCodec).unwrap_err();
        assert_eq!(
            err,
            Error::WriteSchemaRequired {
                key: "k".into(),
                version: 1
            }
        );
        assert!(engine.encode("k", json!(1), None, &JsonCodec).is_ok());
    }

    #[test]
    fn strict_write_degrades_for_undescribed_keys() {
        let reg = registry();
        reg.register("other", 1, number()).unwrap();
        let engine = engine(SchemaMode::Strict, &reg);

        let raw = engine.encode("free", json!("x"), None, &JsonCodec).unwrap();
        assert_eq!(raw, r#"{"version":0,"payload":"\"x\""}"#);

        // A pinned version is ignored too.
        let raw = engine.encode("free", json!(1), Some(3), &JsonCodec).unwrap();
        assert_eq!(raw, r#"{"version":0,"payload":"1"}"#);
    }

    #[test]
    fn strict_read_of_undescribed_key_fails() {
        let reg = registry();
        reg.register("other", 1, number()).unwrap();
        let engine = engine(SchemaMode::Strict, &reg);

        let err = engine
            .decode("free", r#"{"version":0,"payload":"\"x\""}"#, &JsonCodec)
            .unwrap_err();
        assert_eq!(
            err,
            Error::SchemaNotFound {
                key: "free".into(),
                version: 0
            }
        );

        let err = engine
            .decode("free", r#"{"version":2,"payload":5}"#, &JsonCodec)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaNotFound);
    }

    #[test]
    fn default_write_at_unregistered_version_is_unvalidated() {
        let reg = registry();
        reg.register("k", 1, number()).unwrap();
        let raw = engine(SchemaMode::Default, &reg)
            .encode("k", json!("x"), Some(5), &JsonCodec)
            .unwrap();
        assert_eq!(raw, r#"{"version":5,"payload":"x"}"#);
    }

    #[test]
    fn autoschema_infers_from_first_read() {
        let reg = registry();
        let engine = engine(SchemaMode::Autoschema, &reg);

        engine
            .decode("count", r#"{"version":0,"payload":"7"}"#, &JsonCodec)
            .unwrap();
        let inferred = reg.get_schema("count", 1).unwrap();
        assert_eq!(inferred.body(), &number());

        // The old codec value still reads; new writes land at v1.
        let decoded = engine
            .decode("count", r#"{"version":0,"payload":"7"}"#, &JsonCodec)
            .unwrap();
        assert_eq!(decoded.value, json!(7));
        assert_eq!(
            engine.encode("count", json!(8), None, &JsonCodec).unwrap(),
            r#"{"version":1,"payload":8}"#
        );
    }

    #[test]
    fn autoschema_rejects_incompatible_writer() {
        let reg = registry();
        let engine = engine(SchemaMode::Autoschema, &reg);

        engine.encode("title", json!("hello"), None, &JsonCodec).unwrap();
        let err = engine
            .encode("title", json!({ "text": "hello" }), None, &StringCodec)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn autoschema_without_registry_keeps_private_one() {
        let engine = MigrationEngine::new(SchemaMode::Autoschema, None).unwrap();
        engine.encode("k", json!(true), None, &JsonCodec).unwrap();
        let reg = engine.registry().unwrap();
        assert_eq!(reg.get_latest_schema("k").unwrap().version(), 1);
    }

    #[test]
    fn codec_failure_on_read() {
        let engine = MigrationEngine::new(SchemaMode::Default, None).unwrap();
        let err = engine
            .decode("k", r#"{"version":0,"payload":"{broken"}"#, &JsonCodec)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CodecError);
    }

    #[test]
    fn invalid_envelope_on_read() {
        let engine = MigrationEngine::new(SchemaMode::Default, None).unwrap();
        let err = engine.decode("k", "7", &JsonCodec).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEnvelope);
    }
}
