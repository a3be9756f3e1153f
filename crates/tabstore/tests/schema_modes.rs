//! Schema registry, migrations and modes exercised through `Kv`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tabstore::{
    Backend, Diagnostics, ErrorKind, JsonType, Kv, MemoryBackend, MemoryRegistry, Operation,
    SchemaBody, SchemaMode, SchemaRegistry,
};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Reading {
    celsius: f64,
}

/// Registry where `reading` moved from a bare number (v1) to an object (v2).
fn reading_registry(runs: Arc<AtomicUsize>) -> MemoryRegistry {
    MemoryRegistry::new()
        .with_schema("reading", 1, SchemaBody::of_type(JsonType::Number))
        .unwrap()
        .with_schema("reading", 2, SchemaBody::of_type(JsonType::Object))
        .unwrap()
        .with_migration("reading", 1, 2, move |v| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "celsius": v }))
        })
        .unwrap()
}

#[test]
fn count_scenario_end_to_end() {
    let backend = MemoryBackend::new();
    let registry = Arc::new(MemoryRegistry::new());
    let kv = Kv::builder(backend.clone())
        .namespace("ns")
        .registry(registry.clone())
        .build()
        .unwrap();

    kv.save("count", &7).unwrap();
    assert_eq!(
        backend.get_item("ns:count").unwrap().as_deref(),
        Some(r#"{"version":0,"payload":"7"}"#)
    );

    registry
        .register("count", 1, SchemaBody::of_type(JsonType::Number))
        .unwrap();
    // Unversioned data that fits the new schema is still readable.
    assert_eq!(kv.get_or("count", 0), 7);

    kv.save("count", &9).unwrap();
    assert_eq!(
        backend.get_item("ns:count").unwrap().as_deref(),
        Some(r#"{"version":1,"payload":9}"#)
    );
}

#[test]
fn migration_runs_once_and_is_written_back() {
    let backend = MemoryBackend::new();
    backend
        .set_item("app:reading", r#"{"version":1,"payload":21.5}"#)
        .unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let kv = Kv::builder(backend.clone())
        .namespace("app")
        .registry(Arc::new(reading_registry(runs.clone())))
        .build()
        .unwrap();

    let notified = Arc::new(AtomicUsize::new(0));
    let n = notified.clone();
    let _sub = kv.subscribe("reading", move || {
        n.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..3 {
        assert_eq!(
            kv.load::<Reading>("reading").unwrap(),
            Some(Reading { celsius: 21.5 })
        );
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(
        backend.get_item("app:reading").unwrap().as_deref(),
        Some(r#"{"version":2,"payload":{"celsius":21.5}}"#)
    );
}

#[test]
fn write_back_can_be_disabled() {
    let backend = MemoryBackend::new();
    let stored = r#"{"version":1,"payload":3.0}"#;
    backend.set_item("app:reading", stored).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let kv = Kv::builder(backend.clone())
        .namespace("app")
        .write_back_on_read(false)
        .registry(Arc::new(reading_registry(runs.clone())))
        .build()
        .unwrap();

    kv.load::<Reading>("reading").unwrap();
    kv.load::<Reading>("reading").unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(backend.get_item("app:reading").unwrap().as_deref(), Some(stored));
}

#[test]
fn missing_path_substitutes_default_and_records() {
    let backend = MemoryBackend::new();
    backend
        .set_item("app:reading", r#"{"version":1,"payload":4}"#)
        .unwrap();
    let registry = MemoryRegistry::new()
        .with_schema("reading", 1, SchemaBody::of_type(JsonType::Number))
        .unwrap()
        .with_schema("reading", 3, SchemaBody::of_type(JsonType::Object))
        .unwrap();
    let diagnostics = Diagnostics::new();
    let kv = Kv::builder(backend.clone())
        .namespace("app")
        .registry(Arc::new(registry))
        .diagnostics(diagnostics.clone())
        .build()
        .unwrap();

    let fallback = Reading { celsius: -1.0 };
    let mut kind = None;
    let value = kv.get_or_report("reading", fallback, |e| kind = Some(e.kind()));

    assert_eq!(value, Reading { celsius: -1.0 });
    assert_eq!(kind, Some(ErrorKind::MigrationPathNotFound));
    let recorded = diagnostics.last().unwrap();
    assert_eq!(recorded.op, Operation::Read);
    assert_eq!(recorded.key, "reading");
    assert_eq!(recorded.kind, ErrorKind::MigrationPathNotFound);
    // Nothing was rewritten.
    assert_eq!(
        backend.get_item("app:reading").unwrap().as_deref(),
        Some(r#"{"version":1,"payload":4}"#)
    );
}

#[test]
fn strict_mode_gates_described_keys() {
    let backend = MemoryBackend::new();
    backend
        .set_item("app:count", r#"{"version":0,"payload":"5"}"#)
        .unwrap();
    let registry = MemoryRegistry::new()
        .with_schema("count", 1, SchemaBody::of_type(JsonType::Integer))
        .unwrap();
    let kv = Kv::builder(backend)
        .namespace("app")
        .mode(SchemaMode::Strict)
        .registry(Arc::new(registry))
        .build()
        .unwrap();

    let err = kv.load::<i64>("count").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaNotFound);

    let err = kv.save_versioned("count", &1, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteSchemaRequired);

    kv.save("count", &6).unwrap();
    assert_eq!(kv.load::<i64>("count").unwrap(), Some(6));

    // Writes of keys nobody described degrade to the codec path, even when
    // a version is pinned, but reading them back is still gated.
    kv.save("note", "free text").unwrap();
    assert_eq!(
        kv.snapshot("note").as_deref(),
        Some(r#"{"version":0,"payload":"\"free text\""}"#)
    );
    kv.save_versioned("free", &1, 3).unwrap();
    assert_eq!(
        kv.snapshot("free").as_deref(),
        Some(r#"{"version":0,"payload":"1"}"#)
    );

    let err = kv.load::<String>("note").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaNotFound);
    assert_eq!(kv.get_or("free", 0), 0);
    assert_eq!(kv.diagnostics().len(), 4);
}

#[test]
fn strict_read_of_undescribed_legacy_value_fails() {
    let backend = MemoryBackend::new();
    backend
        .set_item("app:note", r#"{"version":0,"payload":"\"hi\""}"#)
        .unwrap();
    let registry = MemoryRegistry::new()
        .with_schema("count", 1, SchemaBody::of_type(JsonType::Integer))
        .unwrap();
    let kv = Kv::builder(backend)
        .namespace("app")
        .mode(SchemaMode::Strict)
        .registry(Arc::new(registry))
        .build()
        .unwrap();

    let err = kv.load::<String>("note").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaNotFound);
    assert_eq!(kv.get_or("note", String::from("default")), "default");
}

#[test]
fn autoschema_locks_in_the_first_shape() {
    let kv = Kv::builder(MemoryBackend::new())
        .namespace("app")
        .mode(SchemaMode::Autoschema)
        .build()
        .unwrap();

    kv.save("prefs", &json!({ "theme": "dark" })).unwrap();
    assert_eq!(
        kv.snapshot("prefs").as_deref(),
        Some(r#"{"version":1,"payload":{"theme":"dark"}}"#)
    );

    let err = kv.save("prefs", &42).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);

    kv.save("prefs", &json!({ "theme": "light" })).unwrap();
    assert_eq!(
        kv.snapshot("prefs").as_deref(),
        Some(r#"{"version":1,"payload":{"theme":"light"}}"#)
    );
    let registry = kv.engine().registry().unwrap();
    assert_eq!(registry.get_latest_schema("prefs").unwrap().version(), 1);
}

#[test]
fn registry_loaded_from_toml() {
    let registry = MemoryRegistry::from_toml_str(
        r#"
        [[schema]]
        key = "count"
        version = 1
        body = { type = "integer", minimum = 0 }
        "#,
    )
    .unwrap();
    let kv = Kv::builder(MemoryBackend::new())
        .registry(Arc::new(registry))
        .build()
        .unwrap();

    kv.save("count", &3).unwrap();
    let err = kv.save("count", &-1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    assert_eq!(kv.get_or("count", 0), 3);
}
