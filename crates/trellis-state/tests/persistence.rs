//! File persistence round-trips through the store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use trellis_config::StateSection;
use trellis_state::{
    FilePersistence, Scope, ScopeIds, SetOptions, StatePersistence, StateStore,
};

fn file_store(dir: &TempDir) -> StateStore {
    StateStore::with_persistence(Arc::new(FilePersistence::new(dir.path()))).unwrap()
}

#[test]
fn test_roundtrip_global_and_session_entries() {
    let dir = TempDir::new().unwrap();
    let none = ScopeIds::none();
    let s1 = ScopeIds::session("s1");

    let original = file_store(&dir);
    original
        .set("a", json!(1), Scope::Global, &none, SetOptions::new())
        .unwrap();
    original
        .set(
            "b",
            json!({"nested": [1, 2]}),
            Scope::Global,
            &none,
            SetOptions::new().meta("origin", json!("test")),
        )
        .unwrap();
    original
        .set("c", json!("text"), Scope::Global, &none, SetOptions::new())
        .unwrap();
    original
        .set("c", json!("text v2"), Scope::Global, &none, SetOptions::new())
        .unwrap();
    original
        .set("x", json!(true), Scope::Session, &s1, SetOptions::new())
        .unwrap();
    original
        .set(
            "y",
            json!(null),
            Scope::Session,
            &s1,
            SetOptions::new().expires_in(Duration::from_secs(3600)),
        )
        .unwrap();
    // Run scope is never persisted.
    original
        .set("r", json!(0), Scope::Run, &ScopeIds::run("r1"), SetOptions::new())
        .unwrap();

    let reloaded = file_store(&dir);
    assert_eq!(reloaded.len(), 5);
    for (key, scope, ids) in [
        ("a", Scope::Global, &none),
        ("b", Scope::Global, &none),
        ("c", Scope::Global, &none),
        ("x", Scope::Session, &s1),
        ("y", Scope::Session, &s1),
    ] {
        let before = original.entry(key, scope, ids).unwrap().unwrap();
        let after = reloaded.entry(key, scope, ids).unwrap().unwrap();
        assert_eq!(before, after, "entry {key} changed across reload");
    }
    assert_eq!(
        reloaded
            .entry("c", Scope::Global, &none)
            .unwrap()
            .unwrap()
            .version,
        2
    );
    assert!(!reloaded.has("r", Scope::Run, &ScopeIds::run("r1")).unwrap());
}

#[test]
fn test_delete_and_cleanup_are_persisted() {
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir);
    store
        .set("g", json!(1), Scope::Global, &ScopeIds::none(), SetOptions::new())
        .unwrap();
    store
        .set("s", json!(1), Scope::Session, &ScopeIds::session("s1"), SetOptions::new())
        .unwrap();

    assert!(store.delete("g", Scope::Global, &ScopeIds::none()).unwrap());
    assert_eq!(store.cleanup_session("s1"), 1);

    let reloaded = file_store(&dir);
    assert!(reloaded.is_empty());

    let persistence = FilePersistence::new(dir.path());
    assert!(persistence.load(Scope::Global).unwrap().is_empty());
    assert!(persistence.load(Scope::Session).unwrap().is_empty());
}

#[test]
fn test_lookalike_keys_survive_reload_separately() {
    let dir = TempDir::new().unwrap();
    let none = ScopeIds::none();
    let store = file_store(&dir);
    store
        .set("session:X:doc", json!("GLOBAL"), Scope::Global, &none, SetOptions::new())
        .unwrap();
    store
        .set("doc", json!("x"), Scope::Session, &ScopeIds::session("X"), SetOptions::new())
        .unwrap();
    store
        .set("b:c", json!("s=a"), Scope::Session, &ScopeIds::session("a"), SetOptions::new())
        .unwrap();
    store
        .set("c", json!("s=a:b"), Scope::Session, &ScopeIds::session("a:b"), SetOptions::new())
        .unwrap();

    let reloaded = file_store(&dir);
    assert_eq!(reloaded.len(), 4);
    assert_eq!(
        reloaded.get("session:X:doc", Scope::Global, &none).unwrap(),
        Some(json!("GLOBAL"))
    );
    assert_eq!(
        reloaded.get("doc", Scope::Session, &ScopeIds::session("X")).unwrap(),
        Some(json!("x"))
    );
    assert_eq!(
        reloaded.get("c", Scope::Session, &ScopeIds::session("a:b")).unwrap(),
        Some(json!("s=a:b"))
    );
    assert_eq!(
        reloaded.get("b:c", Scope::Session, &ScopeIds::session("a")).unwrap(),
        Some(json!("s=a"))
    );

    let sessions = FilePersistence::new(dir.path()).load(Scope::Session).unwrap();
    assert!(sessions.contains_key("session:a%3Ab:c"));
    assert!(sessions.contains_key("session:a:b:c"));
}

#[test]
fn test_persistence_failure_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    // A regular file where the state directory should be.
    let blocker: PathBuf = dir.path().join("state");
    std::fs::write(&blocker, "not a directory").unwrap();

    let store =
        StateStore::with_persistence(Arc::new(FilePersistence::new(&blocker))).unwrap();
    store
        .set("k", json!(42), Scope::Global, &ScopeIds::none(), SetOptions::new())
        .unwrap();
    assert_eq!(
        store.get("k", Scope::Global, &ScopeIds::none()).unwrap(),
        Some(json!(42))
    );
}

#[test]
fn test_from_config_uses_persistence_dir() {
    let dir = TempDir::new().unwrap();
    let config = StateSection {
        persistence_dir: Some(dir.path().join("state")),
        sweep_interval_secs: None,
    };
    let store = StateStore::from_config(&config).unwrap();
    store
        .set("k", json!("v"), Scope::Global, &ScopeIds::none(), SetOptions::new())
        .unwrap();
    assert!(dir.path().join("state").join("global.json").is_file());

    let in_memory = StateStore::from_config(&StateSection::default()).unwrap();
    in_memory
        .set("k", json!("v"), Scope::Global, &ScopeIds::none(), SetOptions::new())
        .unwrap();
    assert!(in_memory.has("k", Scope::Global, &ScopeIds::none()).unwrap());
}
