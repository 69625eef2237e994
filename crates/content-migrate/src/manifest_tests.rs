//! Tests for the migration manifest.

use super::*;
use crate::error::ErrorClass;
use std::sync::Arc;

fn user_type() -> ContentType {
    ContentType::new("User")
}

fn source(id: &str) -> ContentReference {
    ContentReference::new(id, format!("user-{id}"), "")
}

fn dest(id: &str) -> ContentReference {
    ContentReference::new(format!("d-{id}"), format!("user-{id}"), "")
}

#[test]
fn test_load_missing_file_yields_empty_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = Manifest::load(dir.path().join("manifest.json")).unwrap();

    assert!(manifest.summary().is_empty());
    assert!(manifest.find_by_source(&user_type(), &source("1")).is_none());
}

#[test]
fn test_upsert_and_find_by_source() {
    let manifest = Manifest::in_memory();
    manifest
        .upsert(&user_type(), ManifestEntry::pending(source("1")))
        .unwrap();

    let entry = manifest.find_by_source(&user_type(), &source("1")).unwrap();
    assert_eq!(entry.status, EntryStatus::Pending);
    assert!(entry.destination.is_none());
}

#[test]
fn test_migrated_entry_requires_destination() {
    let manifest = Manifest::in_memory();
    let mut entry = ManifestEntry::pending(source("1"));
    entry.status = EntryStatus::Migrated;

    assert!(manifest.upsert(&user_type(), entry).is_err());
}

#[test]
fn test_migrated_entry_is_immutable() {
    let manifest = Manifest::in_memory();
    let entry = ManifestEntry::pending(source("1"));
    manifest.upsert(&user_type(), entry.clone()).unwrap();
    manifest
        .upsert(&user_type(), entry.clone().migrated(dest("1")))
        .unwrap();

    let again = manifest.upsert(&user_type(), entry.clone().restart());
    assert!(again.is_err());
    let other = manifest.upsert(&user_type(), entry.migrated(dest("2")));
    assert!(other.is_err());

    let stored = manifest.find_by_source(&user_type(), &source("1")).unwrap();
    assert_eq!(stored.destination, Some(dest("1")));
}

#[test]
fn test_failed_entry_can_restart() {
    let manifest = Manifest::in_memory();
    let entry = ManifestEntry::pending(source("1"));
    manifest.upsert(&user_type(), entry.clone()).unwrap();

    let error = ItemError::new("User", "1", &Error::Transient("timeout".to_string()));
    let failed = entry.failed(error);
    manifest.upsert(&user_type(), failed.clone()).unwrap();

    let restarted = failed.restart();
    assert_eq!(restarted.attempts, 1);
    manifest.upsert(&user_type(), restarted).unwrap();

    let stored = manifest.find_by_source(&user_type(), &source("1")).unwrap();
    assert_eq!(stored.status, EntryStatus::Pending);
    assert_eq!(
        stored.last_error.map(|e| e.class),
        Some(ErrorClass::Transient)
    );
}

#[test]
fn test_failed_cannot_jump_to_migrated() {
    let manifest = Manifest::in_memory();
    let entry = ManifestEntry::pending(source("1"));
    manifest.upsert(&user_type(), entry.clone()).unwrap();
    let failed = entry.failed(ItemError::new(
        "User",
        "1",
        &Error::Validation("bad".to_string()),
    ));
    manifest.upsert(&user_type(), failed.clone()).unwrap();

    assert!(manifest
        .upsert(&user_type(), failed.migrated(dest("1")))
        .is_err());
}

#[test]
fn test_upsert_keeps_created_at() {
    let manifest = Manifest::in_memory();
    let entry = ManifestEntry::pending(source("1"));
    let created = entry.created_at;
    manifest.upsert(&user_type(), entry.clone()).unwrap();

    let mut later = entry.skipped();
    later.created_at = Utc::now() + chrono::Duration::hours(1);
    manifest.upsert(&user_type(), later).unwrap();

    let stored = manifest.find_by_source(&user_type(), &source("1")).unwrap();
    assert_eq!(stored.created_at, created);
}

#[test]
fn test_destination_for_only_returns_migrated() {
    let manifest = Manifest::in_memory();
    manifest
        .upsert(&user_type(), ManifestEntry::pending(source("1")))
        .unwrap();
    assert!(manifest.destination_for(&user_type(), "1").is_none());

    manifest
        .upsert(
            &user_type(),
            ManifestEntry::pending(source("1")).migrated(dest("1")),
        )
        .unwrap();
    assert_eq!(manifest.destination_for(&user_type(), "1"), Some(dest("1")));
    assert!(manifest
        .destination_for(&ContentType::new("Group"), "1")
        .is_none());
}

#[test]
fn test_save_and_reload_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("manifest.json");

    let manifest = Manifest::load(&path).unwrap();
    manifest
        .upsert(
            &user_type(),
            ManifestEntry::pending(source("1")).migrated(dest("1")),
        )
        .unwrap();
    manifest
        .upsert(&user_type(), ManifestEntry::pending(source("2")))
        .unwrap();
    manifest.save().unwrap();
    assert_eq!(manifest.unsaved_changes(), 0);
    assert!(!path.with_extension("tmp").exists());

    let reloaded = Manifest::load(&path).unwrap();
    let counts = reloaded.summary()[&user_type()];
    assert_eq!(counts.migrated, 1);
    assert_eq!(counts.pending, 1);
    assert_eq!(reloaded.destination_for(&user_type(), "1"), Some(dest("1")));
}

#[test]
fn test_persisted_layout_is_keyed_by_type_then_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    let manifest = Manifest::load(&path).unwrap();
    manifest
        .upsert(&user_type(), ManifestEntry::pending(source("42")))
        .unwrap();
    manifest.save().unwrap();

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["version"], MANIFEST_VERSION);
    assert_eq!(raw["entries"]["User"]["42"]["status"], "pending");
}

#[test]
fn test_load_rejects_unknown_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    std::fs::write(&path, r#"{"version": 99, "entries": {}}"#).unwrap();

    let err = Manifest::load(&path).unwrap_err();
    assert!(matches!(err, Error::Manifest(_)));
}

#[test]
fn test_load_rejects_corrupt_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    std::fs::write(&path, "{not json").unwrap();

    assert!(Manifest::load(&path).is_err());
}

#[test]
fn test_checkpoint_saves_after_interval() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    let manifest = Manifest::load(&path).unwrap();

    manifest
        .upsert(&user_type(), ManifestEntry::pending(source("1")))
        .unwrap();
    assert!(!manifest.checkpoint(2).unwrap());
    assert!(!path.exists());

    manifest
        .upsert(&user_type(), ManifestEntry::pending(source("2")))
        .unwrap();
    assert!(manifest.checkpoint(2).unwrap());
    assert!(path.exists());
}

#[test]
fn test_concurrent_upserts_are_serialized() {
    let manifest = Arc::new(Manifest::in_memory());
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let manifest = Arc::clone(&manifest);
            std::thread::spawn(move || {
                for i in 0..50 {
                    let id = format!("{t}-{i}");
                    manifest
                        .upsert(&user_type(), ManifestEntry::pending(source(&id)))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(manifest.summary()[&user_type()].pending, 400);
    assert_eq!(manifest.unsaved_changes(), 400);
}

#[test]
fn test_status_transitions() {
    use EntryStatus::*;
    assert!(Pending.can_transition_to(Migrated));
    assert!(Pending.can_transition_to(Skipped));
    assert!(Pending.can_transition_to(Failed));
    assert!(Failed.can_transition_to(Pending));
    assert!(Skipped.can_transition_to(Pending));
    assert!(!Migrated.can_transition_to(Pending));
    assert!(!Failed.can_transition_to(Migrated));
}

#[test]
fn test_failed_save_keeps_changes_counted() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file where the parent directory should be.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    let manifest = Manifest::load(blocker.join("manifest.json")).unwrap();

    manifest
        .upsert(&user_type(), ManifestEntry::pending(source("1")))
        .unwrap();
    manifest
        .upsert(&user_type(), ManifestEntry::pending(source("2")))
        .unwrap();

    assert!(manifest.checkpoint(2).is_err());
    assert_eq!(manifest.unsaved_changes(), 2);
    assert!(manifest.checkpoint(2).is_err(), "next checkpoint retries");
}

#[test]
fn test_run_errors_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    let manifest = Manifest::load(&path).unwrap();

    manifest.add_errors([ItemError::new(
        "Group",
        "",
        &Error::Authentication("token expired".to_string()),
    )]);
    assert_eq!(manifest.unsaved_changes(), 1);
    manifest.save().unwrap();

    let reloaded = Manifest::load(&path).unwrap();
    let errors = reloaded.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, "MIG-013");
    assert_eq!(errors[0].class, ErrorClass::Configuration);
    assert_eq!(errors[0].content_type, "Group");
}

#[test]
fn test_manifest_without_errors_field_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.json");
    std::fs::write(&path, r#"{"version": 1, "entries": {}}"#).unwrap();

    let manifest = Manifest::load(&path).unwrap();
    assert!(manifest.errors().is_empty());
}
