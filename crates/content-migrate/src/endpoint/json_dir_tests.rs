//! Tests for the JSON directory endpoint.

use super::*;
use tempfile::TempDir;

fn user() -> ContentType {
    ContentType::new("User")
}

fn write_export(dir: &TempDir, name: &str, json: &str) {
    std::fs::write(dir.path().join(name), json).unwrap();
}

#[tokio::test]
async fn test_list_reads_type_file() {
    let dir = TempDir::new().unwrap();
    write_export(
        &dir,
        "User.json",
        r#"[
            {"reference": {"id": "u1", "name": "alice"}},
            {"reference": {"id": "u2", "name": "bob"}},
            {"reference": {"id": "u3", "name": "carol"}}
        ]"#,
    );
    let endpoint = JsonDirEndpoint::new(dir.path());
    let cancel = CancellationToken::new();

    let page = endpoint
        .list(&user(), PageRequest { page: 1, size: 2 }, &cancel)
        .await
        .unwrap();

    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].reference.id, "u3");
    assert!(!page.has_more);
}

#[tokio::test]
async fn test_missing_type_file_lists_empty() {
    let dir = TempDir::new().unwrap();
    let endpoint = JsonDirEndpoint::new(dir.path());
    let cancel = CancellationToken::new();

    let page = endpoint
        .list(&ContentType::new("Group"), PageRequest { page: 0, size: 10 }, &cancel)
        .await
        .unwrap();
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn test_corrupt_type_file_is_validation_error() {
    let dir = TempDir::new().unwrap();
    write_export(&dir, "User.json", "{not json");
    let endpoint = JsonDirEndpoint::new(dir.path());
    let cancel = CancellationToken::new();

    let err = endpoint
        .list(&user(), PageRequest { page: 0, size: 10 }, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_connect_requires_directory() {
    let dir = TempDir::new().unwrap();
    let endpoint = JsonDirEndpoint::new(dir.path().join("missing"));
    let cancel = CancellationToken::new();

    let err = endpoint.connect(&cancel).await.unwrap_err();
    assert!(matches!(err, Error::Unreachable(_)));
}

#[tokio::test]
async fn test_create_update_delete() {
    let dir = TempDir::new().unwrap();
    let endpoint = JsonDirEndpoint::new(dir.path());
    let cancel = CancellationToken::new();
    let source = ContentItem::new(ContentReference::new("u1", "alice", "Sales"));
    let mut payload = PublishPayload::from_item(user(), &source);

    let created = endpoint.create(&payload, &cancel).await.unwrap();
    assert_ne!(created.id, "u1");

    payload.name = "alice.b".to_string();
    endpoint.update(&created, &payload, &cancel).await.unwrap();
    let stored = endpoint.get(&user(), &created, &cancel).await.unwrap();
    assert_eq!(stored.reference.name, "alice.b");
    assert_eq!(stored.reference.location, "Sales");

    endpoint.delete(&user(), &created, &cancel).await.unwrap();
    assert!(endpoint.read_items(&user()).unwrap().is_empty());
}

#[tokio::test]
async fn test_find_matches_location_and_name() {
    let dir = TempDir::new().unwrap();
    let endpoint = JsonDirEndpoint::new(dir.path());
    let cancel = CancellationToken::new();
    let source = ContentItem::new(ContentReference::new("u1", "alice", "Sales"));
    let created = endpoint
        .create(&PublishPayload::from_item(user(), &source), &cancel)
        .await
        .unwrap();

    let found = endpoint.find(&user(), "Sales", "alice", &cancel).await.unwrap();
    assert_eq!(found, Some(created));
    assert!(endpoint.find(&user(), "Finance", "alice", &cancel).await.unwrap().is_none());
    assert!(endpoint
        .find(&ContentType::new("Group"), "Sales", "alice", &cancel)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_update_unknown_item_is_not_found() {
    let dir = TempDir::new().unwrap();
    let endpoint = JsonDirEndpoint::new(dir.path());
    let cancel = CancellationToken::new();
    let payload =
        PublishPayload::from_item(user(), &ContentItem::new(ContentReference::new("u1", "a", "")));

    let err = endpoint
        .update(&ContentReference::new("nope", "", ""), &payload, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_download_file() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("files")).unwrap();
    std::fs::write(dir.path().join("files").join("wb1"), b"twbx").unwrap();
    let endpoint = JsonDirEndpoint::new(dir.path());
    let cancel = CancellationToken::new();

    let mut sink: Vec<u8> = Vec::new();
    let written = endpoint
        .download_file(
            &ContentType::new("Workbook"),
            &ContentReference::new("wb1", "Sales", ""),
            &mut sink,
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(written, 4);
    assert_eq!(sink, b"twbx");
}

#[test]
fn test_unsafe_names_rejected() {
    let endpoint = JsonDirEndpoint::new("/tmp");
    assert!(endpoint.type_path(&ContentType::new("../etc")).is_err());
    assert!(endpoint.file_path("a/b").is_err());
}
