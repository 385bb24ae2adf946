mod common;

use std::sync::atomic::Ordering;

use chrono::Utc;
use common::{assert_sentinel_invariant, date, read_ids, FakeApi};
use idwatch_core::{EntityDescriptor, EntityType};
use idwatch_storage::{ListOrder, SnapshotStore};
use idwatch_sync::{run_dump, PipelineError};
use tempfile::tempdir;
use uuid::Uuid;

fn setup(dir: &std::path::Path, entity: EntityType) -> (EntityDescriptor, SnapshotStore) {
    let descriptor = EntityDescriptor::with_defaults(entity, dir, 2);
    let store = SnapshotStore::new(&descriptor.data_path);
    (descriptor, store)
}

#[tokio::test]
async fn dump_streams_all_pages_and_seals_the_file() {
    let dir = tempdir().unwrap();
    let (descriptor, store) = setup(dir.path(), EntityType::Person);
    let api = FakeApi::with_ids(EntityType::Person, &["a", "b", "c", "d", "e"]);
    let today = date("2024-01-02");

    let outcome = run_dump(&api, &store, &descriptor, Uuid::new_v4(), today).await.unwrap();
    assert_eq!((outcome.processed, outcome.total), (5, 5));
    assert_eq!(outcome.path, store.dump_path(today));
    assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 3);
    assert_eq!(read_ids(&outcome.path, 0), vec!["a", "b", "c", "d", "e"]);

    let sealed = store.read_sentinel(&outcome.path).unwrap();
    assert!(sealed <= Utc::now());
    assert_eq!(store.list_valid_dumps(ListOrder::Ascending).len(), 1);
    assert!(!store.root().join(".dump-in-progress").exists());
    assert_sentinel_invariant(store.root());
}

#[tokio::test]
async fn short_fetch_leaves_no_dump() {
    let dir = tempdir().unwrap();
    let (descriptor, store) = setup(dir.path(), EntityType::Item);
    let ids: Vec<String> = (0..80).map(|i| format!("id{i:03}")).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let mut api = FakeApi::with_ids(EntityType::Item, &refs);
    api.page_size = 25;
    api.reported_total = Some(100);

    let err = run_dump(&api, &store, &descriptor, Uuid::new_v4(), date("2024-01-02"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::IncompleteFetch { processed: 80, total: 100 }));
    assert!(!store.dump_path(date("2024-01-02")).exists());
    assert!(store.list_valid_dumps(ListOrder::Ascending).is_empty());
    assert_sentinel_invariant(store.root());
}

#[tokio::test]
async fn shrinking_count_on_later_pages_does_not_hide_a_short_dump() {
    let dir = tempdir().unwrap();
    let (descriptor, store) = setup(dir.path(), EntityType::Item);
    let mut api = FakeApi::with_ids(EntityType::Item, &["a", "b", "c", "d"]);
    api.first_page_total = Some(100);

    let err = run_dump(&api, &store, &descriptor, Uuid::new_v4(), date("2024-01-02"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::IncompleteFetch { processed: 4, total: 100 }));
    assert!(!store.dump_path(date("2024-01-02")).exists());
    assert_sentinel_invariant(store.root());
}

#[tokio::test]
async fn fetch_failure_discards_partial_output() {
    let dir = tempdir().unwrap();
    let (descriptor, store) = setup(dir.path(), EntityType::Organization);
    let api = FakeApi::with_ids(EntityType::Organization, &["a", "b", "c"]);
    api.failing_fetches.store(1, Ordering::SeqCst);

    let err = run_dump(&api, &store, &descriptor, Uuid::new_v4(), date("2024-01-02"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Api(_)));
    assert!(err.is_retryable());
    assert!(!store.dump_path(date("2024-01-02")).exists());
    assert_sentinel_invariant(store.root());
}

#[tokio::test]
async fn second_dump_on_the_same_day_is_refused() {
    let dir = tempdir().unwrap();
    let (descriptor, store) = setup(dir.path(), EntityType::Person);
    let api = FakeApi::with_ids(EntityType::Person, &["a"]);
    let today = date("2024-01-02");

    run_dump(&api, &store, &descriptor, Uuid::new_v4(), today).await.unwrap();
    let err = run_dump(&api, &store, &descriptor, Uuid::new_v4(), today).await.unwrap_err();
    assert!(matches!(err, PipelineError::DumpExists { .. }));
    assert!(!err.is_retryable());
    assert_eq!(read_ids(&store.dump_path(today), 0), vec!["a"]);
}

#[tokio::test]
async fn crashed_dump_from_earlier_is_replaced() {
    let dir = tempdir().unwrap();
    let (descriptor, store) = setup(dir.path(), EntityType::Person);
    let today = date("2024-01-02");
    store.ensure_root().unwrap();
    std::fs::write(store.dump_path(today), b"truncated").unwrap();

    let api = FakeApi::with_ids(EntityType::Person, &["a", "b"]);
    let outcome = run_dump(&api, &store, &descriptor, Uuid::new_v4(), today).await.unwrap();
    assert_eq!(read_ids(&outcome.path, 0), vec!["a", "b"]);
}

#[tokio::test]
async fn out_of_order_ids_are_rejected_at_creation() {
    let dir = tempdir().unwrap();
    let (descriptor, store) = setup(dir.path(), EntityType::Item);
    let api = FakeApi::with_ids(EntityType::Item, &["a", "c", "b"]);

    let err = run_dump(&api, &store, &descriptor, Uuid::new_v4(), date("2024-01-02"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnsortedSnapshot { .. }));
    assert!(store.list_valid_dumps(ListOrder::Ascending).is_empty());
    assert_sentinel_invariant(store.root());
}

#[tokio::test]
async fn missing_query_fails_before_any_fetch() {
    let dir = tempdir().unwrap();
    let (mut descriptor, store) = setup(dir.path(), EntityType::Item);
    descriptor.query = " ".into();
    let api = FakeApi::with_ids(EntityType::Item, &["a"]);

    let err = run_dump(&api, &store, &descriptor, Uuid::new_v4(), date("2024-01-02"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
    assert_eq!(api.fetch_calls.load(Ordering::SeqCst), 0);
    assert!(!store.root().exists());
}
