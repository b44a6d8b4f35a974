//! Manifest Assembler Integration Tests
//!
//! Combining committed group manifests: ordering, idempotence, and groups
//! that cannot be read.

mod common;

use clipforge::core::{AssemblyError, ManifestAssembler, RetryPolicy, StorageLayout};
use clipforge::domain::{GroupManifestRef, Split};
use std::time::Duration;

use common::{commit_pair_at, MemoryObjectStore};

const TS: &str = "20250101_120000_000";

fn manifest_ref(layout: &StorageLayout, group_id: &str, ts: &str) -> GroupManifestRef {
    GroupManifestRef {
        group_id: group_id.to_string(),
        timestamp: ts.to_string(),
        training_key: layout.manifest_key(group_id, Split::Training, ts),
        validation_key: layout.manifest_key(group_id, Split::Validation, ts),
    }
}

fn assembler(store: std::sync::Arc<MemoryObjectStore>) -> ManifestAssembler {
    ManifestAssembler::new(store, StorageLayout::default())
        .with_retry_policy(RetryPolicy::none(), Duration::from_secs(5))
}

#[tokio::test]
async fn test_combines_in_group_order() {
    let store = MemoryObjectStore::new();
    let layout = StorageLayout::default();
    commit_pair_at(&store, &layout, "g2", TS, 2, 1);
    commit_pair_at(&store, &layout, "g1", TS, 3, 1);

    let refs = vec![manifest_ref(&layout, "g2", TS), manifest_ref(&layout, "g1", TS)];
    let combined = assembler(store.clone()).assemble("ds1", &refs).await.unwrap();

    assert_eq!(combined.training_entries, 5);
    assert_eq!(combined.validation_entries, 2);
    assert_eq!(combined.groups_included, vec!["g2".to_string(), "g1".to_string()]);
    assert!(combined.groups_dropped.is_empty());
    assert_eq!(combined.training_uri, "mem://bucket/combined/ds1/combined_training.jsonl");

    let training = store.manifest_entries("combined/ds1/combined_training.jsonl");
    let uris: Vec<&str> = training.iter().map(|e| e.clip_uri.as_str()).collect();
    assert_eq!(
        uris,
        vec![
            "mem://bucket/g2/clips/t0.mp4",
            "mem://bucket/g2/clips/t1.mp4",
            "mem://bucket/g1/clips/t0.mp4",
            "mem://bucket/g1/clips/t1.mp4",
            "mem://bucket/g1/clips/t2.mp4",
        ]
    );
}

#[tokio::test]
async fn test_assembly_is_idempotent() {
    let store = MemoryObjectStore::new();
    let layout = StorageLayout::default();
    commit_pair_at(&store, &layout, "g1", TS, 3, 1);
    commit_pair_at(&store, &layout, "g2", TS, 1, 1);
    let refs = vec![manifest_ref(&layout, "g1", TS), manifest_ref(&layout, "g2", TS)];

    let asm = assembler(store.clone());
    let first = asm.assemble("ds1", &refs).await.unwrap();
    let first_bytes = store.get("combined/ds1/combined_training.jsonl").unwrap();

    let second = asm.assemble("ds1", &refs).await.unwrap();
    let second_bytes = store.get("combined/ds1/combined_training.jsonl").unwrap();

    assert_eq!(first, second);
    assert_eq!(first_bytes, second_bytes);
}

#[tokio::test]
async fn test_duplicate_group_counted_once() {
    let store = MemoryObjectStore::new();
    let layout = StorageLayout::default();
    commit_pair_at(&store, &layout, "g1", TS, 2, 1);
    let refs = vec![manifest_ref(&layout, "g1", TS), manifest_ref(&layout, "g1", TS)];

    let combined = assembler(store).assemble("ds1", &refs).await.unwrap();
    assert_eq!(combined.training_entries, 2);
    assert_eq!(combined.groups_included, vec!["g1".to_string()]);
}

#[tokio::test]
async fn test_unreadable_group_is_dropped_whole() {
    let store = MemoryObjectStore::new();
    let layout = StorageLayout::default();
    commit_pair_at(&store, &layout, "g1", TS, 2, 1);
    commit_pair_at(&store, &layout, "g2", TS, 4, 2);
    // g2's training file is readable, its validation file is not
    store.fail_reads_of(&layout.manifest_key("g2", Split::Validation, TS));

    let refs = vec![manifest_ref(&layout, "g1", TS), manifest_ref(&layout, "g2", TS)];
    let err = assembler(store.clone()).assemble("ds1", &refs).await.unwrap_err();

    let AssemblyError::PartialInput { combined } = err else {
        panic!("expected PartialInput");
    };
    assert_eq!(combined.groups_included, vec!["g1".to_string()]);
    assert_eq!(combined.groups_dropped.len(), 1);
    assert_eq!(combined.groups_dropped[0].group_id, "g2");

    // None of g2's training entries leaked into the output
    assert_eq!(combined.training_entries, 2);
    assert_eq!(store.manifest_entries("combined/ds1/combined_training.jsonl").len(), 2);
    assert_eq!(store.manifest_entries("combined/ds1/combined_validation.jsonl").len(), 1);
}

#[tokio::test]
async fn test_malformed_manifest_is_dropped() {
    let store = MemoryObjectStore::new();
    let layout = StorageLayout::default();
    commit_pair_at(&store, &layout, "g1", TS, 1, 1);
    store.put(&layout.manifest_key("g1", Split::Training, TS), "{not json}\n");

    let err = assembler(store)
        .assemble("ds1", &[manifest_ref(&layout, "g1", TS)])
        .await
        .unwrap_err();

    match err {
        AssemblyError::PartialInput { combined } => {
            assert!(combined.groups_included.is_empty());
            assert!(combined.groups_dropped[0].reason.contains("malformed"));
        }
        other => panic!("expected PartialInput, got {:?}", other),
    }
}

#[tokio::test]
async fn test_no_input() {
    let store = MemoryObjectStore::new();
    let err = assembler(store).assemble("ds1", &[]).await.unwrap_err();
    assert!(matches!(err, AssemblyError::NoInput));
}

#[tokio::test]
async fn test_locate_latest_pairs() {
    let store = MemoryObjectStore::new();
    let layout = StorageLayout::default();
    commit_pair_at(&store, &layout, "g1", "20250101_000000_000", 1, 1);
    commit_pair_at(&store, &layout, "g1", "20250102_000000_000", 2, 1);
    // Only half of a newer commit is visible
    store.put(&layout.manifest_key("g1", Split::Training, "20250103_000000_000"), "");
    store.put(&layout.manifest_key("g2", Split::Validation, TS), "");

    let groups = vec!["g1".to_string(), "g2".to_string(), "g3".to_string()];
    let (found, missing) = assembler(store).locate_latest(&groups).await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].group_id, "g1");
    assert_eq!(found[0].timestamp, "20250102_000000_000");

    let missing: Vec<&str> = missing.iter().map(|m| m.group_id.as_str()).collect();
    assert_eq!(missing, vec!["g2", "g3"]);
}
