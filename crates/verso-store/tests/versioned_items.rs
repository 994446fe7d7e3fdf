//! Integration tests for merge-upsert writes and latest-version reads.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use verso_core::prelude::*;
use verso_store::engine::TableName;
use verso_store::{
    ColumnarDatabase, DatasetItemSource, DatasetItemWrite, MergeUpsertEngine, StoreError, Sticky,
    VersionedRecordStore,
};

struct Fixture {
    db: Arc<ColumnarDatabase>,
    engine: MergeUpsertEngine,
    store: VersionedRecordStore,
}

impl Fixture {
    fn new() -> Self {
        let db = ColumnarDatabase::in_memory();
        Self {
            engine: MergeUpsertEngine::new(db.clone(), RetryPolicy::no_retry()),
            store: VersionedRecordStore::new(db.clone()),
            db,
        }
    }
}

fn scope(workspace: &str, user: &str) -> WorkspaceScope {
    WorkspaceScope::new(WorkspaceId::new(workspace).unwrap(), user)
}

fn manual(id: DatasetItemId, input: serde_json::Value) -> DatasetItemWrite {
    DatasetItemWrite::manual(id, input)
}

/// Generates `n` item ids sorted descending (the order reads return them in).
fn ids_desc(n: usize) -> Vec<DatasetItemId> {
    let mut ids: Vec<_> = (0..n).map(|_| DatasetItemId::generate()).collect();
    ids.sort_unstable_by(|a, b| b.cmp(a));
    ids
}

#[tokio::test]
async fn test_rewrite_replaces_fields_but_keeps_creation() {
    let fx = Fixture::new();
    let dataset = DatasetId::generate();
    let id = DatasetItemId::generate();

    let first = DatasetItemWrite {
        expected_output: Some(json!("X")),
        ..manual(id, json!({"q": 1}))
    };
    fx.engine
        .save(&scope("ws-a", "alice"), dataset, &[first])
        .await
        .unwrap();
    let original = fx.store.get(&scope("ws-a", "alice"), id).await.unwrap().unwrap();

    let second = DatasetItemWrite {
        source: DatasetItemSource::Sdk,
        expected_output: Some(json!("Y")),
        ..manual(id, json!({"q": 1}))
    };
    fx.engine
        .save(&scope("ws-a", "bob"), dataset, &[second])
        .await
        .unwrap();

    let current = fx.store.get(&scope("ws-a", "alice"), id).await.unwrap().unwrap();
    assert_eq!(current.source, DatasetItemSource::Sdk);
    assert_eq!(current.expected_output, Some(json!("Y")));
    assert_eq!(current.created_at, original.created_at);
    assert_eq!(current.created_by, "alice");
    assert_eq!(current.last_updated_by, "bob");
    assert!(current.last_updated_at > original.last_updated_at);
    assert_eq!(current.dataset_id, Sticky::Value(dataset));
    assert_eq!(fx.db.row_count(TableName::DatasetItems).await, 2);
}

#[tokio::test]
async fn test_get_returns_newest_of_many_versions() {
    let fx = Fixture::new();
    let ws = scope("ws-a", "alice");
    let dataset = DatasetId::generate();
    let id = DatasetItemId::generate();

    for n in 0..5 {
        fx.engine
            .save(&ws, dataset, &[manual(id, json!({"version": n}))])
            .await
            .unwrap();
    }

    let current = fx.store.get(&ws, id).await.unwrap().unwrap();
    assert_eq!(current.input, Some(json!({"version": 4})));
    assert_eq!(fx.db.row_count(TableName::DatasetItems).await, 5);
}

#[tokio::test]
async fn test_conflicting_dataset_is_marked_not_overwritten() {
    let fx = Fixture::new();
    let ws = scope("ws-a", "alice");
    let id = DatasetItemId::generate();
    let first_dataset = DatasetId::generate();
    let second_dataset = DatasetId::generate();

    fx.engine
        .save(&ws, first_dataset, &[manual(id, json!(1))])
        .await
        .unwrap();
    fx.engine
        .save(&ws, second_dataset, &[manual(id, json!(2))])
        .await
        .unwrap();

    let current = fx.store.get(&ws, id).await.unwrap().unwrap();
    assert!(current.dataset_id.is_conflict());
    assert_eq!(current.input, Some(json!(2)));
    assert_eq!(fx.db.row_count(TableName::DatasetItems).await, 2);

    // The conflicting version no longer belongs to either dataset's listing.
    let page = fx.store.get_page(&ws, second_dataset, 1, 10).await.unwrap();
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn test_cross_workspace_write_is_marked_and_reads_are_isolated() {
    let fx = Fixture::new();
    let dataset = DatasetId::generate();
    let id = DatasetItemId::generate();
    let owner = scope("ws-a", "alice");
    let intruder = scope("ws-b", "mallory");

    fx.engine.save(&owner, dataset, &[manual(id, json!("mine"))]).await.unwrap();
    fx.engine.save(&intruder, dataset, &[manual(id, json!("yours"))]).await.unwrap();

    // The newest version carries a conflicting workspace, so neither side sees it;
    // the owner still sees its own latest version.
    assert!(fx.store.get(&intruder, id).await.unwrap().is_none());
    let owned = fx.store.get(&owner, id).await.unwrap().unwrap();
    assert_eq!(owned.input, Some(json!("mine")));

    let owners = fx.store.workspaces_of(&[id]).await.unwrap();
    assert_eq!(owners.len(), 1);
    assert!(owners[0].workspace_id.is_conflict());
}

#[tokio::test]
async fn test_get_from_other_workspace_is_absent() {
    let fx = Fixture::new();
    let id = DatasetItemId::generate();
    fx.engine
        .save(&scope("ws-a", "alice"), DatasetId::generate(), &[manual(id, json!(1))])
        .await
        .unwrap();

    assert!(fx.store.get(&scope("ws-b", "bob"), id).await.unwrap().is_none());
    assert!(fx
        .store
        .get(&scope("ws-a", "alice"), DatasetItemId::generate())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_empty_batch_and_empty_delete_are_noops() {
    let fx = Fixture::new();
    let ws = scope("ws-a", "alice");

    assert_eq!(fx.engine.save(&ws, DatasetId::generate(), &[]).await.unwrap(), 0);
    assert_eq!(fx.store.delete(&ws, &[]).await.unwrap(), 0);
    assert!(fx.store.workspaces_of(&[]).await.unwrap().is_empty());
    assert_eq!(fx.db.row_count(TableName::DatasetItems).await, 0);
}

#[tokio::test]
async fn test_invalid_item_rejects_whole_batch() {
    let fx = Fixture::new();
    let ws = scope("ws-a", "alice");
    let valid = manual(DatasetItemId::generate(), json!(1));
    let invalid = DatasetItemWrite {
        source: DatasetItemSource::Trace,
        ..manual(DatasetItemId::generate(), json!(2))
    };

    let err = fx
        .engine
        .save(&ws, DatasetId::generate(), &[valid, invalid])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation { .. }));
    assert_eq!(fx.db.row_count(TableName::DatasetItems).await, 0);
}

#[tokio::test]
async fn test_page_total_counts_distinct_items() {
    let fx = Fixture::new();
    let ws = scope("ws-a", "alice");
    let dataset = DatasetId::generate();
    let ids = ids_desc(7);

    let batch: Vec<_> = ids.iter().map(|id| manual(*id, json!("v1"))).collect();
    fx.engine.save(&ws, dataset, &batch).await.unwrap();
    // Second versions must not inflate the count.
    let rewrites: Vec<_> = ids[..3].iter().map(|id| manual(*id, json!("v2"))).collect();
    fx.engine.save(&ws, dataset, &rewrites).await.unwrap();
    // Items of another dataset and another workspace are not counted.
    fx.engine
        .save(&ws, DatasetId::generate(), &[manual(DatasetItemId::generate(), json!(0))])
        .await
        .unwrap();
    fx.engine
        .save(&scope("ws-b", "bob"), dataset, &[manual(DatasetItemId::generate(), json!(0))])
        .await
        .unwrap();

    for size in [1, 3, 10] {
        let page = fx.store.get_page(&ws, dataset, 1, size).await.unwrap();
        assert_eq!(page.total, 7, "total is independent of page size {size}");
    }

    let first = fx.store.get_page(&ws, dataset, 1, 3).await.unwrap();
    let first_ids: Vec<_> = first.content.iter().map(|i| i.id).collect();
    assert_eq!(first_ids, ids[..3].to_vec());
    assert_eq!(first.size, 3);
    assert!(first.content.iter().all(|i| i.input == Some(json!("v2"))));

    let last = fx.store.get_page(&ws, dataset, 3, 3).await.unwrap();
    assert_eq!(last.content.len(), 1);
    assert_eq!(last.content[0].id, ids[6]);

    let beyond = fx.store.get_page(&ws, dataset, 4, 3).await.unwrap();
    assert!(beyond.content.is_empty());
    assert_eq!(beyond.total, 7);
}

#[tokio::test]
async fn test_page_rejects_zero_page_or_size() {
    let fx = Fixture::new();
    let ws = scope("ws-a", "alice");
    let dataset = DatasetId::generate();

    assert!(matches!(
        fx.store.get_page(&ws, dataset, 0, 10).await,
        Err(StoreError::Validation { .. })
    ));
    assert!(matches!(
        fx.store.get_page(&ws, dataset, 1, 0).await,
        Err(StoreError::Validation { .. })
    ));
}

#[tokio::test]
async fn test_cursor_export_walks_five_items_by_two() {
    let fx = Fixture::new();
    let ws = scope("ws-a", "alice");
    let dataset = DatasetId::generate();
    let ids = ids_desc(5);
    let batch: Vec<_> = ids.iter().map(|id| manual(*id, json!({}))).collect();
    fx.engine.save(&ws, dataset, &batch).await.unwrap();

    let mut cursor = None;
    let mut seen = Vec::new();
    let mut call_sizes = Vec::new();
    loop {
        let chunk = fx.store.get_items_after(&ws, dataset, 2, cursor).await.unwrap();
        call_sizes.push(chunk.len());
        assert!(chunk.len() <= 2);
        let Some(last) = chunk.last() else { break };
        cursor = Some(last.id);
        seen.extend(chunk.iter().map(|i| i.id));
    }

    assert_eq!(call_sizes, vec![2, 2, 1, 0]);
    assert_eq!(seen, ids);
    assert!(seen.windows(2).all(|w| w[0] > w[1]), "strictly decreasing");
}

#[tokio::test]
async fn test_cursor_export_skips_items_inserted_above_cursor() {
    let fx = Fixture::new();
    let ws = scope("ws-a", "alice");
    let dataset = DatasetId::generate();
    let ids = ids_desc(4);
    let batch: Vec<_> = ids[1..].iter().map(|id| manual(*id, json!({}))).collect();
    fx.engine.save(&ws, dataset, &batch).await.unwrap();

    let first = fx.store.get_items_after(&ws, dataset, 1, None).await.unwrap();
    assert_eq!(first[0].id, ids[1]);

    // A concurrent insert above the cursor does not disturb forward traversal.
    fx.engine.save(&ws, dataset, &[manual(ids[0], json!({}))]).await.unwrap();
    let rest = fx
        .store
        .get_items_after(&ws, dataset, 10, Some(first[0].id))
        .await
        .unwrap();
    let rest_ids: Vec<_> = rest.iter().map(|i| i.id).collect();
    assert_eq!(rest_ids, ids[2..].to_vec());
}

#[tokio::test]
async fn test_delete_removes_every_version_in_scope() {
    let fx = Fixture::new();
    let ws = scope("ws-a", "alice");
    let dataset = DatasetId::generate();
    let ids = ids_desc(3);

    for _ in 0..2 {
        let batch: Vec<_> = ids.iter().map(|id| manual(*id, json!({}))).collect();
        fx.engine.save(&ws, dataset, &batch).await.unwrap();
    }

    // Another workspace cannot delete these items.
    assert_eq!(fx.store.delete(&scope("ws-b", "bob"), &ids).await.unwrap(), 0);

    let removed = fx.store.delete(&ws, &ids[..2]).await.unwrap();
    assert_eq!(removed, 4);
    for id in &ids[..2] {
        assert!(fx.store.get(&ws, *id).await.unwrap().is_none());
    }
    assert!(fx.store.get(&ws, ids[2]).await.unwrap().is_some());
    assert_eq!(fx.db.row_count(TableName::DatasetItems).await, 2);
}

#[tokio::test]
async fn test_concurrent_writers_converge_on_single_creator() {
    let fx = Fixture::new();
    let dataset = DatasetId::generate();
    let id = DatasetItemId::generate();

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let engine = fx.engine.clone();
            tokio::spawn(async move {
                let writer = scope("ws-a", &format!("writer-{n}"));
                engine.save(&writer, dataset, &[manual(id, json!(n))]).await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let versions = fx.db.row_count(TableName::DatasetItems).await;
    assert_eq!(versions, 8);

    let current = fx.store.get(&scope("ws-a", "reader"), id).await.unwrap().unwrap();
    assert!(current.created_by.starts_with("writer-"));
    assert_eq!(current.dataset_id, Sticky::Value(dataset));

    let writers: HashSet<_> = (0..8).map(|n| format!("writer-{n}")).collect();
    assert!(writers.contains(&current.last_updated_by));
}
