//! End-to-end scenarios exercising `Collection`'s public surface: the
//! round-trip/delete/delete-all/TTL/persistence properties, plus the
//! label-offset-collision regression and the duplicate-index conflict
//! policy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use openviking_core::collection::{Collection, CollectionOptions, UpsertRecord};
use openviking_core::config::LifecycleConfig;
use openviking_core::filter::{CondValue, Filter};
use openviking_core::index::{IndexType, VectorIndexParams};
use openviking_core::schema::{CollectionMeta, FieldSpec, FieldType, ScalarValue};
use openviking_core::vector::Distance;

fn docs_schema() -> CollectionMeta {
    CollectionMeta::new(
        "docs",
        vec![
            FieldSpec::new("doc_id", FieldType::String).primary_key(),
            FieldSpec::new("embedding", FieldType::Vector).with_dim(4),
            FieldSpec::new("category", FieldType::String),
            FieldSpec::new("rating", FieldType::Int64),
        ],
    )
    .unwrap()
}

fn flat_l2_params() -> VectorIndexParams {
    VectorIndexParams {
        distance: Distance::L2,
        normalize: false,
        enable_sparse: false,
        sparse_alpha: 0.5,
        quantization: None,
    }
}

fn upsert_one(id: &str, dense: Vec<f32>, category: &str, rating: i64) -> UpsertRecord {
    let mut fields = BTreeMap::new();
    fields.insert("doc_id".to_string(), json!(id));
    fields.insert("category".to_string(), json!(category));
    fields.insert("rating".to_string(), json!(rating));
    UpsertRecord { fields, dense: Some(dense), sparse: None }
}

/// Property 1: round-trip. A fetched record's coerced fields match what
/// was upserted, modulo coercion (the int stays an int64, etc).
#[test]
fn round_trip_fetch_matches_upsert() {
    let collection = Collection::open_volatile(docs_schema(), CollectionOptions::default()).unwrap();
    let pks = collection
        .upsert(vec![upsert_one("a", vec![1.0, 0.0, 0.0, 0.0], "electronics", 42)], 0)
        .unwrap();
    assert_eq!(pks, vec![ScalarValue::String("a".into())]);

    let fetched = collection.fetch(&pks).unwrap();
    assert!(fetched.ids_not_exist.is_empty());
    let record = fetched.records[0].as_ref().unwrap();
    assert_eq!(record.fields.get("category"), Some(&ScalarValue::String("electronics".into())));
    assert_eq!(record.fields.get("rating"), Some(&ScalarValue::Int64(42)));
}

/// Property 2: delete removes the record from both fetch and any index's
/// search results.
#[test]
fn delete_removes_from_fetch_and_search() {
    let collection = Collection::open_volatile(docs_schema(), CollectionOptions::default()).unwrap();
    collection
        .create_index("main", IndexType::Flat, flat_l2_params(), vec!["category".into()])
        .unwrap();
    let pks = collection
        .upsert(
            vec![
                upsert_one("a", vec![1.0, 0.0, 0.0, 0.0], "electronics", 1),
                upsert_one("b", vec![0.0, 1.0, 0.0, 0.0], "electronics", 2),
            ],
            0,
        )
        .unwrap();

    collection.delete(&pks[..1]).unwrap();

    let fetched = collection.fetch(&pks[..1]).unwrap();
    assert!(fetched.records[0].is_none());
    assert_eq!(fetched.ids_not_exist, vec![pks[0].clone()]);

    let results = collection
        .search_by_vector("main", Some(vec![1.0, 0.0, 0.0, 0.0]), None, 10, 0, None, None)
        .unwrap();
    assert!(results.iter().all(|r| r.id != pks[0]));
}

/// Property 3: delete_all keeps every index registered with the same
/// metadata, empties them, and accepts new upserts afterward.
#[test]
fn delete_all_preserves_index_metadata_and_accepts_new_upserts() {
    let collection = Collection::open_volatile(docs_schema(), CollectionOptions::default()).unwrap();
    collection
        .create_index("main", IndexType::Flat, flat_l2_params(), vec!["category".into()])
        .unwrap();
    collection
        .upsert(vec![upsert_one("a", vec![1.0, 0.0, 0.0, 0.0], "electronics", 1)], 0)
        .unwrap();

    collection.delete_all().unwrap();

    let count = collection.aggregate("main", openviking_core::index::AggregateOp::Count { field: None, cond: None });
    match count {
        openviking_core::index::AggregateResult::Total(n) => assert_eq!(n, 0),
        _ => panic!("expected total"),
    }

    // The index still exists under the same name and accepts new writes.
    let pks = collection
        .upsert(vec![upsert_one("b", vec![0.0, 1.0, 0.0, 0.0], "home", 2)], 0)
        .unwrap();
    assert_eq!(pks.len(), 1);
    let results = collection
        .search_by_vector("main", Some(vec![0.0, 1.0, 0.0, 0.0]), None, 10, 0, None, None)
        .unwrap();
    assert_eq!(results.len(), 1);
}

/// Property 4 / S5: a record upserted with a short TTL disappears from
/// aggregate count and search once the scheduler's TTL sweep has run.
#[test]
fn ttl_expiration_removes_record_after_sweep() {
    let collection = Collection::open_volatile(docs_schema(), CollectionOptions::default()).unwrap();
    collection
        .create_index("main", IndexType::Flat, flat_l2_params(), vec![])
        .unwrap();
    collection
        .upsert(vec![upsert_one("a", vec![1.0, 0.0, 0.0, 0.0], "electronics", 1)], 1)
        .unwrap();

    collection.start_background(LifecycleConfig { ttl_cleanup_seconds: 1, index_maintenance_seconds: 1 });
    std::thread::sleep(Duration::from_millis(2_500));

    let count = collection.aggregate("main", openviking_core::index::AggregateOp::Count { field: None, cond: None });
    match count {
        openviking_core::index::AggregateResult::Total(n) => assert_eq!(n, 0),
        _ => panic!("expected total"),
    }
}

/// S2: persisting an index, closing the collection and reopening it from
/// disk reproduces the identical ordered result for the same query.
#[test]
fn persistence_round_trip_reproduces_ordered_results() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("docs");

    let collection = Collection::open_persistent(&root, Some(docs_schema()), CollectionOptions::default()).unwrap();
    collection
        .create_index("main", IndexType::Flat, flat_l2_params(), vec!["category".into()])
        .unwrap();
    collection
        .upsert(
            vec![
                upsert_one("a", vec![1.0, 0.0, 0.0, 0.0], "electronics", 1),
                upsert_one("b", vec![0.0, 1.0, 0.0, 0.0], "home", 2),
                upsert_one("c", vec![0.0, 0.0, 1.0, 0.0], "books", 3),
            ],
            0,
        )
        .unwrap();
    collection.persist_all().unwrap();

    let query = vec![1.0, 0.0, 0.0, 0.0];
    let before = collection
        .search_by_vector("main", Some(query.clone()), None, 3, 0, None, None)
        .unwrap();
    collection.close().unwrap();
    drop(collection);

    let reopened = Collection::open_persistent(&root, None, CollectionOptions::default()).unwrap();
    let after = reopened.search_by_vector("main", Some(query), None, 3, 0, None, None).unwrap();

    let before_ids: Vec<_> = before.iter().map(|r| r.id.clone()).collect();
    let after_ids: Vec<_> = after.iter().map(|r| r.id.clone()).collect();
    assert_eq!(before_ids, after_ids);
}

/// Property 10: deleting a label then inserting a new, distinct record
/// whose computed label happens to reuse the old one must not resurrect
/// the old record's fields on fetch or search.
#[test]
fn delete_then_reinsert_does_not_resurrect_old_record() {
    let collection = Collection::open_volatile(docs_schema(), CollectionOptions::default()).unwrap();
    collection
        .create_index("main", IndexType::Flat, flat_l2_params(), vec![])
        .unwrap();

    let pks = collection
        .upsert(vec![upsert_one("a", vec![1.0, 0.0, 0.0, 0.0], "electronics", 1)], 0)
        .unwrap();
    collection.delete(&pks).unwrap();

    // Same primary key reused for a distinct record's content: since label
    // is derived solely from the PK string, this is a legitimate re-upsert
    // rather than a collision, and must read back as the new content only.
    let new_pks = collection
        .upsert(vec![upsert_one("a", vec![0.0, 1.0, 0.0, 0.0], "home", 99)], 0)
        .unwrap();
    assert_eq!(new_pks, pks);

    let fetched = collection.fetch(&new_pks).unwrap();
    let record = fetched.records[0].as_ref().unwrap();
    assert_eq!(record.fields.get("category"), Some(&ScalarValue::String("home".into())));
    assert_eq!(record.dense, Some(vec![0.0, 1.0, 0.0, 0.0]));
}

/// Creating an index under a name that already exists fails without
/// touching existing state.
#[test]
fn create_index_duplicate_name_is_conflict() {
    let collection = Collection::open_volatile(docs_schema(), CollectionOptions::default()).unwrap();
    collection
        .create_index("main", IndexType::Flat, flat_l2_params(), vec![])
        .unwrap();
    let err = collection
        .create_index("main", IndexType::Flat, flat_l2_params(), vec![])
        .unwrap_err();
    assert_eq!(err.kind(), "Conflict");
}

/// S3/S4-style filter fixture, exercised end-to-end through `search_by_vector`'s filter parameter.
#[test]
fn nested_filter_narrows_search_results() {
    let collection = Collection::open_volatile(docs_schema(), CollectionOptions::default()).unwrap();
    collection
        .create_index("main", IndexType::Flat, flat_l2_params(), vec!["category".into(), "rating".into()])
        .unwrap();
    collection
        .upsert(
            vec![
                upsert_one("a", vec![1.0, 0.0, 0.0, 0.0], "electronics", 10),
                upsert_one("b", vec![0.9, 0.0, 0.0, 0.0], "electronics", 90),
                upsert_one("c", vec![0.8, 0.0, 0.0, 0.0], "home", 10),
            ],
            0,
        )
        .unwrap();

    let filter = Filter::And {
        conds: vec![
            Filter::Must {
                field: "category".into(),
                conds: vec![CondValue::Str("electronics".into())],
                para: None,
            },
            Filter::Range {
                field: "rating".into(),
                gt: Some(50.0),
                gte: None,
                lt: None,
                lte: None,
            },
        ],
    };

    let results = collection
        .search_by_vector("main", Some(vec![1.0, 0.0, 0.0, 0.0]), None, 10, 0, Some(filter), None)
        .unwrap();
    let ids: Vec<_> = results.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids, vec![ScalarValue::String("b".into())]);
}

/// Property 9: offset returns the `[o, o+k)` slice of the unsliced
/// `limit=o+k` query, exercised through `search_by_vector` this time
/// (not just the index engine directly).
#[test]
fn search_offset_matches_overfetch_slice() {
    let collection = Collection::open_volatile(docs_schema(), CollectionOptions::default()).unwrap();
    collection
        .create_index("main", IndexType::Flat, flat_l2_params(), vec![])
        .unwrap();
    let records: Vec<UpsertRecord> = (0..20)
        .map(|i| upsert_one(&format!("id{i}"), vec![i as f32, 0.0, 0.0, 0.0], "x", i))
        .collect();
    collection.upsert(records, 0).unwrap();

    let query = vec![0.0, 0.0, 0.0, 0.0];
    let full = collection
        .search_by_vector("main", Some(query.clone()), None, 10, 0, None, None)
        .unwrap();
    let sliced = collection
        .search_by_vector("main", Some(query), None, 4, 3, None, None)
        .unwrap();

    let full_ids: Vec<_> = full[3..7].iter().map(|r| r.id.clone()).collect();
    let sliced_ids: Vec<_> = sliced.iter().map(|r| r.id.clone()).collect();
    assert_eq!(sliced_ids, full_ids);
}

/// Auto-generated primary keys are echoed back as the reserved
/// `__auto_id__` field and as the returned primary key itself: when the
/// PK is auto-generated, the stable label is also the PK returned to
/// callers.
#[test]
fn auto_generated_primary_key_is_echoed_consistently() {
    let schema = CollectionMeta::new(
        "events",
        vec![
            FieldSpec::new(openviking_core::id::AUTO_ID_FIELD, FieldType::Int64).primary_key(),
            FieldSpec::new("embedding", FieldType::Vector).with_dim(2),
        ],
    )
    .unwrap();
    let collection = Collection::open_volatile(schema, CollectionOptions::default()).unwrap();
    let mut fields = BTreeMap::new();
    let rec = UpsertRecord { fields: { fields.insert("unused".into(), json!(null)); fields }, dense: Some(vec![1.0, 2.0]), sparse: None };
    let pks = collection.upsert(vec![rec], 0).unwrap();
    assert_eq!(pks.len(), 1);

    let fetched = collection.fetch(&pks).unwrap();
    let record = fetched.records[0].as_ref().unwrap();
    assert_eq!(record.fields.get(openviking_core::id::AUTO_ID_FIELD), Some(&pks[0]));
}

/// Property 6: crash safety. A version directory left behind by a
/// simulated crash (no `.write_done` sibling) is ignored on reopen; the
/// last fully-written version is mounted instead and the delta log tail
/// since that version is replayed to reach the same logical state.
#[test]
fn crash_safety_skips_incomplete_version_and_replays_tail() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("docs");

    let collection = Collection::open_persistent(&root, Some(docs_schema()), CollectionOptions::default()).unwrap();
    collection
        .create_index("main", IndexType::Flat, flat_l2_params(), vec![])
        .unwrap();
    collection
        .upsert(vec![upsert_one("a", vec![1.0, 0.0, 0.0, 0.0], "electronics", 1)], 0)
        .unwrap();
    collection.persist_all().unwrap();

    // A second upsert lands in the store's delta log and is applied to the
    // in-memory index, but is never flushed to disk before "crash".
    collection
        .upsert(vec![upsert_one("b", vec![0.0, 1.0, 0.0, 0.0], "home", 2)], 0)
        .unwrap();

    // Simulate a crash mid-persist: a version directory with no marker.
    let crashed_dir = root.join("index/main/versions/999999999999");
    std::fs::create_dir_all(&crashed_dir).unwrap();
    std::fs::write(crashed_dir.join("rows.json"), b"[]").unwrap();

    drop(collection);

    let reopened = Collection::open_persistent(&root, None, CollectionOptions::default()).unwrap();
    let fetched = reopened
        .fetch(&[ScalarValue::String("a".into()), ScalarValue::String("b".into())])
        .unwrap();
    assert!(fetched.records[0].is_some());
    assert!(fetched.records[1].is_some());

    let results = reopened
        .search_by_vector("main", Some(vec![0.0, 1.0, 0.0, 0.0]), None, 10, 0, None, None)
        .unwrap();
    assert!(results.iter().any(|r| r.id == ScalarValue::String("b".into())));
}

/// Shared for potential future use: builds `Arc<Collection>` in one line.
#[allow(dead_code)]
fn open(meta: CollectionMeta) -> Arc<Collection> {
    Collection::open_volatile(meta, CollectionOptions::default()).unwrap()
}
