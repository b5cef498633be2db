//! Flat (exact) index: brute-force KNN over all live rows via `rayon`,
//! optionally augmented with a sparse inverted index for hybrid scoring.
//!
//! This is the one place in the crate where a full-table scan is the
//! correct algorithm (exact KNN has no cheaper exact alternative), so
//! data-parallelism via `rayon` is the lever for bulk scan-heavy
//! operations.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::record::DeltaRecord;
use crate::schema::ScalarValue;
use crate::vector::normalize_in_place;

use super::{score_row, sorter_order_is_ascending, AggregateOp, AggregateResult, Index, IndexMeta, IndexedRow, ScoredLabel, SearchQuery};

pub struct FlatIndex {
    meta: IndexMeta,
    rows: DashMap<u64, IndexedRow>,
    ever_inserted: AtomicU64,
}

impl FlatIndex {
    pub fn new(meta: IndexMeta) -> Self {
        FlatIndex {
            meta,
            rows: DashMap::new(),
            ever_inserted: AtomicU64::new(0),
        }
    }

    pub fn from_rows(meta: IndexMeta, rows: Vec<IndexedRow>) -> Self {
        let index = FlatIndex::new(meta);
        for mut row in rows {
            if let Some(dense) = row.dense.as_mut() {
                if index.meta.vector_index.should_normalize() {
                    normalize_in_place(dense);
                }
            }
            index.ever_inserted.fetch_add(1, Ordering::SeqCst);
            index.rows.insert(row.label, row);
        }
        index
    }
}

impl Index for FlatIndex {
    fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    fn apply(&self, deltas: &[DeltaRecord]) -> Result<()> {
        for delta in deltas {
            match delta {
                DeltaRecord::Put {
                    version, label, fields, dense, sparse, ..
                } => {
                    let mut dense = dense.clone();
                    if let Some(d) = dense.as_mut() {
                        if self.meta.vector_index.should_normalize() {
                            normalize_in_place(d);
                        }
                    }
                    let is_new = !self.rows.contains_key(label);
                    self.rows.insert(
                        *label,
                        IndexedRow {
                            label: *label,
                            fields: fields.clone(),
                            dense,
                            sparse: sparse.clone(),
                        },
                    );
                    if is_new {
                        self.ever_inserted.fetch_add(1, Ordering::SeqCst);
                    }
                    self.meta.bump_version(*version);
                }
                DeltaRecord::Del { version, label, .. } => {
                    self.rows.remove(label);
                    self.meta.bump_version(*version);
                }
            }
        }
        Ok(())
    }

    fn need_rebuild(&self) -> bool {
        let ever = self.ever_inserted.load(Ordering::SeqCst);
        if ever == 0 {
            return false;
        }
        let live = self.rows.len() as f32;
        let ratio = 1.0 - (live / ever as f32);
        ratio >= self.meta.rebuild_threshold
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredLabel>> {
        let distance = self.meta.vector_index.distance;
        let mut normalized_query = query.clone();
        if self.meta.vector_index.should_normalize() {
            if let Some(d) = normalized_query.dense.as_mut() {
                normalize_in_place(d);
            }
        }

        let candidates: Vec<_> = self.rows.iter().map(|r| r.value().clone()).collect();
        let mut scored: Vec<ScoredLabel> = candidates
            .par_iter()
            .filter(|row| query.filter.as_ref().map(|f| f.matches(&row.fields)).unwrap_or(true))
            .filter_map(|row| {
                score_row(&normalized_query, row, distance, &self.meta.vector_index)
            })
            .collect();

        let better_is_smaller = query
            .filter
            .as_ref()
            .and_then(|f| f.find_sorter())
            .map(|s| sorter_order_is_ascending(s))
            .unwrap_or(distance.better_is_smaller());

        if better_is_smaller {
            scored.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
        } else {
            scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        }

        let take = query.limit.saturating_add(query.offset);
        scored.truncate(take);
        Ok(super::apply_offset(scored, query.offset))
    }

    fn aggregate(&self, op: &AggregateOp) -> Result<AggregateResult> {
        match op {
            AggregateOp::Count { field: None, cond } => {
                let total = self
                    .rows
                    .iter()
                    .filter(|r| cond.as_ref().map(|c| c.matches(&r.fields)).unwrap_or(true))
                    .count() as u64;
                Ok(AggregateResult::Total(total))
            }
            AggregateOp::Count { field: Some(field), cond } => {
                let mut groups: BTreeMap<String, u64> = BTreeMap::new();
                for row in self.rows.iter() {
                    if let Some(value) = row.value().fields.get(field) {
                        let key = scalar_group_key(value);
                        *groups.entry(key).or_insert(0) += 1;
                    }
                }
                if let Some(cond) = cond {
                    groups.retain(|_, count| {
                        let mut f = crate::schema::FieldMap::new();
                        f.insert("__count__".into(), ScalarValue::Int64(*count as i64));
                        cond.matches(&f)
                    });
                }
                Ok(AggregateResult::Grouped(groups))
            }
        }
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let rows: Vec<IndexedRow> = self.rows.iter().map(|r| r.value().clone()).collect();
        serde_json::to_vec(&rows).map_err(Error::from)
    }
}

fn scalar_group_key(value: &ScalarValue) -> String {
    match value {
        ScalarValue::String(s) | ScalarValue::Path(s) => s.clone(),
        ScalarValue::Int64(i) => i.to_string(),
        ScalarValue::Float32(f) => f.to_string(),
        ScalarValue::Bool(b) => b.to_string(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::index::{IndexType, VectorIndexParams};
    use crate::vector::Distance;

    fn meta(distance: Distance, enable_sparse: bool, sparse_alpha: f32) -> IndexMeta {
        IndexMeta::new(
            "idx",
            if enable_sparse { IndexType::FlatHybrid } else { IndexType::Flat },
            VectorIndexParams {
                distance,
                normalize: false,
                enable_sparse,
                sparse_alpha,
                quantization: None,
            },
            vec![],
        )
    }

    fn row(label: u64, dense: Vec<f32>, sparse: Option<(Vec<String>, Vec<f32>)>) -> IndexedRow {
        IndexedRow {
            label,
            fields: Default::default(),
            dense: Some(dense),
            sparse,
        }
    }

    #[test]
    fn s1_exact_recall_flat_l2() {
        let rows: Vec<IndexedRow> = (0..10)
            .map(|i| row(i, vec![i as f32, 0.0, 0.0, 0.0], None))
            .collect();
        let index = FlatIndex::from_rows(meta(Distance::L2, false, 0.0), rows);
        let mut q = SearchQuery::new(1, 0);
        q.dense = Some(vec![5.0, 0.0, 0.0, 0.0]);
        let results = index.search(&q).unwrap();
        assert_eq!(results[0].label, 5);
    }

    #[test]
    fn s6_hybrid_mix_order() {
        let rows = vec![
            row(1, vec![0.9, 0.0, 0.0, 0.0], Some((vec!["t1".into()], vec![0.1]))),
            row(2, vec![0.2, 0.0, 0.0, 0.0], Some((vec!["t1".into()], vec![1.0]))),
            row(3, vec![0.1, 0.0, 0.0, 0.0], Some((vec!["t1".into()], vec![0.8]))),
        ];
        let index = FlatIndex::from_rows(meta(Distance::Ip, true, 0.5), rows);
        let mut q = SearchQuery::new(3, 0);
        q.dense = Some(vec![1.0, 0.0, 0.0, 0.0]);
        q.sparse = Some((vec!["t1".into()], vec![1.0]));
        let results = index.search(&q).unwrap();
        let order: Vec<u64> = results.iter().map(|r| r.label).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn offset_correctness_matches_overfetch_slice() {
        let rows: Vec<IndexedRow> = (0..20)
            .map(|i| row(i, vec![i as f32, 0.0, 0.0, 0.0], None))
            .collect();
        let index = FlatIndex::from_rows(meta(Distance::L2, false, 0.0), rows);
        let mut q_full = SearchQuery::new(10, 0);
        q_full.dense = Some(vec![0.0, 0.0, 0.0, 0.0]);
        let full = index.search(&q_full).unwrap();

        let mut q_slice = SearchQuery::new(4, 3);
        q_slice.dense = Some(vec![0.0, 0.0, 0.0, 0.0]);
        let sliced = index.search(&q_slice).unwrap();

        assert_eq!(sliced, full[3..7]);
    }

    #[test]
    fn aggregate_count_total() {
        let rows: Vec<IndexedRow> = (0..5).map(|i| row(i, vec![0.0; 4], None)).collect();
        let index = FlatIndex::from_rows(meta(Distance::L2, false, 0.0), rows);
        let result = index.aggregate(&AggregateOp::Count { field: None, cond: None }).unwrap();
        match result {
            AggregateResult::Total(n) => assert_eq!(n, 5),
            _ => panic!("expected total"),
        }
    }

    #[test]
    fn aggregate_count_grouped_with_sorter_count_cond() {
        let mut rows: Vec<IndexedRow> = Vec::new();
        for (label, category) in [(0, "a"), (1, "a"), (2, "a"), (3, "b")] {
            let mut fields = crate::schema::FieldMap::new();
            fields.insert("category".into(), ScalarValue::String(category.into()));
            rows.push(IndexedRow { label, fields, dense: Some(vec![0.0; 4]), sparse: None });
        }
        let index = FlatIndex::from_rows(meta(Distance::L2, false, 0.0), rows);

        // §4.3 `sorter.count(field, {gt})` over the filter DSL: the bound
        // must reach the `cond` that discards groups failing it, not be
        // silently dropped.
        let sorter = Filter::SorterCount {
            field: Some("category".into()),
            gt: Some(1.0),
            gte: None,
            lt: None,
            lte: None,
        };
        let op = AggregateOp::from_sorter_count(&sorter).unwrap();
        let result = index.aggregate(&op).unwrap();
        match result {
            AggregateResult::Grouped(groups) => {
                assert_eq!(groups.get("a"), Some(&3));
                assert_eq!(groups.get("b"), None, "group of size 1 must be discarded by gt=1");
            }
            _ => panic!("expected grouped result"),
        }
    }

    #[test]
    fn need_rebuild_crosses_threshold() {
        let rows: Vec<IndexedRow> = (0..10).map(|i| row(i, vec![0.0; 4], None)).collect();
        let index = FlatIndex::from_rows(meta(Distance::L2, false, 0.0), rows);
        assert!(!index.need_rebuild());
        let deltas: Vec<DeltaRecord> = (0..4)
            .map(|i| DeltaRecord::Del {
                version: 100 + i,
                label: i,
                old_fields: None,
            })
            .collect();
        index.apply(&deltas).unwrap();
        assert!(index.need_rebuild());
    }
}
