//! HNSW (approximate) index: an `instant-distance` graph over dense
//! vectors used for coarse candidate retrieval, re-scored exactly against
//! the true distance metric (and any sparse/hybrid/scalar-filter
//! requirements) before being returned — the graph only has to narrow the
//! field, not produce final scores or ordering.
//!
//! A `DashMap`-backed row store sits alongside a rebuildable
//! `instant_distance::HnswMap`, with a dirty counter gating when the graph
//! is rebuilt rather than rebuilding on every write (`instant-distance`
//! builds a graph in one bulk pass; it has no incremental-insert API).

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use instant_distance::{Builder, Search};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::record::DeltaRecord;
use crate::vector::normalize_in_place;

use super::{AggregateOp, AggregateResult, Index, IndexMeta, IndexedRow, ScoredLabel, SearchQuery};
use super::flat::FlatIndex as FlatScorer; // aggregation delegates to an ephemeral flat view, see below

#[derive(Clone)]
struct GraphPoint(Vec<f32>);

impl instant_distance::Point for GraphPoint {
    fn distance(&self, other: &Self) -> f32 {
        crate::vector::l2_squared(&self.0, &other.0)
    }
}

type Graph = instant_distance::HnswMap<GraphPoint, u64>;

pub struct HnswIndex {
    meta: IndexMeta,
    rows: DashMap<u64, IndexedRow>,
    graph: RwLock<Option<Graph>>,
    dirty_since_build: AtomicUsize,
    ever_inserted: AtomicUsize,
}

/// Re-fetch candidates this multiple over `limit+offset` from the ANN
/// graph before exact re-scoring/filtering, to absorb approximation error
/// and candidates the scalar filter will reject.
const OVERFETCH_FACTOR: usize = 4;

impl HnswIndex {
    pub fn new(meta: IndexMeta) -> Self {
        HnswIndex {
            meta,
            rows: DashMap::new(),
            graph: RwLock::new(None),
            dirty_since_build: AtomicUsize::new(0),
            ever_inserted: AtomicUsize::new(0),
        }
    }

    pub fn from_rows(meta: IndexMeta, rows: Vec<IndexedRow>) -> Self {
        let index = HnswIndex::new(meta);
        for mut row in rows {
            if let Some(dense) = row.dense.as_mut() {
                if index.meta.vector_index.should_normalize() {
                    normalize_in_place(dense);
                }
            }
            index.ever_inserted.fetch_add(1, Ordering::SeqCst);
            index.rows.insert(row.label, row);
        }
        index.rebuild_graph();
        index
    }

    fn rebuild_graph(&self) {
        let (points, labels): (Vec<GraphPoint>, Vec<u64>) = self
            .rows
            .iter()
            .filter_map(|r| r.value().dense.clone().map(|d| (GraphPoint(d), *r.key())))
            .unzip();
        let mut guard = self.graph.write();
        if points.is_empty() {
            *guard = None;
        } else {
            *guard = Some(Builder::default().seed(42).build(points, labels));
        }
        self.dirty_since_build.store(0, Ordering::SeqCst);
    }

    fn maybe_rebuild_graph(&self) {
        let dirty = self.dirty_since_build.load(Ordering::SeqCst);
        let size = self.rows.len().max(1);
        if self.graph.read().is_none() || dirty * 4 >= size {
            self.rebuild_graph();
        }
    }
}

impl Index for HnswIndex {
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
                    self.dirty_since_build.fetch_add(1, Ordering::SeqCst);
                    self.meta.bump_version(*version);
                }
                DeltaRecord::Del { version, label, .. } => {
                    self.rows.remove(label);
                    self.dirty_since_build.fetch_add(1, Ordering::SeqCst);
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
        self.maybe_rebuild_graph();

        let distance = self.meta.vector_index.distance;
        let query_dense = query.dense.clone().map(|mut d| {
            if self.meta.vector_index.should_normalize() {
                normalize_in_place(&mut d);
            }
            d
        });

        let want = query.limit.saturating_add(query.offset);
        let candidate_labels: Vec<u64> = if let Some(qd) = &query_dense {
            let graph = self.graph.read();
            match graph.as_ref() {
                Some(g) => {
                    let mut search = Search::default();
                    let ann_want = (want * OVERFETCH_FACTOR).max(want).min(self.rows.len().max(1));
                    g.search(&GraphPoint(qd.clone()), &mut search)
                        .take(ann_want)
                        .map(|item| *item.value)
                        .collect()
                }
                None => self.rows.iter().map(|r| *r.key()).collect(),
            }
        } else {
            self.rows.iter().map(|r| *r.key()).collect()
        };

        let mut normalized_query = query.clone();
        normalized_query.dense = query_dense.clone();

        let mut scored: Vec<ScoredLabel> = candidate_labels
            .into_iter()
            .filter_map(|label| self.rows.get(&label).map(|r| r.value().clone()))
            .filter(|row| query.filter.as_ref().map(|f| f.matches(&row.fields)).unwrap_or(true))
            .filter_map(|row| super::score_row(&normalized_query, &row, distance, &self.meta.vector_index))
            .collect();

        let better_is_smaller = query
            .filter
            .as_ref()
            .and_then(|f| f.find_sorter())
            .map(super::sorter_order_is_ascending)
            .unwrap_or(distance.better_is_smaller());

        if better_is_smaller {
            scored.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
        } else {
            scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        }
        scored.truncate(want);
        Ok(super::apply_offset(scored, query.offset))
    }

    fn aggregate(&self, op: &AggregateOp) -> Result<AggregateResult> {
        // Aggregation is purely scalar and identical in spirit to the flat
        // engine's; delegate to an ephemeral flat view over the same rows.
        let rows: Vec<IndexedRow> = self.rows.iter().map(|r| r.value().clone()).collect();
        let flat = FlatScorer::from_rows(self.meta.clone(), rows);
        flat.aggregate(op)
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let rows: Vec<IndexedRow> = self.rows.iter().map(|r| r.value().clone()).collect();
        serde_json::to_vec(&rows).map_err(Error::from)
    }
}
