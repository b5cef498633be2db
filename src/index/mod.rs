//! Index engine: per-index metadata, the [`Index`] trait shared by the
//! `flat` and `hnsw` engines, search requests/results, and aggregation.
//!
//! Mutation and search are collapsed into one object-safe trait since
//! every engine here supports both concurrently rather than splitting
//! read/write handles.

mod flat;
mod hnsw;

pub use flat::FlatIndex;
pub use hnsw::HnswIndex;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::record::{DeltaRecord, SparseVector};
use crate::schema::{FieldMap, ScalarValue};
use crate::vector::Distance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    Flat,
    FlatHybrid,
    Hnsw,
    HnswHybrid,
}

impl IndexType {
    pub fn is_hybrid(self) -> bool {
        matches!(self, IndexType::FlatHybrid | IndexType::HnswHybrid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndexParams {
    pub distance: Distance,
    #[serde(default)]
    pub normalize: bool,
    #[serde(default)]
    pub enable_sparse: bool,
    #[serde(default = "default_sparse_alpha")]
    pub sparse_alpha: f32,
    #[serde(default)]
    pub quantization: Option<String>,
}

fn default_sparse_alpha() -> f32 {
    0.5
}

impl VectorIndexParams {
    /// True when ingest/query-time vectors must be L2-normalized: either
    /// requested explicitly, or implied by the distance metric.
    pub fn should_normalize(&self) -> bool {
        self.normalize || self.distance.requires_normalize()
    }
}

/// Immutable-after-creation description of one index.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexMeta {
    pub name: String,
    pub index_type: IndexType,
    pub vector_index: VectorIndexParams,
    pub scalar_fields: Vec<String>,
    pub description: String,
    /// Tombstone fraction at which `need_rebuild()` reports true. Resolves
    /// the "parameterize the rebuild-need policy" open question.
    pub rebuild_threshold: f32,
    #[serde(skip, default)]
    update_version: AtomicU64,
}

impl Clone for IndexMeta {
    fn clone(&self) -> Self {
        IndexMeta {
            name: self.name.clone(),
            index_type: self.index_type,
            vector_index: self.vector_index.clone(),
            scalar_fields: self.scalar_fields.clone(),
            description: self.description.clone(),
            rebuild_threshold: self.rebuild_threshold,
            update_version: AtomicU64::new(self.update_version.load(Ordering::SeqCst)),
        }
    }
}

impl IndexMeta {
    pub fn new(name: impl Into<String>, index_type: IndexType, vector_index: VectorIndexParams, scalar_fields: Vec<String>) -> Self {
        IndexMeta {
            name: name.into(),
            index_type,
            vector_index,
            scalar_fields,
            description: String::new(),
            rebuild_threshold: crate::config::DEFAULT_REBUILD_THRESHOLD,
            update_version: AtomicU64::new(0),
        }
    }

    pub fn update_version(&self) -> u64 {
        self.update_version.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_version(&self, version: u64) {
        self.update_version.fetch_max(version, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub dense: Option<Vec<f32>>,
    pub sparse: Option<SparseVector>,
    pub limit: usize,
    pub offset: usize,
    pub filter: Option<Filter>,
}

impl SearchQuery {
    pub fn new(limit: usize, offset: usize) -> Self {
        SearchQuery {
            dense: None,
            sparse: None,
            limit,
            offset,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredLabel {
    pub label: u64,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub enum AggregateOp {
    /// `op=count`; grouping by `field` when present, else total count.
    Count { field: Option<String>, cond: Option<Filter> },
}

impl AggregateOp {
    /// Build the engine-level aggregation request from a `sorter.count`
    /// filter-tree node, translating its inline `{gt,gte,lt,lte}` bounds
    /// into a post-aggregation `cond` over the synthetic `__count__` field
    /// that the grouped-count path of `Index::aggregate` matches against —
    /// the only way a caller speaking the documented filter DSL reaches
    /// the `cond` behavior rather than hand-building an `AggregateOp`.
    pub fn from_sorter_count(filter: &Filter) -> Result<AggregateOp> {
        match filter {
            Filter::SorterCount { field, gt, gte, lt, lte } => {
                let has_bound = gt.is_some() || gte.is_some() || lt.is_some() || lte.is_some();
                let cond = has_bound.then(|| Filter::Range {
                    field: "__count__".to_string(),
                    gt: *gt,
                    gte: *gte,
                    lt: *lt,
                    lte: *lte,
                });
                Ok(AggregateOp::Count { field: field.clone(), cond })
            }
            other => Err(Error::AggregationInvalid(format!(
                "expected a sorter.count filter node, got {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AggregateResult {
    Total(u64),
    Grouped(std::collections::BTreeMap<String, u64>),
}

/// A single live, indexable row: the scalar-filterable and vector-scorable
/// projection of a [`crate::record::CandidateData`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedRow {
    pub label: u64,
    pub fields: FieldMap,
    pub dense: Option<Vec<f32>>,
    pub sparse: Option<SparseVector>,
}

/// The searchable structure built over a store snapshot plus tail deltas.
pub trait Index: Send + Sync {
    fn meta(&self) -> &IndexMeta;

    /// Apply a batch of deltas (both `Put` and `Del` variants) produced by
    /// the store, in order.
    fn apply(&self, deltas: &[DeltaRecord]) -> Result<()>;

    /// Nanosecond high-watermark of applied deltas.
    fn version(&self) -> u64 {
        self.meta().update_version()
    }

    /// True when the deletion/fragmentation ratio crosses
    /// `meta().rebuild_threshold`.
    fn need_rebuild(&self) -> bool;

    fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredLabel>>;

    fn aggregate(&self, op: &AggregateOp) -> Result<AggregateResult>;

    /// Live row count (non-tombstoned).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize the full in-memory state to an engine-defined snapshot
    /// payload.
    fn snapshot(&self) -> Result<Vec<u8>>;
}

/// Slice `[offset, offset+limit)` out of a `limit+offset`-sized result,
/// implementing the offset-via-overfetch policy.
pub fn apply_offset(mut rows: Vec<ScoredLabel>, offset: usize) -> Vec<ScoredLabel> {
    if offset >= rows.len() {
        return Vec::new();
    }
    rows.drain(0..offset);
    rows
}

/// Shared dense+sparse hybrid scoring for one row, used by both the flat
/// and the hnsw engines so the combination rule has one definition.
/// Returns `None` when a `sorter.sort` node is active and the row lacks
/// the sorted field.
pub(crate) fn score_row(
    query: &SearchQuery,
    row: &IndexedRow,
    distance: crate::vector::Distance,
    params: &VectorIndexParams,
) -> Option<ScoredLabel> {
    if let Some(sorter) = query.filter.as_ref().and_then(|f| f.find_sorter()) {
        return score_from_sorter(sorter, row);
    }
    let dense_score = match (&query.dense, &row.dense) {
        (Some(q), Some(d)) => distance.score(q, d),
        _ => 0.0,
    };
    let combined = match (&query.sparse, &row.sparse) {
        (Some(qs), Some(rs)) if params.enable_sparse => {
            let sparse = sparse_dot(qs, rs);
            let alpha = params.sparse_alpha;
            dense_score * (1.0 - alpha) + distance.sparse_sign() * alpha * sparse
        }
        _ => dense_score,
    };
    Some(ScoredLabel { label: row.label, score: combined })
}

pub(crate) fn sparse_dot(query: &crate::record::SparseVector, row: &crate::record::SparseVector) -> f32 {
    let mut score = 0.0f32;
    for (qt, qv) in query.0.iter().zip(query.1.iter()) {
        if let Some(pos) = row.0.iter().position(|t| t == qt) {
            score += qv * row.1[pos];
        }
    }
    score
}

pub(crate) fn sorter_order_is_ascending(sorter: &Filter) -> bool {
    matches!(
        sorter,
        Filter::SorterSort {
            order: crate::filter::SortOrder::Asc,
            ..
        }
    )
}

pub(crate) fn score_from_sorter(sorter: &Filter, row: &IndexedRow) -> Option<ScoredLabel> {
    if let Filter::SorterSort { field, .. } = sorter {
        let value = row.fields.get(field)?;
        let score = match value {
            ScalarValue::Int64(i) => *i as f32,
            ScalarValue::Float32(f) => *f,
            ScalarValue::DateTimeNs(ns) => *ns as f32,
            _ => return None,
        };
        return Some(ScoredLabel { label: row.label, score });
    }
    None
}
