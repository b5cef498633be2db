//! Collection: the orchestrator that ties schema, store, index registry,
//! embedder and lifecycle scheduler into the single object an embedding
//! application holds.
//!
//! The index registry is a `parking_lot::RwLock<HashMap<...>>` rather than
//! a single-index handle, because this design allows many named indexes
//! per collection; readers take the shared lock just long enough to clone
//! an `Arc` handle, mutators take the exclusive lock only for the swap, so
//! a rebuild-swap never invalidates an in-flight reader.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::LifecycleConfig;
use crate::embedder::{EmbedItem, Embedder};
use crate::error::{Error, Result};
use crate::filter::{Filter, SortOrder};
use crate::id::{stable_hash_u64, AutoIdGenerator, Clock, SystemClock, AUTO_ID_FIELD};
use crate::index::{AggregateOp, AggregateResult, Index, IndexMeta, IndexType, IndexedRow, ScoredLabel, SearchQuery, VectorIndexParams};
use crate::lifecycle::{Lifecycle, LifecycleHealth, LifecycleTarget, ManagedIndex};
use crate::persistence::{build_index, PersistentIndex};
use crate::record::{CandidateData, SparseVector};
use crate::schema::{CollectionMeta, FieldMap, FieldSpec, FieldType, ScalarValue};
use crate::store::{PersistentStore, Store, VolatileStore};
use crate::vector::Dense;

const COLLECTION_META_FILE: &str = "collection_meta.json";
const STORAGE_DIR: &str = "storage";
const INDEX_DIR: &str = "index";

/// An upsert input: raw, not-yet-coerced scalar field values plus any
/// caller-supplied vectors. Kept distinct from [`crate::record::Record`]
/// (the read-side shape, whose fields are already typed) because coercion
/// needs the untyped JSON a caller
/// actually sends, not a pre-typed `ScalarValue`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpsertRecord {
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub dense: Option<Dense>,
    #[serde(default)]
    pub sparse: Option<SparseVector>,
}

/// One hit out of a search call: the caller-visible primary key, the
/// engine's score, and the projected output fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultItem {
    pub id: ScalarValue,
    pub score: f32,
    pub fields: FieldMap,
    pub dense: Option<Dense>,
}

/// Result of `fetch`: found records in input order plus the subset of
/// requested ids that did not exist. A missing id is surfaced via
/// `ids_not_exist` rather than failing the whole call.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub records: Vec<Option<crate::record::Record>>,
    pub ids_not_exist: Vec<ScalarValue>,
}

/// Dependencies a collection needs beyond its schema; everything here is
/// supplied by the embedding application, never sourced from the
/// environment.
pub struct CollectionOptions {
    pub clock: Arc<dyn Clock>,
    pub embedder: Option<Arc<dyn Embedder>>,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        CollectionOptions {
            clock: Arc::new(SystemClock),
            embedder: None,
        }
    }
}

/// A single named, schema'd vector collection: the unit of storage, index
/// registry, and lifecycle scheduling.
pub struct Collection {
    meta: RwLock<CollectionMeta>,
    store: Arc<dyn Store>,
    indexes: RwLock<HashMap<String, Arc<ManagedIndex>>>,
    collection_root: Option<PathBuf>,
    index_root: Option<PathBuf>,
    auto_id: AutoIdGenerator,
    embedder: Option<Arc<dyn Embedder>>,
    clock: Arc<dyn Clock>,
    lifecycle: Mutex<Option<Lifecycle>>,
    closed: AtomicBool,
}

impl Collection {
    /// Create an in-memory collection; nothing under this instance ever
    /// touches disk.
    pub fn open_volatile(meta: CollectionMeta, options: CollectionOptions) -> Result<Arc<Collection>> {
        meta.validate()?;
        let store: Arc<dyn Store> = Arc::new(VolatileStore::new(crate::id::VersionClock::new(options.clock.clone())));
        Ok(Arc::new(Collection {
            meta: RwLock::new(meta),
            store,
            indexes: RwLock::new(HashMap::new()),
            collection_root: None,
            index_root: None,
            auto_id: AutoIdGenerator::new(),
            embedder: options.embedder,
            clock: options.clock,
            lifecycle: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    /// Open (or create, if `collection_meta.json` is absent) a durable
    /// collection rooted at `root`, replaying its delta log and recovering
    /// every index found under `index/`.
    pub fn open_persistent(root: impl Into<PathBuf>, meta: Option<CollectionMeta>, options: CollectionOptions) -> Result<Arc<Collection>> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let meta_path = root.join(COLLECTION_META_FILE);
        let meta = if meta_path.exists() {
            let bytes = fs::read(&meta_path)?;
            serde_json::from_slice::<CollectionMeta>(&bytes)?
        } else {
            let meta = meta.ok_or_else(|| {
                Error::SchemaInvalid(format!("no {} at {} and no schema supplied", COLLECTION_META_FILE, root.display()))
            })?;
            meta.validate()?;
            fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)?;
            meta
        };

        let store: Arc<dyn Store> = Arc::new(PersistentStore::open(root.join(STORAGE_DIR), options.clock.clone())?);

        let index_root = root.join(INDEX_DIR);
        fs::create_dir_all(&index_root)?;
        let mut indexes = HashMap::new();
        for entry in fs::read_dir(&index_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let persistent = Arc::new(PersistentIndex::new(&index_root, &name));
            let index_meta = persistent.read_meta()?;
            let index = persistent.recover(index_meta, store.as_ref())?;
            indexes.insert(name, Arc::new(ManagedIndex { index, persistent: Some(persistent) }));
        }

        Ok(Arc::new(Collection {
            meta: RwLock::new(meta),
            store,
            indexes: RwLock::new(indexes),
            collection_root: Some(root),
            index_root: Some(index_root),
            auto_id: AutoIdGenerator::new(),
            embedder: options.embedder,
            clock: options.clock,
            lifecycle: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    /// Start the background TTL/index-maintenance scheduler. A
    /// no-op the second time it is called.
    pub fn start_background(self: &Arc<Self>, config: LifecycleConfig) {
        let mut guard = self.lifecycle.lock();
        if guard.is_some() {
            return;
        }
        *guard = Some(Lifecycle::start(self.clone(), config));
    }

    pub fn health(&self) -> LifecycleHealth {
        self.lifecycle.lock().as_ref().map(|l| l.health()).unwrap_or_default()
    }

    pub fn meta(&self) -> CollectionMeta {
        self.meta.read().clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ResourceClosed("collection is closed".into()));
        }
        Ok(())
    }

    // ---- mutation -------------------------------------------------------

    /// Validate, coerce, vectorize (if declared), assign labels and write
    /// through to the store and every registered index. `ttl_seconds = 0`
    /// falls back to the schema's `default_ttl_seconds`. Returns the
    /// caller-visible primary keys in input order.
    pub fn upsert(&self, records: Vec<UpsertRecord>, ttl_seconds: u64) -> Result<Vec<ScalarValue>> {
        self.ensure_open()?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let meta = self.meta.read().clone();
        let now_ns = self.clock.now_ns();
        let ttl = if ttl_seconds > 0 { ttl_seconds } else { meta.default_ttl_seconds };
        let expire_ns = if ttl > 0 { now_ns.saturating_add(ttl.saturating_mul(1_000_000_000)) } else { 0 };

        let scalar_fields: Vec<&FieldSpec> = meta
            .fields
            .iter()
            .filter(|f| !matches!(f.field_type, FieldType::Vector | FieldType::SparseVector))
            .collect();

        let mut coerced: Vec<(FieldMap, Option<Dense>, Option<SparseVector>)> = Vec::with_capacity(records.len());
        for input in &records {
            let mut fields = FieldMap::new();
            for field in &scalar_fields {
                let raw = input.fields.get(&field.name).cloned().unwrap_or(serde_json::Value::Null);
                fields.insert(field.name.clone(), crate::schema::coerce(field, &raw)?);
            }
            coerced.push((fields, input.dense.clone(), input.sparse.clone()));
        }

        self.vectorize_missing(&meta, &mut coerced)?;

        if let Some(dense_field) = meta.dense_field() {
            let dim = dense_field.dim.unwrap_or(0);
            for (_, dense, _) in &coerced {
                if let Some(d) = dense {
                    if d.len() != dim {
                        return Err(Error::RecordInvalid(format!(
                            "dense vector length {} does not match declared dim {}",
                            d.len(),
                            dim
                        )));
                    }
                }
            }
        }

        let mut pks = Vec::with_capacity(coerced.len());
        let mut candidates = Vec::with_capacity(coerced.len());
        for (mut fields, dense, sparse) in coerced {
            let (label, pk) = self.assign_label(&meta, &mut fields);
            pks.push(pk);
            candidates.push(CandidateData { label, fields, dense, sparse, expire_ns });
        }

        let deltas = self.store.add(candidates, true)?;
        for managed in self.indexes.read().values() {
            managed.index.apply(&deltas)?;
        }
        Ok(pks)
    }

    fn vectorize_missing(&self, meta: &CollectionMeta, coerced: &mut [(FieldMap, Option<Dense>, Option<SparseVector>)]) -> Result<()> {
        if !meta.auto_vectorize {
            return Ok(());
        }
        let needs: Vec<usize> = coerced
            .iter()
            .enumerate()
            .filter(|(_, (_, dense, _))| dense.is_none())
            .map(|(i, _)| i)
            .collect();
        if needs.is_empty() {
            return Ok(());
        }
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| Error::EmbedderFailed("schema declares auto_vectorize but no embedder is configured".into()))?;
        let source = meta
            .vectorize_field
            .as_ref()
            .expect("validated schema guarantees vectorize_field when auto_vectorize is set");
        let items: Vec<EmbedItem> = needs
            .iter()
            .map(|&i| {
                let text = match coerced[i].0.get(source) {
                    Some(ScalarValue::String(s)) => s.clone(),
                    _ => String::new(),
                };
                EmbedItem::new(text)
            })
            .collect();
        let results = embedder.embed_batch(&items)?;
        for (&i, result) in needs.iter().zip(results.into_iter()) {
            coerced[i].1 = result.dense;
            if coerced[i].2.is_none() {
                coerced[i].2 = result.sparse;
            }
        }
        Ok(())
    }

    fn assign_label(&self, meta: &CollectionMeta, fields: &mut FieldMap) -> (u64, ScalarValue) {
        if meta.pk_is_auto() {
            let label = self.auto_id.next();
            let pk = ScalarValue::Int64(label as i64);
            fields.insert(AUTO_ID_FIELD.to_string(), pk.clone());
            (label, pk)
        } else {
            let pk_field = meta.primary_key_field();
            let value = fields.get(&pk_field.name).cloned().unwrap_or(ScalarValue::Null);
            let label = stable_hash_u64(&stringify_scalar(&value));
            (label, value)
        }
    }

    fn pks_to_labels(&self, pks: &[ScalarValue]) -> Vec<u64> {
        let meta = self.meta.read();
        pks.iter()
            .map(|pk| {
                if meta.pk_is_auto() {
                    match pk {
                        ScalarValue::Int64(i) => *i as u64,
                        other => stable_hash_u64(&stringify_scalar(other)),
                    }
                } else {
                    stable_hash_u64(&stringify_scalar(pk))
                }
            })
            .collect()
    }

    pub fn delete(&self, pks: &[ScalarValue]) -> Result<()> {
        self.ensure_open()?;
        let labels = self.pks_to_labels(pks);
        let deltas = self.store.delete(&labels, true)?;
        for managed in self.indexes.read().values() {
            managed.index.apply(&deltas)?;
        }
        Ok(())
    }

    /// Drop every record and rebuild every index empty, atomically with
    /// respect to readers: the registry write lock is held for the whole
    /// operation to prevent races with concurrent `create_index`/`drop_index`/search.
    pub fn delete_all(&self) -> Result<()> {
        self.ensure_open()?;
        let mut registry = self.indexes.write();
        let metas: Vec<IndexMeta> = registry.values().map(|m| m.index.meta().clone()).collect();
        self.store.clear()?;

        let mut fresh = HashMap::with_capacity(metas.len());
        for meta in metas {
            let name = meta.name.clone();
            if let Some(index_root) = &self.index_root {
                let _ = fs::remove_dir_all(index_root.join(&name));
            }
            let index = build_index(meta.clone(), Vec::new());
            let persistent = self.index_root.as_ref().map(|root| {
                let p = Arc::new(PersistentIndex::new(root, &name));
                let _ = p.write_meta(&meta);
                p
            });
            fresh.insert(name, Arc::new(ManagedIndex { index, persistent }));
        }
        *registry = fresh;
        Ok(())
    }

    pub fn fetch(&self, pks: &[ScalarValue]) -> Result<FetchResponse> {
        self.ensure_open()?;
        let labels = self.pks_to_labels(pks);
        let candidates = self.store.fetch(&labels)?;
        let mut records = Vec::with_capacity(pks.len());
        let mut ids_not_exist = Vec::new();
        for (pk, candidate) in pks.iter().zip(candidates.into_iter()) {
            match candidate {
                Some(c) => records.push(Some(crate::record::Record {
                    fields: c.fields,
                    dense: c.dense,
                    sparse: c.sparse,
                })),
                None => {
                    ids_not_exist.push(pk.clone());
                    records.push(None);
                }
            }
        }
        Ok(FetchResponse { records, ids_not_exist })
    }

    // ---- index registry --------------------------------------------------

    fn get_index(&self, name: &str) -> Result<Arc<ManagedIndex>> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("index '{}' not found", name)))
    }

    pub fn create_index(&self, name: impl Into<String>, index_type: IndexType, vector_index: VectorIndexParams, scalar_fields: Vec<String>) -> Result<()> {
        self.ensure_open()?;
        let name = name.into();
        let mut registry = self.indexes.write();
        if registry.contains_key(&name) {
            return Err(Error::Conflict(format!("index '{}' already exists", name)));
        }
        let rows = candidates_to_rows(self.store.all()?);
        let meta = IndexMeta::new(name.clone(), index_type, vector_index, scalar_fields);
        let index = build_index(meta.clone(), rows);
        let persistent = self.index_root.as_ref().map(|root| {
            let p = Arc::new(PersistentIndex::new(root, &name));
            let _ = p.write_meta(&meta);
            p
        });
        registry.insert(name, Arc::new(ManagedIndex { index, persistent }));
        Ok(())
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let mut registry = self.indexes.write();
        let managed = registry
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("index '{}' not found", name)))?;
        if let Some(p) = &managed.persistent {
            let _ = fs::remove_dir_all(p.root());
        }
        Ok(())
    }

    // ---- search -----------------------------------------------------------

    pub fn search_by_vector(
        &self,
        index: &str,
        dense: Option<Dense>,
        sparse: Option<SparseVector>,
        limit: usize,
        offset: usize,
        filter: Option<Filter>,
        output_fields: Option<&[String]>,
    ) -> Result<Vec<SearchResultItem>> {
        self.ensure_open()?;
        let managed = self.get_index(index)?;
        let mut query = SearchQuery::new(limit, offset);
        query.dense = dense;
        query.sparse = sparse;
        query.filter = filter;
        let scored = managed.index.search(&query)?;
        self.rehydrate(scored, output_fields)
    }

    pub fn search_by_id(
        &self,
        index: &str,
        pk: &ScalarValue,
        limit: usize,
        offset: usize,
        filter: Option<Filter>,
        output_fields: Option<&[String]>,
    ) -> Result<Vec<SearchResultItem>> {
        self.ensure_open()?;
        let labels = self.pks_to_labels(std::slice::from_ref(pk));
        let candidate = self
            .store
            .fetch(&labels)?
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| Error::NotFound(format!("id {:?} not found", pk)))?;
        self.search_by_vector(index, candidate.dense, candidate.sparse, limit, offset, filter, output_fields)
    }

    pub fn search_by_random(
        &self,
        index: &str,
        limit: usize,
        offset: usize,
        filter: Option<Filter>,
        output_fields: Option<&[String]>,
    ) -> Result<Vec<SearchResultItem>> {
        self.ensure_open()?;
        let dim = {
            let meta = self.meta.read();
            meta.dense_field()
                .and_then(|f| f.dim)
                .ok_or_else(|| Error::SchemaInvalid("by_random requires a declared dense vector field".into()))?
        };
        let mut rng = rand::thread_rng();
        let dense: Dense = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0f32)).collect();
        self.search_by_vector(index, Some(dense), None, limit, offset, filter, output_fields)
    }

    pub fn search_by_scalar(
        &self,
        index: &str,
        field: &str,
        order: SortOrder,
        limit: usize,
        offset: usize,
        filter: Option<Filter>,
        output_fields: Option<&[String]>,
    ) -> Result<Vec<SearchResultItem>> {
        self.ensure_open()?;
        let sorter = Filter::SorterSort {
            field: field.to_string(),
            order,
            topk: limit.saturating_add(offset),
        };
        let combined = match filter {
            Some(existing) => Filter::And { conds: vec![existing, sorter] },
            None => sorter,
        };
        self.search_by_vector(index, None, None, limit, offset, Some(combined), output_fields)
    }

    /// Vectorize `text` through the configured embedder and search on the
    /// result.
    pub fn search_by_keywords(
        &self,
        index: &str,
        text: &str,
        limit: usize,
        offset: usize,
        filter: Option<Filter>,
        output_fields: Option<&[String]>,
    ) -> Result<Vec<SearchResultItem>> {
        self.ensure_open()?;
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| Error::EmbedderFailed("by_keywords requires a configured embedder".into()))?;
        let result = embedder
            .embed_batch(&[EmbedItem::new(text)])?
            .into_iter()
            .next()
            .unwrap_or_default();
        self.search_by_vector(index, result.dense, result.sparse, limit, offset, filter, output_fields)
    }

    /// Accepts several already-renderable-as-text items (e.g. an image
    /// caption produced upstream) and averages their embeddings before
    /// searching. Turning a raw image/audio blob into embeddable content is
    /// the VLM/captioning provider's job and out of scope for this crate;
    /// this method only owns the embedder call.
    pub fn search_by_multimodal(
        &self,
        index: &str,
        items: &[EmbedItem],
        limit: usize,
        offset: usize,
        filter: Option<Filter>,
        output_fields: Option<&[String]>,
    ) -> Result<Vec<SearchResultItem>> {
        self.ensure_open()?;
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| Error::EmbedderFailed("by_multimodal requires a configured embedder".into()))?;
        let results = embedder.embed_batch(items)?;
        let mut dense_acc: Option<Dense> = None;
        let mut sparse_acc: Option<SparseVector> = None;
        for result in results {
            if let Some(d) = result.dense {
                dense_acc = Some(match dense_acc {
                    Some(mut acc) => {
                        for (a, b) in acc.iter_mut().zip(d.iter()) {
                            *a += b;
                        }
                        acc
                    }
                    None => d,
                });
            }
            if sparse_acc.is_none() {
                sparse_acc = result.sparse;
            }
        }
        self.search_by_vector(index, dense_acc, sparse_acc, limit, offset, filter, output_fields)
    }

    fn rehydrate(&self, scored: Vec<ScoredLabel>, output_fields: Option<&[String]>) -> Result<Vec<SearchResultItem>> {
        let labels: Vec<u64> = scored.iter().map(|s| s.label).collect();
        let candidates = self.store.fetch(&labels)?;
        let meta = self.meta.read();
        let has_embedder = self.embedder.is_some();
        let mut out = Vec::with_capacity(scored.len());
        for (scored_item, candidate) in scored.into_iter().zip(candidates.into_iter()) {
            // A result label can race against a concurrent delete between
            // the index scan and this fetch; such a hit is dropped rather
            // than surfaced as a phantom record.
            let Some(candidate) = candidate else { continue };
            let (fields, dense) = project(&meta, &candidate, output_fields, has_embedder);
            let id = candidate_pk(&meta, &candidate).unwrap_or(ScalarValue::Null);
            out.push(SearchResultItem {
                id,
                score: scored_item.score,
                fields,
                dense,
            });
        }
        Ok(out)
    }

    // ---- aggregation --------------------------------------------------------

    /// Never fails the caller. An
    /// unknown index or an aggregation error logs a warning and returns an
    /// empty/zeroed result instead.
    pub fn aggregate(&self, index: &str, op: AggregateOp) -> AggregateResult {
        if self.closed.load(Ordering::SeqCst) {
            tracing::warn!("aggregate called on a closed collection");
            return empty_aggregate(&op);
        }
        match self.get_index(index) {
            Ok(managed) => managed.index.aggregate(&op).unwrap_or_else(|e| {
                tracing::warn!(error = %e, index, "aggregate failed");
                empty_aggregate(&op)
            }),
            Err(_) => {
                tracing::warn!(index, "aggregate: index not found");
                empty_aggregate(&op)
            }
        }
    }

    /// Aggregate via the documented `sorter.count(field?, {gt?,gte?,lt?,lte?})`
    /// filter-tree node (§4.3), translating its inline bounds into the
    /// `cond` of an `AggregateOp::Count` rather than requiring callers to
    /// hand-build one. An unknown index or an unreadable `sorter.count`
    /// node returns an empty aggregate, per `AggregationInvalid`'s policy.
    pub fn aggregate_by_filter(&self, index: &str, sorter: &Filter) -> AggregateResult {
        match AggregateOp::from_sorter_count(sorter) {
            Ok(op) => self.aggregate(index, op),
            Err(e) => {
                tracing::warn!(error = %e, index, "aggregate_by_filter: invalid sorter.count node");
                AggregateResult::Total(0)
            }
        }
    }

    // ---- schema evolution & lifecycle ---------------------------------------

    /// Update the free-text description and append additive, non-indexed
    /// scalar fields. Vector fields and the primary key are immutable after
    /// creation.
    pub fn update_schema(&self, description: Option<String>, additional_fields: Vec<FieldSpec>) -> Result<()> {
        self.ensure_open()?;
        let mut meta = self.meta.write();
        if let Some(desc) = description {
            meta.description = desc;
        }
        for field in additional_fields {
            if field.is_primary_key || matches!(field.field_type, FieldType::Vector | FieldType::SparseVector) {
                return Err(Error::SchemaInvalid(
                    "update_schema may only add non-indexed additive scalar fields".into(),
                ));
            }
            if meta.field(&field.name).is_some() {
                return Err(Error::SchemaInvalid(format!("field '{}' already exists", field.name)));
            }
            meta.fields.push(field);
        }
        if let Some(root) = &self.collection_root {
            fs::write(root.join(COLLECTION_META_FILE), serde_json::to_vec_pretty(&*meta)?)?;
        }
        Ok(())
    }

    /// Explicit flush of every persistent index's current state. The
    /// background scheduler calls the equivalent logic itself on its own
    /// cadence and once more on shutdown; this lets a caller force a flush
    /// in between (e.g. before a restart under test).
    pub fn persist_all(&self) -> Result<()> {
        self.ensure_open()?;
        let now_ns = self.clock.now_ns();
        for managed in self.indexes.read().values() {
            if let Some(p) = &managed.persistent {
                p.persist(managed.index.as_ref(), now_ns)?;
            }
        }
        Ok(())
    }

    /// Release the collection's resources: stop the scheduler (which itself
    /// flushes persistent indexes one last time) and mark the collection
    /// closed so further calls return `ResourceClosed`. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.lifecycle.lock().take() {
            Some(lifecycle) => lifecycle.shutdown(),
            None => {
                let now_ns = self.clock.now_ns();
                for managed in self.indexes.read().values() {
                    if let Some(p) = &managed.persistent {
                        p.persist(managed.index.as_ref(), now_ns)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Destroy the collection: close it, then remove all on-disk state (for
    /// a persistent collection) or clear in-memory state (for a volatile
    /// one). Irreversible.
    pub fn destroy(&self) -> Result<()> {
        self.close()?;
        match &self.collection_root {
            Some(root) => {
                fs::remove_dir_all(root)?;
            }
            None => {
                self.store.clear()?;
                self.indexes.write().clear();
            }
        }
        Ok(())
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl LifecycleTarget for Collection {
    fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    fn snapshot_indexes(&self) -> Vec<(String, Arc<ManagedIndex>)> {
        self.indexes.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn rebuild_index(&self, name: &str) -> Result<()> {
        let mut registry = self.indexes.write();
        let Some(managed) = registry.get(name) else {
            return Ok(());
        };
        let meta = managed.index.meta().clone();
        let version = managed.index.version();
        let rows = candidates_to_rows(self.store.all()?);
        let fresh = build_index(meta, rows);
        fresh.meta().bump_version(version);
        let persistent = managed.persistent.clone();
        registry.insert(name.to_string(), Arc::new(ManagedIndex { index: fresh, persistent }));
        Ok(())
    }

    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}

fn candidates_to_rows(candidates: Vec<CandidateData>) -> Vec<IndexedRow> {
    candidates
        .into_iter()
        .map(|c| IndexedRow {
            label: c.label,
            fields: c.fields,
            dense: c.dense,
            sparse: c.sparse,
        })
        .collect()
}

fn candidate_pk(meta: &CollectionMeta, candidate: &CandidateData) -> Option<ScalarValue> {
    let pk_field = meta.primary_key_field();
    candidate.fields.get(&pk_field.name).cloned()
}

fn project(meta: &CollectionMeta, candidate: &CandidateData, output_fields: Option<&[String]>, has_embedder: bool) -> (FieldMap, Option<Dense>) {
    let scalar_names: Vec<&str> = meta
        .fields
        .iter()
        .filter(|f| !matches!(f.field_type, FieldType::Vector | FieldType::SparseVector))
        .map(|f| f.name.as_str())
        .collect();
    let dense_name = meta.dense_field().map(|f| f.name.as_str());

    let (wanted, want_dense) = match output_fields {
        Some(requested) => {
            let scalars: Vec<String> = requested.iter().filter(|n| scalar_names.contains(&n.as_str())).cloned().collect();
            let want_dense = dense_name.map(|d| requested.iter().any(|n| n == d)).unwrap_or(false);
            (scalars, want_dense)
        }
        None => (
            scalar_names.iter().map(|s| s.to_string()).collect(),
            dense_name.is_some() && !has_embedder,
        ),
    };

    let mut fields = FieldMap::new();
    for name in wanted {
        if let Some(v) = candidate.fields.get(&name) {
            fields.insert(name, v.clone());
        }
    }
    let dense = if want_dense { candidate.dense.clone() } else { None };
    (fields, dense)
}

fn stringify_scalar(value: &ScalarValue) -> String {
    match value {
        ScalarValue::Null => "null".to_string(),
        ScalarValue::Int64(i) => i.to_string(),
        ScalarValue::Float32(f) => f.to_string(),
        ScalarValue::Bool(b) => b.to_string(),
        ScalarValue::String(s) | ScalarValue::Path(s) => s.clone(),
        ScalarValue::DateTimeNs(ns) => ns.to_string(),
        ScalarValue::GeoPoint(lat, lon) => format!("{},{}", lat, lon),
        ScalarValue::ListString(items) => items.join(","),
        ScalarValue::ListInt64(items) => items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(","),
    }
}

fn empty_aggregate(op: &AggregateOp) -> AggregateResult {
    match op {
        AggregateOp::Count { field: None, .. } => AggregateResult::Total(0),
        AggregateOp::Count { field: Some(_), .. } => AggregateResult::Grouped(Default::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ManualClock;
    use crate::schema::{FieldSpec, FieldType};
    use crate::vector::Distance;

    fn schema() -> CollectionMeta {
        CollectionMeta::new(
            "docs",
            vec![
                FieldSpec::new("id", FieldType::String).primary_key(),
                FieldSpec::new("embedding", FieldType::Vector).with_dim(4),
                FieldSpec::new("rating", FieldType::Int64),
            ],
        )
        .unwrap()
    }

    fn vector_params() -> VectorIndexParams {
        VectorIndexParams {
            distance: Distance::L2,
            normalize: false,
            enable_sparse: false,
            sparse_alpha: 0.0,
            quantization: None,
        }
    }

    fn upsert_one(id: &str, rating: i64, dense: Dense) -> UpsertRecord {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), serde_json::json!(id));
        fields.insert("rating".to_string(), serde_json::json!(rating));
        UpsertRecord { fields, dense: Some(dense), sparse: None }
    }

    #[test]
    fn upsert_fetch_round_trips_by_user_pk() {
        let collection = Collection::open_volatile(schema(), CollectionOptions::default()).unwrap();
        let pks = collection.upsert(vec![upsert_one("a", 1, vec![1.0, 0.0, 0.0, 0.0])], 0).unwrap();
        assert_eq!(pks, vec![ScalarValue::String("a".into())]);

        let fetched = collection.fetch(&pks).unwrap();
        assert_eq!(fetched.ids_not_exist.len(), 0);
        assert!(fetched.records[0].is_some());
        let record = fetched.records[0].as_ref().unwrap();
        assert_eq!(record.fields.get("rating"), Some(&ScalarValue::Int64(1)));
    }

    #[test]
    fn delete_removes_record() {
        let collection = Collection::open_volatile(schema(), CollectionOptions::default()).unwrap();
        let pks = collection.upsert(vec![upsert_one("a", 1, vec![1.0, 0.0, 0.0, 0.0])], 0).unwrap();
        collection.delete(&pks).unwrap();
        let fetched = collection.fetch(&pks).unwrap();
        assert_eq!(fetched.ids_not_exist, pks);
        assert!(fetched.records[0].is_none());
    }

    #[test]
    fn create_index_then_search_by_vector_exact_recall() {
        let collection = Collection::open_volatile(schema(), CollectionOptions::default()).unwrap();
        collection
            .upsert(
                vec![
                    upsert_one("a", 1, vec![1.0, 0.0, 0.0, 0.0]),
                    upsert_one("b", 2, vec![0.0, 1.0, 0.0, 0.0]),
                ],
                0,
            )
            .unwrap();
        collection.create_index("flat_l2", IndexType::Flat, vector_params(), vec![]).unwrap();

        let results = collection
            .search_by_vector("flat_l2", Some(vec![1.0, 0.0, 0.0, 0.0]), None, 1, 0, None, None)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, ScalarValue::String("a".into()));
    }

    #[test]
    fn create_index_rejects_duplicate_name() {
        let collection = Collection::open_volatile(schema(), CollectionOptions::default()).unwrap();
        collection.create_index("idx", IndexType::Flat, vector_params(), vec![]).unwrap();
        let err = collection.create_index("idx", IndexType::Flat, vector_params(), vec![]).unwrap_err();
        assert_eq!(err.kind(), "Conflict");
    }

    #[test]
    fn delete_all_keeps_indexes_registered_but_empty() {
        let collection = Collection::open_volatile(schema(), CollectionOptions::default()).unwrap();
        collection
            .upsert(vec![upsert_one("a", 1, vec![1.0, 0.0, 0.0, 0.0])], 0)
            .unwrap();
        collection.create_index("idx", IndexType::Flat, vector_params(), vec![]).unwrap();
        collection.delete_all().unwrap();

        let results = collection
            .search_by_vector("idx", Some(vec![1.0, 0.0, 0.0, 0.0]), None, 10, 0, None, None)
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn auto_pk_echoes_label_as_int64() {
        let schema = CollectionMeta::new(
            "autos",
            vec![
                FieldSpec::new(AUTO_ID_FIELD, FieldType::Int64).primary_key(),
                FieldSpec::new("embedding", FieldType::Vector).with_dim(4),
            ],
        )
        .unwrap();
        let collection = Collection::open_volatile(schema, CollectionOptions::default()).unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("ignored".to_string(), serde_json::json!("value"));
        let pks = collection
            .upsert(vec![UpsertRecord { fields, dense: Some(vec![0.0; 4]), sparse: None }], 0)
            .unwrap();
        assert!(matches!(pks[0], ScalarValue::Int64(_)));
    }

    #[test]
    fn closed_collection_rejects_further_mutation() {
        let collection = Collection::open_volatile(schema(), CollectionOptions::default()).unwrap();
        collection.close().unwrap();
        let err = collection.upsert(vec![upsert_one("a", 1, vec![0.0; 4])], 0).unwrap_err();
        assert_eq!(err.kind(), "ResourceClosed");
    }

    #[test]
    fn ttl_expired_record_is_absent_after_manual_clock_advance() {
        let clock = ManualClock::new(0);
        let options = CollectionOptions {
            clock: Arc::new(clock.clone()),
            embedder: None,
        };
        let collection = Collection::open_volatile(schema(), options).unwrap();
        let pks = collection.upsert(vec![upsert_one("a", 1, vec![0.0; 4])], 1).unwrap();

        clock.advance(2_000_000_000);
        let deltas = collection.store().expire(clock.now_ns()).unwrap();
        assert_eq!(deltas.len(), 1);

        let fetched = collection.fetch(&pks).unwrap();
        assert!(fetched.records[0].is_none());
    }
}
