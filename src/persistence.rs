//! Persistent index version directories: snapshot dump/load behind
//! `.write_done` integrity markers, version selection on recovery, and GC
//! of superseded versions.
//!
//! Each generation gets its own `versions/<version_ns>/` directory plus a
//! zero-byte `.write_done` sibling written only after the payload is fully
//! flushed, so a process crash mid-write leaves a version directory that
//! recovery simply skips rather than one that looks complete but isn't.
//! A snapshot payload's internal shape (flat vs. hnsw) varies, so the
//! "partial write is invisible to recovery" property has to be spelled out
//! explicitly rather than relying on a single atomic file rename.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::index::{FlatIndex, HnswIndex, Index, IndexMeta, IndexType, IndexedRow};
use crate::store::Store;

const INDEX_META_FILE: &str = "index_meta.json";
const VERSIONS_DIR: &str = "versions";
const WRITE_DONE_SUFFIX: &str = ".write_done";
const SNAPSHOT_FILE: &str = "rows.json";

/// Build a fresh engine instance of the type named in `meta` over `rows`.
pub fn build_index(meta: IndexMeta, rows: Vec<IndexedRow>) -> Arc<dyn Index> {
    match meta.index_type {
        IndexType::Flat | IndexType::FlatHybrid => Arc::new(FlatIndex::from_rows(meta, rows)),
        IndexType::Hnsw | IndexType::HnswHybrid => Arc::new(HnswIndex::from_rows(meta, rows)),
    }
}

/// Manages the on-disk `<index_root>/<index_name>/` directory for one
/// index: its `index_meta.json` catalog entry and its `versions/` snapshot
/// history.
pub struct PersistentIndex {
    root: PathBuf,
    newest_on_disk: AtomicU64,
}

impl PersistentIndex {
    pub fn new(index_root: impl AsRef<Path>, name: &str) -> Self {
        PersistentIndex {
            root: index_root.as_ref().join(name),
            newest_on_disk: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn versions_dir(&self) -> PathBuf {
        self.root.join(VERSIONS_DIR)
    }

    pub fn newest_on_disk_version(&self) -> u64 {
        self.newest_on_disk.load(Ordering::SeqCst)
    }

    pub fn write_meta(&self, meta: &IndexMeta) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let json = serde_json::to_vec_pretty(meta)?;
        fs::write(self.root.join(INDEX_META_FILE), json)?;
        Ok(())
    }

    pub fn read_meta(&self) -> Result<IndexMeta> {
        let bytes = fs::read(self.root.join(INDEX_META_FILE))?;
        serde_json::from_slice(&bytes).map_err(Error::from)
    }

    /// Scan `versions/` for the newest directory whose `.write_done`
    /// sibling exists. Directories without a marker are crash leftovers and
    /// are ignored, giving crash safety for free.
    fn latest_valid_version(&self) -> Result<Option<u64>> {
        let versions_dir = self.versions_dir();
        if !versions_dir.exists() {
            return Ok(None);
        }
        let mut best: Option<u64> = None;
        for entry in fs::read_dir(&versions_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(version) = name.to_str().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            let marker = versions_dir.join(format!("{}{}", version, WRITE_DONE_SUFFIX));
            if marker.exists() && best.map_or(true, |b| version > b) {
                best = Some(version);
            }
        }
        Ok(best)
    }

    /// recover(): mount the latest `.write_done`-backed snapshot (or an
    /// empty index if none exists — "first-create path uses
    /// initial_timestamp=0" so a fresh index picks up the store's entire
    /// delta history), then replay `store.delta_after(loaded_version)`.
    pub fn recover(&self, meta: IndexMeta, store: &dyn Store) -> Result<Arc<dyn Index>> {
        let loaded_version = self.latest_valid_version()?.unwrap_or(0);
        let rows = if loaded_version == 0 {
            Vec::new()
        } else {
            let path = self.versions_dir().join(loaded_version.to_string()).join(SNAPSHOT_FILE);
            let bytes = fs::read(path)?;
            serde_json::from_slice(&bytes)?
        };
        self.newest_on_disk.store(loaded_version, Ordering::SeqCst);

        let index = build_index(meta, rows);
        index.meta().bump_version(loaded_version);
        let tail = store.delta_after(loaded_version)?;
        info!(loaded_version, tail_len = tail.len(), "recovering index, replaying tail deltas");
        index.apply(&tail)?;
        Ok(index)
    }

    /// persist(): if `index.version() > newest_on_disk_version`, dump the
    /// engine's current row set into a freshly-named staging directory,
    /// rename it to the engine-reported version, touch `.write_done`, then
    /// GC every sibling version except `{current, dump_version}`. Returns
    /// 0 (no version promoted) when there is nothing new to persist.
    pub fn persist(&self, index: &dyn Index, now_ns: u64) -> Result<u64> {
        let engine_version = index.version();
        let current = self.newest_on_disk.load(Ordering::SeqCst);
        if engine_version <= current {
            return Ok(0);
        }

        let versions_dir = self.versions_dir();
        fs::create_dir_all(&versions_dir)?;
        let staging = versions_dir.join(format!("{}.tmp", now_ns));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let snapshot = index.snapshot()?;
        fs::write(staging.join(SNAPSHOT_FILE), &snapshot)?;

        let dump_version = engine_version;
        let final_dir = versions_dir.join(dump_version.to_string());
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&staging, &final_dir)?;

        let marker = versions_dir.join(format!("{}{}", dump_version, WRITE_DONE_SUFFIX));
        fs::write(&marker, [])?;

        self.newest_on_disk.store(dump_version, Ordering::SeqCst);
        if let Err(e) = self.gc_except(&[current, dump_version]) {
            warn!(error = %e, "index version GC failed, leaving stale versions on disk");
        }
        Ok(dump_version)
    }

    fn gc_except(&self, keep: &[u64]) -> Result<()> {
        let versions_dir = self.versions_dir();
        if !versions_dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&versions_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let base = name.strip_suffix(WRITE_DONE_SUFFIX).unwrap_or(&name);
            let Ok(version) = base.parse::<u64>() else {
                continue;
            };
            if keep.contains(&version) {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                let _ = fs::remove_dir_all(&path);
            } else {
                let _ = fs::remove_file(&path);
            }
        }
        Ok(())
    }

    /// Release any in-memory handles. Persistent indexes hold no open file
    /// descriptors between calls, so this is a no-op kept for symmetry
    /// with the in-memory engines' scoped resource contract.
    pub fn close(&self) {}
}
