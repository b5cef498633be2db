//! Persistent store: a label-keyed in-memory mirror backed by an
//! append-only, line-delimited JSON delta log on disk. On open, the log is
//! replayed from the start to rebuild the mirror against this crate's own
//! delta shape.
//!
//! File locking uses `fs2::FileExt` rather than a hand-rolled unsafe
//! `flock`/`LockFileEx` wrapper, since `fs2` already covers exactly this.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use fs2::FileExt;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::id::VersionClock;
use crate::record::{CandidateData, DeltaRecord};

use super::Store;

const DELTA_LOG_FILE: &str = "delta_log.jsonl";
const LOCK_FILE: &str = ".store.lock";

pub struct PersistentStore {
    root: PathBuf,
    candidates: DashMap<u64, CandidateData>,
    deltas: Mutex<Vec<DeltaRecord>>,
    versions: VersionClock,
    log: Mutex<File>,
    _lock: File,
}

impl PersistentStore {
    pub fn open(root: impl AsRef<Path>, clock: Arc<dyn crate::id::Clock>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let lock_file = OpenOptions::new().create(true).write(true).open(root.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|e| Error::StoreIO(format!("store already open at {}: {}", root.display(), e)))?;

        let log_path = root.join(DELTA_LOG_FILE);
        let log = OpenOptions::new().create(true).read(true).append(true).open(&log_path)?;

        let candidates = DashMap::new();
        let mut max_version = 0u64;
        let deltas = replay_log(&log_path)?;
        for delta in deltas.iter() {
            apply_delta(&candidates, delta);
            max_version = max_version.max(delta.version());
        }

        let versions = VersionClock::new(clock);
        let store = PersistentStore {
            root,
            candidates,
            deltas: Mutex::new(deltas),
            versions,
            log: Mutex::new(log),
            _lock: lock_file,
        };
        store.versions.bump_past(max_version);
        Ok(store)
    }

    fn append_line(&self, delta: &DeltaRecord) -> Result<()> {
        let line = serde_json::to_string(delta)?;
        let mut log = self.log.lock();
        writeln!(log, "{}", line)?;
        log.flush()?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn apply_delta(candidates: &DashMap<u64, CandidateData>, delta: &DeltaRecord) {
    match delta {
        DeltaRecord::Put {
            label,
            fields,
            dense,
            sparse,
            expire_ns,
            ..
        } => {
            candidates.insert(
                *label,
                CandidateData {
                    label: *label,
                    fields: fields.clone(),
                    dense: dense.clone(),
                    sparse: sparse.clone(),
                    expire_ns: *expire_ns,
                },
            );
        }
        DeltaRecord::Del { label, .. } => {
            candidates.remove(label);
        }
    }
}

fn replay_log(path: &Path) -> Result<Vec<DeltaRecord>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

impl Store for PersistentStore {
    fn add(&self, candidates: Vec<CandidateData>, need_delta: bool) -> Result<Vec<DeltaRecord>> {
        let mut out = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let old_fields = self
                .candidates
                .insert(candidate.label, candidate.clone())
                .map(|old| old.fields);
            let version = self.versions.next();
            let delta = DeltaRecord::Put {
                version,
                label: candidate.label,
                fields: candidate.fields,
                dense: candidate.dense,
                sparse: candidate.sparse,
                expire_ns: candidate.expire_ns,
                old_fields,
            };
            self.append_line(&delta)?;
            self.deltas.lock().push(delta.clone());
            if need_delta {
                out.push(delta);
            }
        }
        Ok(out)
    }

    fn delete(&self, labels: &[u64], need_delta: bool) -> Result<Vec<DeltaRecord>> {
        let mut out = Vec::with_capacity(labels.len());
        for &label in labels {
            let old_fields = self.candidates.remove(&label).map(|(_, v)| v.fields);
            let version = self.versions.next();
            let delta = DeltaRecord::Del { version, label, old_fields };
            self.append_line(&delta)?;
            self.deltas.lock().push(delta.clone());
            if need_delta {
                out.push(delta);
            }
        }
        Ok(out)
    }

    fn fetch(&self, labels: &[u64]) -> Result<Vec<Option<CandidateData>>> {
        Ok(labels
            .iter()
            .map(|label| self.candidates.get(label).map(|r| r.value().clone()))
            .collect())
    }

    fn all(&self) -> Result<Vec<CandidateData>> {
        Ok(self.candidates.iter().map(|r| r.value().clone()).collect())
    }

    fn delta_after(&self, version: u64) -> Result<Vec<DeltaRecord>> {
        Ok(self
            .deltas
            .lock()
            .iter()
            .filter(|d| d.version() > version)
            .cloned()
            .collect())
    }

    fn delete_delta_before(&self, version: u64) -> Result<()> {
        let mut deltas = self.deltas.lock();
        deltas.retain(|d| d.version() >= version);
        let mut log = self.log.lock();
        let path = self.root.join(DELTA_LOG_FILE);
        let mut rewritten = File::create(&path)?;
        for delta in deltas.iter() {
            writeln!(rewritten, "{}", serde_json::to_string(delta)?)?;
        }
        rewritten.flush()?;
        drop(rewritten);
        *log = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
        Ok(())
    }

    fn expire(&self, now_ns: u64) -> Result<Vec<DeltaRecord>> {
        let expired: Vec<u64> = self
            .candidates
            .iter()
            .filter(|r| r.value().expire_ns > 0 && now_ns >= r.value().expire_ns)
            .map(|r| *r.key())
            .collect();
        self.delete(&expired, true)
    }

    fn clear(&self) -> Result<()> {
        self.candidates.clear();
        self.deltas.lock().clear();
        let path = self.root.join(DELTA_LOG_FILE);
        let mut log = self.log.lock();
        *log = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        *log = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
        Ok(())
    }
}

/// Helper kept small and dependency-free: a process-local map of open
/// store roots is unnecessary because `fs2`'s advisory lock already
/// prevents a second `PersistentStore::open` on the same directory.
pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}
