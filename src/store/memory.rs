//! Volatile (in-memory) store: a label-keyed map plus an ordered delta
//! buffer, both behind `parking_lot` locks for low-overhead concurrent
//! access.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::id::VersionClock;
use crate::record::{CandidateData, DeltaRecord};

use super::Store;

pub struct VolatileStore {
    candidates: DashMap<u64, CandidateData>,
    deltas: Mutex<Vec<DeltaRecord>>,
    versions: VersionClock,
}

impl VolatileStore {
    pub fn new(versions: VersionClock) -> Self {
        VolatileStore {
            candidates: DashMap::new(),
            deltas: Mutex::new(Vec::new()),
            versions,
        }
    }
}

impl Store for VolatileStore {
    fn add(&self, candidates: Vec<CandidateData>, need_delta: bool) -> Result<Vec<DeltaRecord>> {
        let mut out = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let old_fields = self
                .candidates
                .insert(candidate.label, candidate.clone())
                .map(|old| old.fields);
            if need_delta {
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
                self.deltas.lock().push(delta.clone());
                out.push(delta);
            }
        }
        Ok(out)
    }

    fn delete(&self, labels: &[u64], need_delta: bool) -> Result<Vec<DeltaRecord>> {
        let mut out = Vec::with_capacity(labels.len());
        for &label in labels {
            let old_fields = self.candidates.remove(&label).map(|(_, v)| v.fields);
            if need_delta {
                let version = self.versions.next();
                let delta = DeltaRecord::Del { version, label, old_fields };
                self.deltas.lock().push(delta.clone());
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
        self.deltas.lock().retain(|d| d.version() >= version);
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
        Ok(())
    }
}

pub fn new_volatile_store(clock: Arc<dyn crate::id::Clock>) -> VolatileStore {
    VolatileStore::new(VersionClock::new(clock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SystemClock;
    use crate::schema::FieldMap;

    fn candidate(label: u64) -> CandidateData {
        CandidateData {
            label,
            fields: FieldMap::new(),
            dense: None,
            sparse: None,
            expire_ns: 0,
        }
    }

    #[test]
    fn add_then_fetch_roundtrips() {
        let store = new_volatile_store(Arc::new(SystemClock));
        store.add(vec![candidate(1), candidate(2)], false).unwrap();
        let fetched = store.fetch(&[1, 2, 3]).unwrap();
        assert!(fetched[0].is_some());
        assert!(fetched[1].is_some());
        assert!(fetched[2].is_none());
    }

    #[test]
    fn delete_removes_from_store() {
        let store = new_volatile_store(Arc::new(SystemClock));
        store.add(vec![candidate(1)], false).unwrap();
        store.delete(&[1], false).unwrap();
        assert!(store.fetch(&[1]).unwrap()[0].is_none());
    }

    #[test]
    fn delta_versions_strictly_increase() {
        let store = new_volatile_store(Arc::new(SystemClock));
        let deltas = store.add(vec![candidate(1), candidate(2)], true).unwrap();
        assert!(deltas[0].version() < deltas[1].version());
    }

    #[test]
    fn delta_after_excludes_up_to_version() {
        let store = new_volatile_store(Arc::new(SystemClock));
        let deltas = store.add(vec![candidate(1), candidate(2), candidate(3)], true).unwrap();
        let tail = store.delta_after(deltas[0].version()).unwrap();
        assert_eq!(tail.len(), 2);
    }

    #[test]
    fn expire_evicts_past_deadline() {
        let store = new_volatile_store(Arc::new(SystemClock));
        let mut c = candidate(1);
        c.expire_ns = 100;
        store.add(vec![c], false).unwrap();
        let deltas = store.expire(200).unwrap();
        assert_eq!(deltas.len(), 1);
        assert!(store.fetch(&[1]).unwrap()[0].is_none());
    }
}
