//! The Store: durable record storage plus an append-only delta log.
//!
//! Two implementations share the [`Store`] trait: an in-memory structure
//! and a disk-backed one, behind one set of traits so a `Collection` can
//! be generic over either.

mod memory;
mod persistent;

pub use memory::VolatileStore;
pub use persistent::PersistentStore;

use crate::error::Result;
use crate::record::{CandidateData, DeltaRecord};

/// Durable backing for records (the "candidate store") and for incremental
/// mutations (the "delta log").
pub trait Store: Send + Sync {
    /// Write-through add. Emits one `Put` delta per candidate when
    /// `need_delta` is set, carrying the prior fields (if any) so indexes
    /// can retract stale scalar-inverted-index entries.
    fn add(&self, candidates: Vec<CandidateData>, need_delta: bool) -> Result<Vec<DeltaRecord>>;

    /// Dual of `add`; emits `Del` deltas.
    fn delete(&self, labels: &[u64], need_delta: bool) -> Result<Vec<DeltaRecord>>;

    /// Bulk fetch, preserving input order; `None` for missing labels.
    fn fetch(&self, labels: &[u64]) -> Result<Vec<Option<CandidateData>>>;

    /// Every live (non-tombstoned) candidate. Used to build/rebuild indexes.
    fn all(&self) -> Result<Vec<CandidateData>>;

    /// Deltas with version strictly greater than `version`, in version
    /// order. Used to catch an index up after restart.
    fn delta_after(&self, version: u64) -> Result<Vec<DeltaRecord>>;

    /// Drop delta-log entries no longer needed by any index.
    fn delete_delta_before(&self, version: u64) -> Result<()>;

    /// Evict candidates whose `expire_ns` has passed `now_ns`, emitting
    /// `Del` deltas for each.
    fn expire(&self, now_ns: u64) -> Result<Vec<DeltaRecord>>;

    /// Remove all records and deltas (used by `delete_all`).
    fn clear(&self) -> Result<()>;
}
