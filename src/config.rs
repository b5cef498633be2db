//! Operational configuration handed to a collection at construction time.
//!
//! Nothing here is read from the environment or from a file by this crate;
//! the embedding application owns configuration sourcing (see design notes
//! on passing a `Runtime` aggregate's dependencies explicitly).

use serde::{Deserialize, Serialize};

/// Background scheduler cadence, mirrored from the component design.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub ttl_cleanup_seconds: u64,
    pub index_maintenance_seconds: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            ttl_cleanup_seconds: 10,
            index_maintenance_seconds: 30,
        }
    }
}

/// Where and how a collection's store/indexes are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreConfig {
    /// Nothing touches disk; data lives for the life of the process.
    Volatile,
    /// Durable storage rooted at `root`.
    Persistent { root: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Volatile
    }
}

/// Fraction of tombstoned entries (relative to live+dead) at which an index
/// is eligible for rebuild. Resolves the open question of parameterizing
/// the rebuild-need policy instead of hard-coding it in the scheduler.
pub const DEFAULT_REBUILD_THRESHOLD: f32 = 0.3;
