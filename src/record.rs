//! Record, CandidateData and DeltaRecord: the three shapes a piece of data
//! takes as it moves from caller input to durable delta.
//!
//! `CandidateData` holds the current value plus bookkeeping, `DeltaRecord`
//! represents a versioned mutation over it; the value type here is this
//! crate's closed `FieldMap` + vector pair rather than a generic
//! arbitrary value.

use serde::{Deserialize, Serialize};

use crate::schema::FieldMap;
use crate::vector::Dense;

pub type SparseVector = (Vec<String>, Vec<f32>);

/// A record as the caller sees it (upsert input or fetch/search output).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub fields: FieldMap,
    pub dense: Option<Dense>,
    pub sparse: Option<SparseVector>,
}

/// A record as stored durably: label-keyed, with its expiration deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateData {
    pub label: u64,
    pub fields: FieldMap,
    pub dense: Option<Dense>,
    pub sparse: Option<SparseVector>,
    /// 0 means "never expires"; otherwise an absolute epoch-ns deadline.
    pub expire_ns: u64,
}

/// A versioned mutation appended to the delta log and applied to every
/// registered index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeltaRecord {
    Put {
        version: u64,
        label: u64,
        fields: FieldMap,
        dense: Option<Dense>,
        sparse: Option<SparseVector>,
        /// 0 means "never expires"; otherwise an absolute epoch-ns deadline.
        /// Carried on the delta (not just the candidate) so a persistent
        /// store's replay reconstructs TTL state after a restart.
        expire_ns: u64,
        /// The prior fields, if this label already existed; used by
        /// indexes to retract stale scalar-inverted-index entries.
        old_fields: Option<FieldMap>,
    },
    Del {
        version: u64,
        label: u64,
        old_fields: Option<FieldMap>,
    },
}

impl DeltaRecord {
    pub fn version(&self) -> u64 {
        match self {
            DeltaRecord::Put { version, .. } => *version,
            DeltaRecord::Del { version, .. } => *version,
        }
    }

    pub fn label(&self) -> u64 {
        match self {
            DeltaRecord::Put { label, .. } => *label,
            DeltaRecord::Del { label, .. } => *label,
        }
    }
}
