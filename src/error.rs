//! Crate-wide error type.
//!
//! One variant per error kind named in the design's error-handling table;
//! callers match on kind, the message carries the specifics.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),

    #[error("record invalid: {0}")]
    RecordInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store io: {0}")]
    StoreIO(String),

    #[error("index io: {0}")]
    IndexIO(String),

    #[error("embedder failed: {0}")]
    EmbedderFailed(String),

    #[error("aggregation invalid: {0}")]
    AggregationInvalid(String),

    #[error("resource closed: {0}")]
    ResourceClosed(String),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("json error")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::SchemaInvalid(_) => "SchemaInvalid",
            Error::RecordInvalid(_) => "RecordInvalid",
            Error::NotFound(_) => "NotFound",
            Error::Conflict(_) => "Conflict",
            Error::StoreIO(_) => "StoreIO",
            Error::IndexIO(_) => "IndexIO",
            Error::EmbedderFailed(_) => "EmbedderFailed",
            Error::AggregationInvalid(_) => "AggregationInvalid",
            Error::ResourceClosed(_) => "ResourceClosed",
            Error::Io(_) => "StoreIO",
            Error::Json(_) => "StoreIO",
        }
    }
}
