//! The embedder collaborator: invoked only when a schema declares
//! `auto_vectorize` and the caller's upsert omits a vector.
//!
//! Kept a plain synchronous trait rather than `async_trait`, since this
//! crate has no async runtime dependency; the embedder call is the one
//! place `upsert` blocks on network, which a plain blocking call models
//! directly on this crate's thread-per-caller concurrency model.

use crate::error::Result;
use crate::record::SparseVector;
use crate::vector::Dense;

/// One item submitted to the embedder: arbitrary text/content the caller
/// wants turned into a dense (and optionally sparse) vector.
#[derive(Debug, Clone)]
pub struct EmbedItem {
    pub text: String,
}

impl EmbedItem {
    pub fn new(text: impl Into<String>) -> Self {
        EmbedItem { text: text.into() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EmbedResult {
    pub dense: Option<Dense>,
    pub sparse: Option<SparseVector>,
}

/// External embedding collaborator. Not implemented by this crate; the
/// embedding application supplies its own `Embedder` when constructing a
/// [`crate::collection::Collection`] whose schema declares vectorization.
pub trait Embedder: Send + Sync {
    fn embed_batch(&self, items: &[EmbedItem]) -> Result<Vec<EmbedResult>>;
}

/// Deterministic hash-based test double. Not a production embedder: it
/// exists so this crate's own test suite can exercise the vectorization
/// path (schema `auto_vectorize = true`, upsert without a vector) without a
/// real network collaborator. Produces a `dim`-wide unit-ish vector from a
/// simple rolling hash of the input text, stable across calls.
pub struct MockEmbedder {
    pub dim: usize,
}

impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        MockEmbedder { dim }
    }

    fn hash_vector(&self, text: &str) -> Dense {
        let mut out = vec![0.0f32; self.dim];
        let mut state: u64 = 1469598103934665603; // FNV offset basis
        for (i, byte) in text.bytes().enumerate() {
            state ^= byte as u64;
            state = state.wrapping_mul(1099511628211);
            out[i % self.dim] += ((state % 2003) as f32 / 2003.0) - 0.5;
        }
        crate::vector::normalize_in_place(&mut out);
        out
    }
}

impl Embedder for MockEmbedder {
    fn embed_batch(&self, items: &[EmbedItem]) -> Result<Vec<EmbedResult>> {
        Ok(items
            .iter()
            .map(|item| EmbedResult {
                dense: Some(self.hash_vector(&item.text)),
                sparse: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_embedder_is_deterministic_and_dim_correct() {
        let embedder = MockEmbedder::new(8);
        let a = embedder.embed_batch(&[EmbedItem::new("hello world")]).unwrap();
        let b = embedder.embed_batch(&[EmbedItem::new("hello world")]).unwrap();
        assert_eq!(a[0].dense.as_ref().unwrap().len(), 8);
        assert_eq!(a[0].dense, b[0].dense);
    }

    #[test]
    fn mock_embedder_differs_on_different_text() {
        let embedder = MockEmbedder::new(8);
        let results = embedder
            .embed_batch(&[EmbedItem::new("alpha"), EmbedItem::new("beta")])
            .unwrap();
        assert_ne!(results[0].dense, results[1].dense);
    }
}
