//! Deterministic text embeddings for catalog matching.
//!
//! The pipeline embeds catalog descriptions and requirement texts into
//! fixed-length vectors and matches them by distance. The default
//! [`HashEmbedder`] derives vectors from a content digest: it carries no
//! semantic signal, but it is deterministic, dependency-free, and exercises
//! the full index and matching path. A semantic model slots in later as
//! another [`Embedder`] implementation with the same dimension contract.

use sha2::{Digest, Sha256};

/// Fixed embedding dimension shared by embedders and the vector index.
pub const EMBEDDING_DIM: usize = 16;

/// Maps text to a fixed-length numeric vector.
///
/// Implementations must be deterministic: identical input text yields a
/// bit-identical vector across calls and process restarts. Embedding is
/// total over any string, including the empty string.
pub trait Embedder: Send + Sync {
    /// Dimension of every vector produced by [`Embedder::embed`].
    fn dimension(&self) -> usize;

    /// Embed a single text.
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Embed a batch of texts, preserving input order.
    fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

/// Digest-based embedder: the first [`EMBEDDING_DIM`] bytes of a SHA-256
/// digest of the text, each normalized to `[0, 1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashEmbedder;

impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        digest[..EMBEDDING_DIM]
            .iter()
            .map(|byte| f32::from(*byte) / 255.0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_deterministic() {
        let embedder = HashEmbedder;
        let a = embedder.embed("Laptop i7 16GB 512SSD");
        let b = embedder.embed("Laptop i7 16GB 512SSD");
        assert_eq!(a, b);
    }

    #[test]
    fn embedding_has_fixed_dimension_and_range() {
        let embedder = HashEmbedder;
        for text in ["", "monitor", "a much longer requirement description"] {
            let vector = embedder.embed(text);
            assert_eq!(vector.len(), EMBEDDING_DIM);
            assert!(vector.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn distinct_texts_embed_differently() {
        let embedder = HashEmbedder;
        let a = embedder.embed("24 inch monitor");
        let b = embedder.embed("27 inch monitor");
        assert_ne!(a, b);
    }

    #[test]
    fn batch_preserves_order() {
        let embedder = HashEmbedder;
        let texts = vec!["first".to_string(), "second".to_string()];
        let batch = embedder.embed_batch(&texts);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], embedder.embed("first"));
        assert_eq!(batch[1], embedder.embed("second"));
    }
}
