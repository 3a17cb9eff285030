//! Embedding and summarisation provider traits.
//!
//! The service never calls a language model directly; these traits are the
//! only seam. Retrieval works lexical-only when no embedding provider is
//! configured, and the consolidator falls back to extractive compaction when
//! no summarisation provider is configured.

use crate::EngramResult;
use async_trait::async_trait;

/// Generates embedding vectors for chunk and query text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed one text. Implementations should be deterministic per model.
    async fn embed(&self, text: &str) -> EngramResult<Vec<f32>>;

    /// Identifier of the embedding model (recorded for rebuild safety).
    fn model_id(&self) -> &str;

    /// Dimensionality of produced vectors.
    fn dimensions(&self) -> usize;
}

/// Produces compact summaries for handoff tier transitions.
#[async_trait]
pub trait SummarizationProvider: Send + Sync {
    /// Summarize `text` into at most `max_tokens` (estimated) tokens.
    async fn summarize(&self, text: &str, max_tokens: i32) -> EngramResult<String>;
}

/// Cosine similarity between two vectors; 0.0 on dimension mismatch.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identity() {
        let v = vec![0.5, 0.5, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_mismatch_is_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
