//! Offline stand-ins for the LLM and embedding services.

use async_trait::async_trait;

use super::{Embedder, LanguageModel};
use crate::knowledge::embeddings::normalize;
use crate::{Error, Result};

/// Text-completion backend that is never available. Every LLM-backed step takes
/// its fallback path.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineModel;

#[async_trait]
impl LanguageModel for OfflineModel {
    async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
        Err(Error::LlmError("no language model configured".to_string()))
    }

    async fn is_available(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "offline"
    }
}

/// Deterministic, fast embedding for offline/local use: bag of hashed lowercase
/// tokens, L2-normalised. Buckets come from BLAKE3, so stored vectors stay
/// comparable with query vectors built by any later build.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vec[self.bucket(&token.to_lowercase())] += 1.0;
        }

        normalize(&mut vec);
        vec
    }

    /// Bucket of an already-lowercased token: first 8 digest bytes, little endian.
    fn bucket(&self, token: &str) -> usize {
        let digest = blake3::hash(token.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        (u64::from_le_bytes(head) % self.dim as u64) as usize
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn name(&self) -> &str {
        "local-hash"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::embeddings::cosine_similarity;

    #[test]
    fn offline_model_always_fails() {
        let model = OfflineModel;
        assert!(!tokio_test::block_on(model.is_available()));
        let err = tokio_test::block_on(model.complete("system", "prompt")).unwrap_err();
        assert!(matches!(err, Error::LlmError(_)));
    }

    #[test]
    fn hashing_embedder_buckets_are_pinned() {
        let small = HashingEmbedder::new(64);
        assert_eq!(small.bucket("acme"), 59);
        assert_eq!(small.bucket("revenue"), 6);
        assert_eq!(small.bucket("q3"), 35);

        let wide = HashingEmbedder::new(256);
        assert_eq!(wide.bucket("acme"), 187);
        assert_eq!(wide.bucket("q3"), 227);

        let vector = small.embed("ACME");
        assert!((vector[59] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn hashing_embedder_minimum_dimension() {
        assert_eq!(HashingEmbedder::new(2).dimension(), 8);
    }

    #[test]
    fn hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("Acme revenue grew");
        let b = embedder.embed("acme REVENUE grew");

        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_embedder_ignores_punctuation() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("Acme's revenue, Q3!");
        let b = embedder.embed("Acme s revenue Q3");
        assert!(cosine_similarity(&a, &b) > 0.99);
    }

    #[test]
    fn hashing_embedder_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        let v = embedder.embed("   ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn embed_batch_preserves_order() {
        let embedder = HashingEmbedder::new(32);
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();

        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], embedder.embed("alpha"));
        assert_eq!(vectors[1], embedder.embed("beta"));
    }
}
