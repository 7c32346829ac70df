//! Deterministic local embedding provider.
//!
//! Maps text to fixed-dimension unit vectors with a hashed bag-of-ngrams
//! projection: every word token and each character trigram is hashed to a
//! dimension and a sign, accumulated, and the result L2-normalized. The
//! model is fully local and deterministic — the same text always produces
//! the same vector — which is what the cache's idempotence law requires.
//!
//! Batches run on the blocking thread pool so a large insert never stalls
//! the request path. [`Embedder::warm`] runs one throwaway batch at startup
//! so first-call latency stays off the hot path.

use anyhow::{ensure, Result};
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;

pub struct Embedder {
    dims: usize,
    batch_size: usize,
}

impl Embedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            dims: config.dims,
            batch_size: config.batch_size,
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Run one throwaway batch so lazy allocations happen before the first
    /// request arrives.
    pub async fn warm(&self) -> Result<()> {
        let v = self.embed_batch(&["warm-up".to_string()]).await?;
        ensure!(v.len() == 1 && v[0].len() == self.dims, "warm-up produced a malformed vector");
        Ok(())
    }

    /// Embed a batch of texts, preserving input order.
    ///
    /// Inputs larger than the configured batch size are processed in
    /// consecutive sub-batches. Every returned vector is L2-normalized.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let dims = self.dims;
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let batch: Vec<String> = batch.to_vec();
            let vectors = tokio::task::spawn_blocking(move || {
                batch.iter().map(|t| embed_text(dims, t)).collect::<Vec<_>>()
            })
            .await?;
            out.extend(vectors);
        }
        Ok(out)
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("empty embedding batch result"))
    }
}

/// Hashed bag-of-ngrams projection for one text.
fn embed_text(dims: usize, text: &str) -> Vec<f32> {
    let mut acc = vec![0.0f32; dims];

    for token in crate::chunker::tokenize(&text.to_lowercase()) {
        bump(&mut acc, token.as_bytes(), 1.0);

        // Character trigrams give sub-word signal for near-duplicate text.
        let bytes = token.as_bytes();
        if bytes.len() > 3 {
            for gram in bytes.windows(3) {
                bump(&mut acc, gram, 0.5);
            }
        }
    }

    normalize(&mut acc);
    acc
}

/// Hash `feature` to a dimension and sign, add `weight` at that position.
fn bump(acc: &mut [f32], feature: &[u8], weight: f32) {
    let digest = Sha256::digest(feature);
    let idx = u64::from_le_bytes(digest[0..8].try_into().unwrap()) as usize % acc.len();
    let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
    acc[idx] += sign * weight;
}

/// L2-normalize in place. The zero vector stays zero.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity of two vectors. For unit vectors this is the dot product.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;

    fn embedder() -> Embedder {
        Embedder::new(&EmbeddingConfig::default())
    }

    #[tokio::test]
    async fn test_vectors_are_unit_length() {
        let e = embedder();
        let vectors = e
            .embed_batch(&[
                "how do I deploy to production".to_string(),
                "CTT-21761 login bug".to_string(),
            ])
            .await
            .unwrap();
        for v in &vectors {
            assert_eq!(v.len(), 384);
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-6, "norm was {}", norm);
        }
    }

    #[tokio::test]
    async fn test_deterministic() {
        let e = embedder();
        let a = e.embed_query("deployment process runbook").await.unwrap();
        let b = e.embed_query("deployment process runbook").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_similar_text_scores_higher() {
        let e = embedder();
        let q = e.embed_query("how do I deploy to production").await.unwrap();
        let close = e
            .embed_query("deploy to production with the deploy runbook")
            .await
            .unwrap();
        let far = e
            .embed_query("quarterly marketing budget spreadsheet totals")
            .await
            .unwrap();
        assert!(cosine(&q, &close) > cosine(&q, &far));
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let e = embedder();
        let texts: Vec<String> = (0..70).map(|i| format!("text number {}", i)).collect();
        let batched = e.embed_batch(&texts).await.unwrap();
        assert_eq!(batched.len(), 70);
        for (i, text) in texts.iter().enumerate() {
            let single = e.embed_query(text).await.unwrap();
            assert_eq!(batched[i], single, "order broken at {}", i);
        }
    }

    #[tokio::test]
    async fn test_warm() {
        let e = embedder();
        e.warm().await.unwrap();
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine(&[], &[]), 0.0);
    }
}
