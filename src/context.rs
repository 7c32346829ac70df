//! Context assembly: score, deduplicate, and pack chunks under a budget.
//!
//! Input is the aggregated per-source document lists plus any vector-cache
//! hits. The builder:
//!
//! 1. chunks every fetched document,
//! 2. embeds the query and all new chunks in one batched call,
//! 3. scores each chunk by cosine against the query — blended with the
//!    source's native relevance (`0.7 * semantic + 0.3 * normalized_native`)
//!    when one was reported,
//! 4. stable-sorts descending by score,
//! 5. keeps at most `max_chunks_per_doc` chunks per `(source, doc_id)`,
//!    re-emitted in document ordinal order,
//! 6. greedily packs chunks until the token budget is spent, each accepted
//!    chunk reserving `token_count + separator_overhead`.
//!
//! The output carries provenance and the `used_sources` set — the sources
//! that actually contributed a chunk, which is what the client sees.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::chunker;
use crate::config::{ChunkingConfig, ContextConfig};
use crate::embedder::{cosine, Embedder};
use crate::models::{Chunk, Document, SourceId};

const SEMANTIC_WEIGHT: f32 = 0.7;
const NATIVE_WEIGHT: f32 = 0.3;

/// A chunk selected into the prompt, with its blended score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// The packed context for one query.
#[derive(Debug, Clone, Default)]
pub struct ContextPack {
    /// Selected chunks, highest score first.
    pub chunks: Vec<ScoredChunk>,
    /// Sources that contributed at least one chunk, in selection order.
    pub used_sources: Vec<SourceId>,
    /// Total tokens reserved, separators included.
    pub total_tokens: usize,
}

impl ContextPack {
    /// Distinct documents in pack order, for the `documents` payload.
    pub fn documents(&self) -> Vec<&Chunk> {
        let mut seen: Vec<(SourceId, &str)> = Vec::new();
        let mut docs = Vec::new();
        for sc in &self.chunks {
            let key = (sc.chunk.source, sc.chunk.doc_id.as_str());
            if !seen.contains(&key) {
                seen.push(key);
                docs.push(&sc.chunk);
            }
        }
        docs
    }

    /// Render the chunks into the context block of the prompt.
    pub fn render(&self) -> String {
        self.chunks
            .iter()
            .map(|sc| {
                let url = sc.chunk.url.as_deref().unwrap_or("-");
                format!(
                    "Source: {}\nTitle: {}\nURL: {}\n{}",
                    sc.chunk.source, sc.chunk.title, url, sc.chunk.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }
}

pub struct ContextBuilder {
    embedder: Arc<Embedder>,
    chunking: ChunkingConfig,
    config: ContextConfig,
}

impl ContextBuilder {
    pub fn new(embedder: Arc<Embedder>, chunking: ChunkingConfig, config: ContextConfig) -> Self {
        Self {
            embedder,
            chunking,
            config,
        }
    }

    /// Chunk a fetched document set; exposed for the orchestrator's cache
    /// write-back path, which chunks and embeds off the query's critical path.
    pub fn chunk_documents(&self, documents: &[Document]) -> Vec<Chunk> {
        documents
            .iter()
            .flat_map(|d| {
                chunker::chunk_document(d, self.chunking.max_tokens, self.chunking.overlap_tokens)
            })
            .collect()
    }

    /// Build the context pack for `query_text`.
    ///
    /// `fetched` is the orchestrator's aggregation in selection order;
    /// `cached` are vector-cache hits with their lookup scores, which skip
    /// re-embedding. The pack never exceeds `token_budget`.
    pub async fn build(
        &self,
        query_text: &str,
        fetched: &[(SourceId, Vec<Document>)],
        cached: Vec<(f32, Chunk)>,
        token_budget: usize,
    ) -> Result<ContextPack> {
        // Native score normalization bounds per source batch.
        let mut native_bounds: HashMap<SourceId, (f32, f32)> = HashMap::new();
        for (source, docs) in fetched {
            let scores: Vec<f32> = docs.iter().filter_map(|d| d.score).collect();
            if let (Some(min), Some(max)) = (
                scores.iter().copied().reduce(f32::min),
                scores.iter().copied().reduce(f32::max),
            ) {
                native_bounds.insert(*source, (min, max));
            }
        }

        let doc_scores: HashMap<(SourceId, String), f32> = fetched
            .iter()
            .flat_map(|(source, docs)| {
                docs.iter().filter_map(|d| {
                    d.score
                        .map(|s| ((*source, d.id.clone()), normalize_native(s, native_bounds[source])))
                })
            })
            .collect();

        let chunks: Vec<Chunk> = fetched
            .iter()
            .flat_map(|(_, docs)| self.chunk_documents(docs))
            .collect();

        // One batched call embeds the query and every new chunk.
        let mut texts: Vec<String> = Vec::with_capacity(chunks.len() + 1);
        texts.push(query_text.to_string());
        texts.extend(chunks.iter().map(|c| c.text.clone()));
        let mut vectors = self.embedder.embed_batch(&texts).await?;
        let query_vector = vectors.remove(0);

        let mut scored: Vec<ScoredChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                let semantic = cosine(&query_vector, &vector);
                let score = match doc_scores.get(&(chunk.source, chunk.doc_id.clone())) {
                    Some(native) => SEMANTIC_WEIGHT * semantic + NATIVE_WEIGHT * native,
                    None => semantic,
                };
                ScoredChunk { chunk, score }
            })
            .collect();

        // Cache hits arrive pre-scored by the lookup.
        scored.extend(
            cached
                .into_iter()
                .map(|(score, chunk)| ScoredChunk { chunk, score }),
        );

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let deduped = self.dedup(scored);
        Ok(self.pack(deduped, token_budget))
    }

    /// Keep at most `max_chunks_per_doc` chunks per `(source, doc_id)` —
    /// the best-scoring ones — re-emitted in document ordinal order at the
    /// position of the document's best chunk.
    fn dedup(&self, scored: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
        let cap = self.config.max_chunks_per_doc.max(1);
        let mut kept_per_doc: HashMap<(SourceId, String), Vec<ScoredChunk>> = HashMap::new();
        let mut doc_order: Vec<(SourceId, String)> = Vec::new();

        for sc in scored {
            let key = (sc.chunk.source, sc.chunk.doc_id.clone());
            let entry = kept_per_doc.entry(key.clone()).or_default();
            if entry.is_empty() {
                doc_order.push(key);
            }
            if entry.len() < cap {
                entry.push(sc);
            }
        }

        let mut out = Vec::new();
        for key in doc_order {
            let mut group = kept_per_doc.remove(&key).unwrap_or_default();
            group.sort_by_key(|sc| sc.chunk.ordinal);
            out.extend(group);
        }
        out
    }

    fn pack(&self, candidates: Vec<ScoredChunk>, token_budget: usize) -> ContextPack {
        let mut pack = ContextPack::default();
        for sc in candidates {
            let cost = sc.chunk.token_count + self.config.separator_overhead;
            if pack.total_tokens + cost > token_budget {
                continue;
            }
            pack.total_tokens += cost;
            if !pack.used_sources.contains(&sc.chunk.source) {
                pack.used_sources.push(sc.chunk.source);
            }
            pack.chunks.push(sc);
        }
        pack
    }
}

fn normalize_native(score: f32, (min, max): (f32, f32)) -> f32 {
    if (max - min).abs() < f32::EPSILON {
        1.0
    } else {
        (score - min) / (max - min)
    }
}
