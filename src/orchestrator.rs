//! Parallel fan-out across the selected sources.
//!
//! For each selected source the orchestrator:
//!
//! 1. acquires the rate gate under a sub-deadline
//!    (`min(per_source_timeout, query deadline)`),
//! 2. calls the adapter through the circuit breaker,
//! 3. on success, publishes the documents and schedules chunking, embedding,
//!    and a vector-cache insert as a detached write-back — the current query
//!    never waits for it,
//! 4. on failure, classifies the error (429 → rate-gate penalty, hard
//!    failures → breaker, other 4xx → neither) and publishes an empty result.
//!
//! Aggregation ends at the first of: every selected source has reported, or
//! the query deadline elapsed. Late results are discarded, but their cache
//! write-backs still land. Downstream ordering is the router's selection
//! order, never completion order.
//!
//! Cancelling the query token (client disconnect) aborts in-flight fetches;
//! a fetch cancelled that way records nothing against the circuit.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::chunker;
use crate::config::{ChunkingConfig, Config};
use crate::embedder::Embedder;
use crate::error::FetchError;
use crate::models::{Chunk, Document, Query, SelectionResult, SourceId};
use crate::rategate::RateGate;
use crate::source::SourceRegistry;
use crate::vector_cache::VectorCache;

/// Per-source outcome of one fan-out, for logs and the non-streaming reply.
#[derive(Debug)]
pub struct SearchReport {
    pub source: SourceId,
    pub result: Result<usize, FetchError>,
    pub elapsed_ms: u64,
}

/// Everything one fan-out produced.
#[derive(Debug, Default)]
pub struct Aggregation {
    /// Documents per source, in selection order. Sources that failed or
    /// returned nothing appear with an empty list.
    pub fetched: Vec<(SourceId, Vec<Document>)>,
    /// Vector-cache hits, scored, relabeled with `vector_cache` provenance.
    pub cache_hits: Vec<(f32, Chunk)>,
    pub reports: Vec<SearchReport>,
}

pub struct Orchestrator {
    rategate: Arc<RateGate>,
    breaker: Arc<CircuitBreaker>,
    registry: Arc<SourceRegistry>,
    cache: Arc<VectorCache>,
    embedder: Arc<Embedder>,
    chunking: ChunkingConfig,
    per_source_timeout: std::time::Duration,
    cache_top_k: usize,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        rategate: Arc<RateGate>,
        breaker: Arc<CircuitBreaker>,
        registry: Arc<SourceRegistry>,
        cache: Arc<VectorCache>,
        embedder: Arc<Embedder>,
    ) -> Self {
        Self {
            rategate,
            breaker,
            registry,
            cache,
            embedder,
            chunking: config.chunking.clone(),
            per_source_timeout: config.per_source_timeout(),
            cache_top_k: config.cache.top_k,
        }
    }

    /// Fan out to every source in `selection`, aggregate under the query
    /// deadline, and return results in selection order.
    pub async fn run(
        &self,
        query: &Query,
        selection: &SelectionResult,
        cancel: &CancellationToken,
    ) -> Aggregation {
        let mut aggregation = Aggregation::default();
        let started = Instant::now();

        let external: Vec<SourceId> = selection
            .sources
            .iter()
            .copied()
            .filter(|s| *s != SourceId::VectorCache)
            .collect();

        let (tx, mut rx) = mpsc::channel::<(SourceId, Result<Vec<Document>, FetchError>, u64)>(
            external.len().max(1),
        );

        for source in &external {
            let source = *source;
            let Some(adapter) = self.registry.get(source) else {
                aggregation.reports.push(SearchReport {
                    source,
                    result: Err(FetchError::Unavailable),
                    elapsed_ms: 0,
                });
                continue;
            };

            let tx = tx.clone();
            let cancel = cancel.clone();
            let rategate = Arc::clone(&self.rategate);
            let breaker = Arc::clone(&self.breaker);
            let cache = Arc::clone(&self.cache);
            let embedder = Arc::clone(&self.embedder);
            let chunking = self.chunking.clone();
            let query_text = query.text.clone();
            let limit = query.options.per_source_limit;
            let sub_deadline =
                Instant::now() + self.per_source_timeout.min(query.remaining());

            tokio::spawn(async move {
                let fetch_started = Instant::now();
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(FetchError::Cancelled),
                    result = fetch_one(
                        &rategate, &breaker, adapter, &query_text, limit, sub_deadline,
                    ) => result,
                };
                let elapsed = fetch_started.elapsed().as_millis() as u64;

                if let Ok(documents) = &result {
                    if !documents.is_empty() {
                        // Fire-and-forget: the write-back outlives the query.
                        let documents = documents.clone();
                        tokio::spawn(async move {
                            write_back(&cache, &embedder, &chunking, &documents).await;
                        });
                    }
                }
                let _ = tx.send((source, result, elapsed)).await;
            });
        }
        drop(tx);

        // The cache lookup runs inline: it is local and cheap.
        let expect_cache = selection.sources.contains(&SourceId::VectorCache);
        if expect_cache {
            match self.lookup_cache(&query.text).await {
                Ok(hits) => {
                    debug!(hits = hits.len(), "vector cache lookup");
                    aggregation.cache_hits = hits;
                    aggregation.reports.push(SearchReport {
                        source: SourceId::VectorCache,
                        result: Ok(aggregation.cache_hits.len()),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "vector cache lookup failed");
                    aggregation.reports.push(SearchReport {
                        source: SourceId::VectorCache,
                        result: Err(FetchError::Upstream(e.to_string())),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        // Collect until every spawned source reported or the deadline hit.
        let mut results: Vec<(SourceId, Vec<Document>)> = Vec::new();
        let pending = external
            .iter()
            .filter(|s| self.registry.get(**s).is_some())
            .count();
        let mut received = 0usize;
        while received < pending {
            let message = tokio::select! {
                _ = tokio::time::sleep(query.remaining()) => {
                    warn!(
                        pending = pending - received,
                        "query deadline elapsed mid-aggregation, discarding late sources"
                    );
                    break;
                }
                _ = cancel.cancelled() => break,
                message = rx.recv() => message,
            };
            let Some((source, result, elapsed_ms)) = message else {
                break;
            };
            received += 1;

            match result {
                Ok(documents) => {
                    info!(source = %source, count = documents.len(), elapsed_ms, "source responded");
                    aggregation.reports.push(SearchReport {
                        source,
                        result: Ok(documents.len()),
                        elapsed_ms,
                    });
                    results.push((source, documents));
                }
                Err(e) => {
                    warn!(source = %source, error = %e, elapsed_ms, "source failed");
                    aggregation.reports.push(SearchReport {
                        source,
                        result: Err(e),
                        elapsed_ms,
                    });
                    results.push((source, Vec::new()));
                }
            }
        }

        // Selection order, not completion order.
        aggregation.fetched = external
            .iter()
            .map(|s| {
                let documents = results
                    .iter()
                    .find(|(source, _)| source == s)
                    .map(|(_, documents)| documents.clone())
                    .unwrap_or_default();
                (*s, documents)
            })
            .collect();

        aggregation
    }

    async fn lookup_cache(&self, query_text: &str) -> anyhow::Result<Vec<(f32, Chunk)>> {
        if self.cache.is_empty() {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed_query(query_text).await?;
        let hits = self.cache.query(&vector, self.cache_top_k, None).await?;
        Ok(hits
            .into_iter()
            .map(|(score, entry)| {
                // Emitted provenance is the cache itself, not the source the
                // chunk originally came from.
                let mut chunk = entry.chunk;
                chunk.source = SourceId::VectorCache;
                (score, chunk)
            })
            .collect())
    }
}

/// One source's gated, breaker-wrapped fetch.
async fn fetch_one(
    rategate: &RateGate,
    breaker: &CircuitBreaker,
    adapter: Arc<dyn crate::source::SourceAdapter>,
    query_text: &str,
    limit: usize,
    sub_deadline: Instant,
) -> Result<Vec<Document>, FetchError> {
    rategate.acquire(adapter.id(), sub_deadline).await?;

    let permit = breaker.try_acquire(adapter.id())?;
    let remaining = sub_deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        breaker.record(permit, Err(&FetchError::DeadlineExceeded));
        return Err(FetchError::DeadlineExceeded);
    }

    let result = adapter.search(query_text, limit, remaining).await;

    match &result {
        Ok(_) => breaker.record(permit, Ok(())),
        Err(e) => {
            if let FetchError::RateLimited { retry_after } = e {
                let penalty = retry_after.unwrap_or(std::time::Duration::from_secs(30));
                rategate.penalize(adapter.id(), penalty);
            }
            breaker.record(permit, Err(e));
        }
    }
    result
}

/// Chunk, embed, and insert a successful fetch into the vector cache.
/// Runs detached from the query; failures are logged and dropped.
async fn write_back(
    cache: &VectorCache,
    embedder: &Arc<Embedder>,
    chunking: &ChunkingConfig,
    documents: &[Document],
) {
    let chunks: Vec<Chunk> = documents
        .iter()
        .flat_map(|d| chunker::chunk_document(d, chunking.max_tokens, chunking.overlap_tokens))
        .collect();
    if chunks.is_empty() {
        return;
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let embeddings = match embedder.embed_batch(&texts).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "cache write-back embedding failed");
            return;
        }
    };
    if let Err(e) = cache.insert(&chunks, &embeddings).await {
        warn!(error = %e, "cache write-back insert failed");
    }
    debug!(chunks = chunks.len(), "cache write-back complete");
}
