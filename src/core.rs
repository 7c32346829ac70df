//! The long-lived `Core`: every piece of shared state, constructed once at
//! startup and passed by reference. No module-level singletons, no hidden
//! global init; teardown flushes the vector cache and closes the pools.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::Config;
use crate::context::ContextBuilder;
use crate::embedder::Embedder;
use crate::models::{QueryOptions, Settings, SourceId};
use crate::rategate::RateGate;
use crate::router::Router;
use crate::store::Store;
use crate::vector_cache::VectorCache;

pub struct Core {
    pub config: Config,
    pub store: Store,
    pub cache: Arc<VectorCache>,
    pub embedder: Arc<Embedder>,
    pub rategate: Arc<RateGate>,
    pub breaker: Arc<CircuitBreaker>,
    pub router: Router,
}

impl Core {
    /// Open stores, build the limiters, and warm the embedder.
    pub async fn init(config: Config) -> Result<Self> {
        let store = Store::open(&config.store.url)
            .await
            .context("store unavailable at startup")?;
        let cache = Arc::new(VectorCache::open(&config.cache).await?);
        let embedder = Arc::new(Embedder::new(&config.embedding));
        embedder.warm().await?;

        Ok(Self {
            rategate: Arc::new(RateGate::from_config(&config)),
            breaker: Arc::new(CircuitBreaker::new(config.breaker.clone())),
            router: Router::new(),
            store,
            cache,
            embedder,
            config,
        })
    }

    pub fn context_builder(&self) -> ContextBuilder {
        ContextBuilder::new(
            Arc::clone(&self.embedder),
            self.config.chunking.clone(),
            self.config.context.clone(),
        )
    }

    /// Resolve per-query options from config defaults and user settings.
    pub fn query_options(&self, settings: &Settings) -> QueryOptions {
        QueryOptions {
            max_sources: self.config.query.max_sources,
            per_source_limit: self.config.query.per_source_limit,
            token_budget: self.config.query.token_budget,
            streaming: settings.use_streaming,
            enabled_sources: settings.enabled_sources.clone(),
        }
    }

    /// Sources the router must not select right now: open circuits plus
    /// sources with no registered endpoint.
    pub fn unavailable_sources(&self, registered: &[SourceId]) -> BTreeSet<SourceId> {
        SourceId::ALL
            .iter()
            .copied()
            .filter(|s| {
                if *s == SourceId::VectorCache {
                    return false;
                }
                self.breaker.state(*s) == CircuitState::Open || !registered.contains(s)
            })
            .collect()
    }

    pub async fn shutdown(&self) {
        self.cache.close().await;
        self.store.close().await;
    }
}
