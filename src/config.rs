//! Configuration loading and validation.
//!
//! Configuration comes from an optional TOML file plus a fixed set of
//! environment variables that override it:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `BIND_ADDR` | `[server].bind` |
//! | `STORE_URL` | `[store].url` (SQLite path for settings + transcripts) |
//! | `VECTOR_DIR` | `[cache].dir` (directory holding the vector cache DB) |
//! | `LOG_LEVEL` | `[server].log_level` (tracing `EnvFilter` directive) |
//! | `CORS_ORIGINS` | `[server].cors_origins` (comma-separated, `*` for any) |
//!
//! All tunables carry defaults, so a process with no file and no environment
//! starts with a usable local configuration. Invalid values fail loading —
//! the binary maps that to exit code 1.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rategate: RateGateConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    /// Base URLs for the per-source search services, keyed by source wire
    /// name (e.g. `jira = "http://localhost:8016"`).
    #[serde(default)]
    pub sources: std::collections::HashMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_cors")]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            log_level: default_log_level(),
            cors_origins: default_cors(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite path (or `sqlite:` URL) for the settings + transcript store.
    #[serde(default = "default_store_url")]
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Directory holding the vector cache database.
    #[serde(default = "default_vector_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Minimum cosine similarity for a cache lookup hit.
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// Results returned per cache lookup.
    #[serde(default = "default_cache_k")]
    pub top_k: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_vector_dir(),
            capacity: default_cache_capacity(),
            min_score: default_min_score(),
            top_k: default_cache_k(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_chunk_max_tokens(),
            overlap_tokens: default_chunk_overlap(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dims: default_dims(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateGateConfig {
    /// Token bucket capacity (burst bound).
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Token bucket refill rate, tokens per second.
    #[serde(default = "default_refill")]
    pub refill_per_sec: f64,
    /// Sliding window request quota.
    #[serde(default = "default_window_requests")]
    pub window_requests: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            refill_per_sec: default_refill(),
            window_requests: default_window_requests(),
            window_secs: default_window_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BreakerConfig {
    /// Failure-rate threshold that opens the circuit.
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,
    /// Minimum samples in the rolling window before the rate is evaluated.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Rolling window over which outcomes are counted.
    #[serde(default = "default_breaker_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_cool_down_secs")]
    pub cool_down_secs: u64,
    #[serde(default = "default_cool_down_max_secs")]
    pub cool_down_max_secs: u64,
    /// Concurrent probes admitted in half-open.
    #[serde(default = "default_probes")]
    pub probes: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate: default_failure_rate(),
            min_samples: default_min_samples(),
            window_secs: default_breaker_window_secs(),
            cool_down_secs: default_cool_down_secs(),
            cool_down_max_secs: default_cool_down_max_secs(),
            probes: default_probes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,
    #[serde(default = "default_per_source_limit")]
    pub per_source_limit: usize,
    #[serde(default = "default_per_source_timeout_ms")]
    pub per_source_timeout_ms: u64,
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    /// Prior transcript turns included in the prompt.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_sources: default_max_sources(),
            per_source_limit: default_per_source_limit(),
            per_source_timeout_ms: default_per_source_timeout_ms(),
            deadline_ms: default_deadline_ms(),
            token_budget: default_token_budget(),
            history_turns: default_history_turns(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    /// Total chunks kept per document (best chunk plus extras).
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,
    /// Tokens reserved per accepted chunk for separators and provenance.
    #[serde(default = "default_separator_overhead")]
    pub separator_overhead: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_chunks_per_doc: default_max_chunks_per_doc(),
            separator_overhead: default_separator_overhead(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_first_token_timeout_ms")]
    pub first_token_timeout_ms: u64,
    /// Bound of the in-flight token channel; the SSE writer is the sink.
    #[serde(default = "default_token_channel_cap")]
    pub token_channel_cap: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            first_token_timeout_ms: default_first_token_timeout_ms(),
            token_channel_cap: default_token_channel_cap(),
        }
    }
}

/// Per-source overrides: service endpoint and limiter tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(default)]
    pub refill_per_sec: Option<f64>,
    #[serde(default)]
    pub window_requests: Option<usize>,
    #[serde(default)]
    pub window_secs: Option<u64>,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_cors() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_shutdown_grace_ms() -> u64 {
    200
}
fn default_store_url() -> String {
    "./data/askgate.sqlite".to_string()
}
fn default_vector_dir() -> PathBuf {
    PathBuf::from("./data/vectors")
}
fn default_cache_capacity() -> usize {
    100_000
}
fn default_min_score() -> f32 {
    0.35
}
fn default_cache_k() -> usize {
    3
}
fn default_chunk_max_tokens() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    64
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    32
}
fn default_burst() -> u32 {
    10
}
fn default_refill() -> f64 {
    5.0
}
fn default_window_requests() -> usize {
    60
}
fn default_window_secs() -> u64 {
    60
}
fn default_failure_rate() -> f64 {
    0.5
}
fn default_min_samples() -> usize {
    5
}
fn default_breaker_window_secs() -> u64 {
    60
}
fn default_cool_down_secs() -> u64 {
    30
}
fn default_cool_down_max_secs() -> u64 {
    300
}
fn default_probes() -> usize {
    2
}
fn default_max_sources() -> usize {
    6
}
fn default_per_source_limit() -> usize {
    5
}
fn default_per_source_timeout_ms() -> u64 {
    10_000
}
fn default_deadline_ms() -> u64 {
    30_000
}
fn default_token_budget() -> usize {
    4_096
}
fn default_history_turns() -> usize {
    6
}
fn default_max_chunks_per_doc() -> usize {
    3
}
fn default_separator_overhead() -> usize {
    8
}
fn default_first_token_timeout_ms() -> u64 {
    20_000
}
fn default_token_channel_cap() -> usize {
    32
}

impl Config {
    pub fn per_source_timeout(&self) -> Duration {
        Duration::from_millis(self.query.per_source_timeout_ms)
    }

    pub fn query_deadline(&self) -> Duration {
        Duration::from_millis(self.query.deadline_ms)
    }

    pub fn first_token_timeout(&self) -> Duration {
        Duration::from_millis(self.llm.first_token_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.server.shutdown_grace_ms)
    }
}

/// Load configuration from an optional TOML file, apply environment
/// overrides, and validate.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config: Config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)
                .with_context(|| format!("Failed to read config file: {}", p.display()))?;
            toml::from_str(&content).with_context(|| "Failed to parse config file")?
        }
        None => Config::default(),
    };

    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("BIND_ADDR") {
        config.server.bind = v;
    }
    if let Ok(v) = std::env::var("STORE_URL") {
        config.store.url = v;
    }
    if let Ok(v) = std::env::var("VECTOR_DIR") {
        config.cache.dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("LOG_LEVEL") {
        config.server.log_level = v;
    }
    if let Ok(v) = std::env::var("CORS_ORIGINS") {
        config.server.cors_origins = v.split(',').map(|s| s.trim().to_string()).collect();
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 || config.embedding.batch_size > 32 {
        anyhow::bail!("embedding.batch_size must be in 1..=32");
    }
    if !(0.0..=1.0).contains(&config.breaker.failure_rate) {
        anyhow::bail!("breaker.failure_rate must be in [0.0, 1.0]");
    }
    if config.breaker.probes == 0 {
        anyhow::bail!("breaker.probes must be >= 1");
    }
    if config.rategate.burst == 0 || config.rategate.refill_per_sec <= 0.0 {
        anyhow::bail!("rategate.burst and rategate.refill_per_sec must be positive");
    }
    if config.rategate.window_requests == 0 {
        anyhow::bail!("rategate.window_requests must be >= 1");
    }
    if config.query.max_sources == 0 {
        anyhow::bail!("query.max_sources must be >= 1");
    }
    if config.query.token_budget == 0 {
        anyhow::bail!("query.token_budget must be > 0");
    }
    if !(0.0..=1.0).contains(&config.cache.min_score) {
        anyhow::bail!("cache.min_score must be in [0.0, 1.0]");
    }
    if config.server.bind.parse::<std::net::SocketAddr>().is_err() {
        anyhow::bail!("server.bind is not a valid socket address: {}", config.server.bind);
    }
    for key in config.sources.keys() {
        if crate::models::SourceId::parse(key).is_none() {
            anyhow::bail!("unknown source in [sources]: '{}'", key);
        }
    }
    Ok(())
}
