//! Source adapters: the uniform search contract over external systems.
//!
//! Every integration satisfies [`SourceAdapter`]: a bounded `search`, a cheap
//! `healthy` probe, and an identity. Adapters do wire calls and shape
//! normalization only — rate limiting, retries, and failure isolation are
//! the orchestrator's rate gate and circuit breaker wrapping them.
//!
//! The concrete integrations run as sidecar services speaking one protocol:
//! `POST {base}/search` with `{"query", "limit"}` returning a JSON array of
//! hits, and `GET {base}/health` for readiness. [`HttpSourceAdapter`] is the
//! single client for all of them; which systems exist is purely registry
//! configuration.
//!
//! Credentials are opaque to the core: [`CredentialsBlob`] hands each adapter
//! the raw key/value strings from user settings, and only the adapter
//! interprets them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use crate::config::Config;
use crate::error::FetchError;
use crate::models::{Document, Settings, SourceId};

/// Opaque per-source credential material, parsed only by the owning adapter.
#[derive(Debug, Clone, Default)]
pub struct CredentialsBlob(HashMap<String, String>);

impl CredentialsBlob {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self(values)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Uniform capability set every integration satisfies.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> SourceId;

    /// Return at most `limit` documents relevant to `query`, finishing
    /// within `timeout`. Classification of failures follows [`FetchError`].
    async fn search(
        &self,
        query: &str,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<Document>, FetchError>;

    /// Cheap readiness probe; used to avoid selecting dead sources.
    async fn healthy(&self) -> bool;
}

/// One JSON hit in the sidecar search protocol.
#[derive(Debug, Deserialize)]
struct SearchHit {
    id: String,
    title: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, alias = "body")]
    content: String,
    #[serde(default)]
    score: Option<f32>,
}

/// HTTP client for one sidecar search service.
pub struct HttpSourceAdapter {
    id: SourceId,
    base_url: String,
    client: reqwest::Client,
    credentials: CredentialsBlob,
}

impl HttpSourceAdapter {
    pub fn new(id: SourceId, base_url: String, credentials: CredentialsBlob) -> Self {
        Self {
            id,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            credentials,
        }
    }

    /// The sidecar receives the user's credential blob verbatim in the
    /// request body; the core never interprets the keys.
    fn credential_payload(&self) -> serde_json::Value {
        serde_json::to_value(&self.credentials.0).unwrap_or_default()
    }
}

#[async_trait]
impl SourceAdapter for HttpSourceAdapter {
    fn id(&self) -> SourceId {
        self.id
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<Document>, FetchError> {
        let url = format!("{}/search", self.base_url);
        let body = serde_json::json!({
            "query": query,
            "limit": limit,
            "credentials": self.credential_payload(),
        });

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::RateLimited { retry_after });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(FetchError::Permanent(format!("auth rejected: {}", status)));
        }
        if status.is_client_error() {
            return Err(FetchError::Permanent(format!("client error: {}", status)));
        }
        if !status.is_success() {
            return Err(FetchError::Upstream(format!("http {}", status)));
        }

        let hits: Vec<SearchHit> = response
            .json()
            .await
            .map_err(|e| FetchError::Upstream(format!("malformed response: {}", e)))?;

        let fetched_at = Utc::now();
        let documents = hits
            .into_iter()
            .take(limit)
            .map(|hit| Document {
                id: hit.id,
                source: self.id,
                title: hit.title,
                url: hit.url,
                body: hit.content,
                fetched_at,
                score: hit.score,
            })
            .collect();
        Ok(documents)
    }

    async fn healthy(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(source = %self.id, error = %e, "health probe failed");
                false
            }
        }
    }
}

/// All adapters for one process, keyed by [`SourceId`]. Built once at
/// startup; lookups on the query path are map hits, not string matches.
pub struct SourceRegistry {
    adapters: HashMap<SourceId, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Build HTTP adapters for every source with a configured endpoint,
    /// slicing the settings credential map per source by key prefix
    /// (`jira_*` goes to jira, `slack_*` to slack, …). Atlassian keys
    /// (`atlassian_*`) feed both jira and confluence.
    pub fn from_config(config: &Config, settings: &Settings) -> Self {
        let mut registry = Self::empty();
        for id in SourceId::ALL {
            if id == SourceId::VectorCache {
                continue;
            }
            let Some(source_config) = config.sources.get(id.as_str()) else {
                continue;
            };
            let creds: HashMap<String, String> = settings
                .credentials
                .iter()
                .filter(|(key, _)| {
                    key.starts_with(id.as_str())
                        || (key.starts_with("atlassian")
                            && matches!(id, SourceId::Jira | SourceId::Confluence))
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            registry.register(Arc::new(HttpSourceAdapter::new(
                id,
                source_config.url.clone(),
                CredentialsBlob::new(creds),
            )));
        }
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.id(), adapter);
    }

    pub fn get(&self, id: SourceId) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self.adapters.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LlmProviderId;
    use std::collections::BTreeSet;

    fn settings(credentials: &[(&str, &str)]) -> Settings {
        Settings {
            llm_provider: LlmProviderId::Openai,
            llm_model: "gpt-4o-mini".to_string(),
            llm_api_key: "k".to_string(),
            credentials: credentials
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            enable_web_search: true,
            use_streaming: true,
            enabled_sources: BTreeSet::new(),
        }
    }

    #[test]
    fn test_registry_built_from_configured_sources() {
        let toml = r#"
            [sources.jira]
            url = "http://localhost:8016"

            [sources.slack]
            url = "http://localhost:8010/"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let registry = SourceRegistry::from_config(&config, &settings(&[]));
        assert_eq!(registry.len(), 2);
        assert!(registry.get(SourceId::Jira).is_some());
        assert!(registry.get(SourceId::Slack).is_some());
        assert!(registry.get(SourceId::Github).is_none());
    }

    #[test]
    fn test_credentials_sliced_by_prefix() {
        let toml = r#"
            [sources.jira]
            url = "http://localhost:8016"

            [sources.confluence]
            url = "http://localhost:8015"

            [sources.slack]
            url = "http://localhost:8010"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let settings = settings(&[
            ("slack_bot_token", "xoxb-1"),
            ("atlassian_api_token", "at-1"),
            ("jira_url", "https://acme.atlassian.net"),
        ]);
        let registry = SourceRegistry::from_config(&config, &settings);

        // The blob is opaque; we only check slicing via the concrete type.
        let jira = registry.get(SourceId::Jira).unwrap();
        assert_eq!(jira.id(), SourceId::Jira);
        let confluence = registry.get(SourceId::Confluence).unwrap();
        assert_eq!(confluence.id(), SourceId::Confluence);
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let adapter = HttpSourceAdapter::new(
            SourceId::Slack,
            "http://localhost:8010/".to_string(),
            CredentialsBlob::default(),
        );
        assert_eq!(adapter.base_url, "http://localhost:8010");
    }

    #[test]
    fn test_vector_cache_never_registered() {
        let toml = r#"
            [sources.web]
            url = "http://localhost:8030"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let registry = SourceRegistry::from_config(&config, &settings(&[]));
        assert!(registry.get(SourceId::VectorCache).is_none());
    }
}
