//! Query routing: pure keyword-rule source selection.
//!
//! Given the query text and the set of enabled, callable sources, produce an
//! ordered [`SelectionResult`]:
//!
//! 1. Case-insensitive keyword rules map trigger phrases to sources; all
//!    matching rules are unioned in rule-table order.
//! 2. If no rule fires, fall back to the default bundle
//!    `{vector_cache, web}`.
//! 3. Sources outside `enabled_sources`, and sources whose circuit is open,
//!    are dropped. `web` additionally requires the web-search toggle.
//! 4. `vector_cache` is prepended whenever the cache is nonempty — the
//!    lookup is free.
//! 5. The list is truncated to `max_sources`, preserving rule-match order.
//!
//! The router does no I/O, so the whole rule table is exercised in unit
//! tests. Rules are compiled once at startup and held by [`Router`].

use std::collections::BTreeSet;

use regex::RegexBuilder;

use crate::models::{QueryOptions, SelectionResult, SourceId};

/// Confidence reported for an exact ticket-key match.
const TICKET_CONFIDENCE: f32 = 0.95;
/// Confidence reported for keyword-rule selections.
const RULE_CONFIDENCE: f32 = 0.9;
/// Confidence reported for the fallback bundle.
const FALLBACK_CONFIDENCE: f32 = 0.5;

/// One compiled routing rule. Rule order in [`Router::new`] is the order
/// matched sources appear downstream.
struct Rule {
    source: SourceId,
    pattern: regex::Regex,
}

pub struct Router {
    /// Exact issue keys (`CTT-21761`). A hit routes to jira exclusively —
    /// the query names one artifact, nothing else can answer it.
    ticket_key: regex::Regex,
    rules: Vec<Rule>,
}

impl Router {
    pub fn new() -> Self {
        // Trigger vocabularies per source.
        let table: &[(SourceId, &str)] = &[
            (
                SourceId::Jira,
                r"\b(issue|ticket|bug|task|story|epic|jira|sprint|backlog|feature)\b",
            ),
            (
                SourceId::Confluence,
                r"\b(document(ation)?|wiki|page|confluence|article|guide|tutorial|how-to|procedure|runbook)\b",
            ),
            (
                SourceId::Slack,
                r"\b(slack|message|chat|channel|thread|dm)\b|#\S+",
            ),
            (
                SourceId::Github,
                r"\b(github|code|repo(sitory)?|commit|pr|pull request|branch|merge)\b",
            ),
            (
                SourceId::Google,
                r"\b(drive|doc|sheet|gmail|email|calendar|meeting)\b",
            ),
            (SourceId::Notion, r"\b(notion|note|database)\b"),
            (SourceId::Linear, r"\b(linear|cycle|roadmap)\b"),
            (
                SourceId::Figma,
                r"\b(figma|design|prototype|component|frame|ui|ux|mockup)\b",
            ),
            (
                SourceId::Microsoft365,
                r"\b(teams|sharepoint|outlook|onedrive|office|microsoft)\b",
            ),
            (
                SourceId::Devtools,
                r"\b(stackoverflow|npm|pypi|package|library|mdn|error|exception)\b",
            ),
            (
                SourceId::Productivity,
                r"\b(file|local|bookmark|notes|clipboard)\b",
            ),
            (
                SourceId::Web,
                r"\b(latest|news|current|today|recent|what is|who is)\b",
            ),
        ];

        let rules = table
            .iter()
            .map(|(source, pattern)| Rule {
                source: *source,
                pattern: RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .expect("routing rule pattern"),
            })
            .collect();

        Self {
            ticket_key: regex::Regex::new(r"\b[A-Z]{2,10}-\d+\b").expect("ticket key pattern"),
            rules,
        }
    }

    /// Select sources for a query.
    ///
    /// `open_circuits` is the set of sources currently rejected by the
    /// breaker; `cache_populated` says whether the vector cache holds any
    /// entries; `web_enabled` is the user's web-search toggle.
    pub fn select(
        &self,
        query_text: &str,
        options: &QueryOptions,
        open_circuits: &BTreeSet<SourceId>,
        cache_populated: bool,
        web_enabled: bool,
    ) -> SelectionResult {
        let (mut sources, confidence) = if self.ticket_key.is_match(query_text) {
            (vec![SourceId::Jira], TICKET_CONFIDENCE)
        } else {
            let mut matched: Vec<SourceId> = Vec::new();
            for rule in &self.rules {
                if matched.contains(&rule.source) {
                    continue;
                }
                if rule.pattern.is_match(query_text) {
                    matched.push(rule.source);
                }
            }
            if matched.is_empty() {
                (vec![SourceId::VectorCache, SourceId::Web], FALLBACK_CONFIDENCE)
            } else {
                (matched, RULE_CONFIDENCE)
            }
        };

        sources.retain(|s| {
            if *s == SourceId::VectorCache {
                return cache_populated;
            }
            if *s == SourceId::Web && !web_enabled {
                return false;
            }
            options.enabled_sources.contains(s) && !open_circuits.contains(s)
        });

        if cache_populated && !sources.contains(&SourceId::VectorCache) {
            sources.insert(0, SourceId::VectorCache);
        }

        sources.truncate(options.max_sources);

        SelectionResult {
            sources,
            confidence,
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
