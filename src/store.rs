//! Keyed persistence: user settings and session transcripts.
//!
//! Two logical stores backed by one SQLite database (WAL mode):
//!
//! - `settings[user_id] → Settings` — upserted whole, stored as JSON. The
//!   core never inspects credential values inside the blob.
//! - `transcripts[session_id] → ordered Turn list` — appended on successful
//!   query completion only.
//!
//! Writes are idempotent upserts; the schema is created on open so the
//! binary's `init` command and a cold `serve` both work from an empty disk.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{Settings, SourceId, Turn};

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the store at `url` — a SQLite path or `sqlite:` URL.
    pub async fn open(url: &str) -> Result<Self> {
        let path = url.strip_prefix("sqlite:").unwrap_or(url);
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create store dir: {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open store at {}", url))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_settings (
                user_id    TEXT PRIMARY KEY,
                settings   TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transcripts (
                id           TEXT PRIMARY KEY,
                session_id   TEXT NOT NULL,
                user_message TEXT NOT NULL,
                bot_response TEXT NOT NULL,
                sources      TEXT NOT NULL,
                used_sources TEXT NOT NULL,
                timestamp    TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transcripts_session
             ON transcripts (session_id, timestamp)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    // ============ settings ============

    pub async fn save_settings(&self, user_id: &str, settings: &Settings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        sqlx::query(
            r#"
            INSERT INTO user_settings (user_id, settings, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                settings = excluded.settings,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_settings(&self, user_id: &str) -> Result<Option<Settings>> {
        let row = sqlx::query("SELECT settings FROM user_settings WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let json: String = row.get("settings");
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    // ============ transcripts ============

    pub async fn append_turn(&self, session_id: &str, turn: &Turn) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transcripts
                (id, session_id, user_message, bot_response, sources, used_sources, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(&turn.user_message)
        .bind(&turn.bot_response)
        .bind(serde_json::to_string(&turn.sources)?)
        .bind(serde_json::to_string(&turn.used_sources)?)
        .bind(turn.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Full session history, oldest first.
    pub async fn history(&self, session_id: &str) -> Result<Vec<Turn>> {
        let rows = sqlx::query(
            "SELECT user_message, bot_response, sources, used_sources, timestamp
             FROM transcripts WHERE session_id = ? ORDER BY timestamp ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_turn).collect()
    }

    /// The most recent `limit` turns, returned oldest first for prompting.
    pub async fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>> {
        let rows = sqlx::query(
            "SELECT user_message, bot_response, sources, used_sources, timestamp
             FROM transcripts WHERE session_id = ?
             ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut turns: Vec<Turn> = rows
            .into_iter()
            .map(row_to_turn)
            .collect::<Result<Vec<_>>>()?;
        turns.reverse();
        Ok(turns)
    }

    pub async fn clear_history(&self, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM transcripts WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Liveness check for /health and test-connection.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_turn(row: sqlx::sqlite::SqliteRow) -> Result<Turn> {
    let sources_json: String = row.get("sources");
    let used_sources_json: String = row.get("used_sources");
    let sources: Vec<SourceId> = serde_json::from_str(&sources_json)?;
    let used_sources: Vec<SourceId> = serde_json::from_str(&used_sources_json)?;
    let timestamp: String = row.get("timestamp");
    Ok(Turn {
        user_message: row.get("user_message"),
        bot_response: row.get("bot_response"),
        sources,
        used_sources,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LlmProviderId;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> Store {
        let path = dir.path().join("store.sqlite");
        Store::open(path.to_str().unwrap()).await.unwrap()
    }

    fn settings() -> Settings {
        Settings {
            llm_provider: LlmProviderId::Anthropic,
            llm_model: "claude-sonnet".to_string(),
            llm_api_key: "key".to_string(),
            credentials: [("jira_token".to_string(), "t".to_string())].into(),
            enable_web_search: true,
            use_streaming: true,
            enabled_sources: BTreeSet::from([SourceId::Jira, SourceId::VectorCache]),
        }
    }

    fn turn(message: &str, at_offset_secs: i64) -> Turn {
        Turn {
            user_message: message.to_string(),
            bot_response: format!("answer to {}", message),
            sources: vec![SourceId::Jira],
            used_sources: vec![SourceId::Jira],
            timestamp: Utc::now() + chrono::Duration::seconds(at_offset_secs),
        }
    }

    #[tokio::test]
    async fn test_settings_roundtrip_and_upsert() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        assert!(store.load_settings("u1").await.unwrap().is_none());
        store.save_settings("u1", &settings()).await.unwrap();

        let loaded = store.load_settings("u1").await.unwrap().unwrap();
        assert_eq!(loaded.llm_model, "claude-sonnet");
        assert_eq!(loaded.credentials["jira_token"], "t");

        let mut updated = settings();
        updated.llm_model = "claude-opus".to_string();
        store.save_settings("u1", &updated).await.unwrap();
        let loaded = store.load_settings("u1").await.unwrap().unwrap();
        assert_eq!(loaded.llm_model, "claude-opus");
    }

    #[tokio::test]
    async fn test_history_ordered_and_scoped() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.append_turn("s1", &turn("first", 0)).await.unwrap();
        store.append_turn("s1", &turn("second", 1)).await.unwrap();
        store.append_turn("s2", &turn("other", 2)).await.unwrap();

        let history = store.history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].user_message, "first");
        assert_eq!(history[1].user_message, "second");
    }

    #[tokio::test]
    async fn test_recent_turns_window() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        for i in 0..10 {
            store
                .append_turn("s1", &turn(&format!("m{}", i), i))
                .await
                .unwrap();
        }
        let recent = store.recent_turns("s1", 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].user_message, "m7");
        assert_eq!(recent[2].user_message, "m9");
    }

    #[tokio::test]
    async fn test_clear_history() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.append_turn("s1", &turn("a", 0)).await.unwrap();
        store.append_turn("s2", &turn("b", 0)).await.unwrap();

        let deleted = store.clear_history("s1").await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.history("s1").await.unwrap().is_empty());
        assert_eq!(store.history("s2").await.unwrap().len(), 1);
    }
}
