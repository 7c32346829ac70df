//! Persistent semantic cache over chunks.
//!
//! Maps `(source, doc_id, ordinal)` to a chunk, its embedding, and usage
//! metadata. Backed by SQLite in WAL mode for crash safety — a batch insert
//! is one transaction, so a torn write can never corrupt the index — with an
//! in-memory mirror for similarity scans on the request path.
//!
//! - [`VectorCache::query`] — k-nearest by cosine over L2-normalized vectors
//!   (so similarity is a dot product), filtered by a minimum-score floor.
//!   Hits bump `last_hit_at` and `hit_count`.
//! - [`VectorCache::insert`] — idempotent upsert; re-inserting an existing
//!   key refreshes `last_hit_at` and bumps a version counter instead of
//!   duplicating.
//! - [`VectorCache::evict`] — LRU by `last_hit_at`, run automatically when
//!   the entry count passes the configured capacity.
//!
//! Entries survive restart; the mirror is rebuilt from disk at startup.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::embedder;
use crate::models::{CacheEntry, Chunk, SourceId};

type Key = (SourceId, String, u32);

pub struct VectorCache {
    pool: SqlitePool,
    capacity: usize,
    min_score: f32,
    entries: Mutex<HashMap<Key, CacheEntry>>,
}

impl VectorCache {
    /// Open (or create) the cache database under `dir` and load the mirror.
    pub async fn open(config: &CacheConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)
            .with_context(|| format!("Failed to create vector dir: {}", config.dir.display()))?;
        let db_path = config.dir.join("cache.sqlite");
        let pool = connect(&db_path).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                source      TEXT    NOT NULL,
                doc_id      TEXT    NOT NULL,
                ordinal     INTEGER NOT NULL,
                chunk_id    TEXT    NOT NULL,
                title       TEXT    NOT NULL,
                url         TEXT,
                text        TEXT    NOT NULL,
                token_count INTEGER NOT NULL,
                embedding   BLOB    NOT NULL,
                inserted_at TEXT    NOT NULL,
                last_hit_at TEXT    NOT NULL,
                hit_count   INTEGER NOT NULL DEFAULT 0,
                version     INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (source, doc_id, ordinal)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let cache = Self {
            pool,
            capacity: config.capacity,
            min_score: config.min_score,
            entries: Mutex::new(HashMap::new()),
        };
        cache.load_mirror().await?;
        Ok(cache)
    }

    async fn load_mirror(&self) -> Result<()> {
        let rows = sqlx::query("SELECT * FROM cache_entries")
            .fetch_all(&self.pool)
            .await?;

        let mut entries = self.entries.lock().unwrap();
        for row in rows {
            let source_str: String = row.get("source");
            let Some(source) = SourceId::parse(&source_str) else {
                continue;
            };
            let doc_id: String = row.get("doc_id");
            let ordinal: i64 = row.get("ordinal");
            let entry = CacheEntry {
                chunk: Chunk {
                    id: row.get("chunk_id"),
                    doc_id: doc_id.clone(),
                    source,
                    title: row.get("title"),
                    url: row.get("url"),
                    text: row.get("text"),
                    token_count: row.get::<i64, _>("token_count") as usize,
                    ordinal: ordinal as u32,
                },
                embedding: blob_to_vec(&row.get::<Vec<u8>, _>("embedding")),
                inserted_at: parse_ts(row.get("inserted_at")),
                last_hit_at: parse_ts(row.get("last_hit_at")),
                hit_count: row.get::<i64, _>("hit_count") as u64,
            };
            entries.insert((source, doc_id, ordinal as u32), entry);
        }
        info!(entries = entries.len(), "vector cache loaded");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate hit count across all entries, for the stats listing.
    pub fn total_hits(&self) -> u64 {
        self.entries.lock().unwrap().values().map(|e| e.hit_count).sum()
    }

    /// k-nearest entries by cosine similarity, at or above the score floor
    /// (`min_score` falls back to the configured default). Hits update usage
    /// metadata in the mirror and on disk.
    pub async fn query(
        &self,
        vector: &[f32],
        k: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<(f32, CacheEntry)>> {
        let floor = min_score.unwrap_or(self.min_score);
        let now = Utc::now();

        let hits: Vec<(f32, CacheEntry)> = {
            let mut entries = self.entries.lock().unwrap();
            let mut scored: Vec<(f32, Key)> = entries
                .iter()
                .filter_map(|(key, e)| {
                    let score = embedder::cosine(vector, &e.embedding);
                    (score >= floor).then(|| (score, key.clone()))
                })
                .collect();
            scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(k);

            scored
                .into_iter()
                .map(|(score, key)| {
                    let e = entries.get_mut(&key).expect("scored key present");
                    e.last_hit_at = now;
                    e.hit_count += 1;
                    (score, e.clone())
                })
                .collect()
        };

        for (_, e) in &hits {
            sqlx::query(
                "UPDATE cache_entries SET last_hit_at = ?, hit_count = hit_count + 1
                 WHERE source = ? AND doc_id = ? AND ordinal = ?",
            )
            .bind(now.to_rfc3339())
            .bind(e.chunk.source.as_str())
            .bind(&e.chunk.doc_id)
            .bind(e.chunk.ordinal as i64)
            .execute(&self.pool)
            .await?;
        }

        Ok(hits)
    }

    /// Insert chunks with their embeddings, one transaction per batch.
    ///
    /// Idempotent on `(source, doc_id, ordinal)`: an existing key gets its
    /// payload refreshed and `version` bumped, never a duplicate row. Runs
    /// LRU eviction afterwards if the capacity is exceeded.
    pub async fn insert(&self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<()> {
        anyhow::ensure!(
            chunks.len() == embeddings.len(),
            "chunk/embedding length mismatch: {} vs {}",
            chunks.len(),
            embeddings.len()
        );
        if chunks.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
            sqlx::query(
                r#"
                INSERT INTO cache_entries
                    (source, doc_id, ordinal, chunk_id, title, url, text,
                     token_count, embedding, inserted_at, last_hit_at, hit_count, version)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 1)
                ON CONFLICT (source, doc_id, ordinal) DO UPDATE SET
                    chunk_id = excluded.chunk_id,
                    title = excluded.title,
                    url = excluded.url,
                    text = excluded.text,
                    token_count = excluded.token_count,
                    embedding = excluded.embedding,
                    last_hit_at = excluded.last_hit_at,
                    version = version + 1
                "#,
            )
            .bind(chunk.source.as_str())
            .bind(&chunk.doc_id)
            .bind(chunk.ordinal as i64)
            .bind(&chunk.id)
            .bind(&chunk.title)
            .bind(&chunk.url)
            .bind(&chunk.text)
            .bind(chunk.token_count as i64)
            .bind(vec_to_blob(embedding))
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        {
            let mut entries = self.entries.lock().unwrap();
            for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
                let key = (chunk.source, chunk.doc_id.clone(), chunk.ordinal);
                match entries.get_mut(&key) {
                    Some(existing) => {
                        existing.chunk = chunk.clone();
                        existing.embedding = embedding.clone();
                        existing.last_hit_at = now;
                    }
                    None => {
                        entries.insert(
                            key,
                            CacheEntry {
                                chunk: chunk.clone(),
                                embedding: embedding.clone(),
                                inserted_at: now,
                                last_hit_at: now,
                                hit_count: 0,
                            },
                        );
                    }
                }
            }
        }
        debug!(inserted = chunks.len(), total = self.len(), "cache insert");

        if self.len() > self.capacity {
            self.evict(self.capacity).await?;
        }
        Ok(())
    }

    /// Evict least-recently-hit entries until at most `target` remain.
    pub async fn evict(&self, target: usize) -> Result<()> {
        let victims: Vec<Key> = {
            let entries = self.entries.lock().unwrap();
            if entries.len() <= target {
                return Ok(());
            }
            let mut by_age: Vec<(DateTime<Utc>, Key)> = entries
                .iter()
                .map(|(k, e)| (e.last_hit_at, k.clone()))
                .collect();
            by_age.sort_by(|a, b| a.0.cmp(&b.0));
            by_age
                .into_iter()
                .take(entries.len() - target)
                .map(|(_, k)| k)
                .collect()
        };

        let mut tx = self.pool.begin().await?;
        for (source, doc_id, ordinal) in &victims {
            sqlx::query(
                "DELETE FROM cache_entries WHERE source = ? AND doc_id = ? AND ordinal = ?",
            )
            .bind(source.as_str())
            .bind(doc_id)
            .bind(*ordinal as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let mut entries = self.entries.lock().unwrap();
        for key in &victims {
            entries.remove(key);
        }
        info!(evicted = victims.len(), remaining = entries.len(), "cache eviction");
        Ok(())
    }

    /// Flush and close the underlying pool. Called at teardown.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn connect(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use tempfile::TempDir;

    fn chunk(doc_id: &str, ordinal: u32, text: &str) -> Chunk {
        Chunk {
            id: format!("{}#{}", doc_id, ordinal),
            doc_id: doc_id.to_string(),
            source: SourceId::Confluence,
            title: format!("{} title", doc_id),
            url: None,
            text: text.to_string(),
            token_count: crate::chunker::count_tokens(text),
            ordinal,
        }
    }

    fn unit(dim: usize, at: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[at] = 1.0;
        v
    }

    async fn open_cache(dir: &TempDir, capacity: usize) -> VectorCache {
        let config = CacheConfig {
            dir: dir.path().to_path_buf(),
            capacity,
            min_score: 0.35,
            top_k: 3,
        };
        VectorCache::open(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_query() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 100).await;

        let chunks = vec![chunk("d1", 0, "deployment process"), chunk("d2", 0, "other")];
        let embeddings = vec![unit(8, 0), unit(8, 1)];
        cache.insert(&chunks, &embeddings).await.unwrap();

        let hits = cache.query(&unit(8, 0), 5, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1.chunk.doc_id, "d1");
        assert!((hits[0].0 - 1.0).abs() < 1e-6);
        assert_eq!(hits[0].1.hit_count, 1);
    }

    #[tokio::test]
    async fn test_min_score_floor() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 100).await;
        cache
            .insert(&[chunk("d1", 0, "x")], &[unit(8, 1)])
            .await
            .unwrap();

        // Orthogonal query scores 0.0, below any positive floor.
        let hits = cache.query(&unit(8, 0), 5, Some(0.35)).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_insert_idempotent() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 100).await;

        let chunks = vec![chunk("d1", 0, "same"), chunk("d1", 1, "again")];
        let embeddings = vec![unit(8, 0), unit(8, 1)];
        cache.insert(&chunks, &embeddings).await.unwrap();
        cache.insert(&chunks, &embeddings).await.unwrap();
        assert_eq!(cache.len(), 2);

        // Scores are unchanged by re-insertion.
        let hits = cache.query(&unit(8, 0), 5, Some(0.5)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].0 - 1.0).abs() < 1e-6);

        let version: i64 =
            sqlx::query("SELECT version FROM cache_entries WHERE doc_id = 'd1' AND ordinal = 0")
                .fetch_one(&cache.pool)
                .await
                .unwrap()
                .get("version");
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_eviction_is_lru() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 100).await;

        for i in 0..4 {
            cache
                .insert(&[chunk(&format!("d{}", i), 0, "t")], &[unit(8, i)])
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        // Touch d0 so it becomes the most recently hit.
        cache.query(&unit(8, 0), 1, Some(0.5)).await.unwrap();

        cache.evict(2).await.unwrap();
        assert_eq!(cache.len(), 2);

        let entries = cache.entries.lock().unwrap();
        let survivors: Vec<String> =
            entries.keys().map(|(_, doc, _)| doc.clone()).collect();
        assert!(survivors.contains(&"d0".to_string()));
        assert!(survivors.contains(&"d3".to_string()));

        // Every survivor was hit no earlier than any evicted entry would
        // have been; d1/d2 (oldest last_hit_at) are gone.
        assert!(!survivors.contains(&"d1".to_string()));
    }

    #[tokio::test]
    async fn test_capacity_triggers_eviction() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 3).await;

        for i in 0..5 {
            cache
                .insert(&[chunk(&format!("d{}", i), 0, "t")], &[unit(8, i)])
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(cache.len() <= 3);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = open_cache(&dir, 100).await;
            cache
                .insert(&[chunk("d1", 0, "persisted body")], &[unit(8, 2)])
                .await
                .unwrap();
            cache.close().await;
        }

        let reopened = open_cache(&dir, 100).await;
        assert_eq!(reopened.len(), 1);
        let hits = reopened.query(&unit(8, 2), 1, Some(0.5)).await.unwrap();
        assert_eq!(hits[0].1.chunk.text, "persisted body");
    }

    #[tokio::test]
    async fn test_mismatched_batch_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir, 100).await;
        let err = cache.insert(&[chunk("d", 0, "x")], &[]).await;
        assert!(err.is_err());
    }
}
