use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::debug;

use shared::domain::{FieldConfidence, FieldStats};

pub const DEFAULT_CACHE_CAPACITY: u64 = 512;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type FieldKey = (String, String);

/// Persistent layout memory: per-label field positions, learned regexes and
/// whole-document results.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    stats_cache: Cache<FieldKey, Option<FieldStats>>,
    regex_cache: Cache<FieldKey, Option<String>>,
    /// Serialises `update_field` so concurrent learners never race on the
    /// SQLite write lock.
    writer: Arc<Mutex<()>>,
    /// Bumped after every committed update; cache fills that straddle a
    /// commit are discarded.
    generation: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
pub struct StoredFieldStats {
    pub field: String,
    pub stats: FieldStats,
    pub regex: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CachedDocument {
    pub fingerprint: String,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_cache_capacity(database_url, DEFAULT_CACHE_CAPACITY).await
    }

    pub async fn with_cache_capacity(database_url: &str, cache_capacity: u64) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        // Every connection to `sqlite::memory:` opens its own empty database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            stats_cache: Cache::new(cache_capacity),
            regex_cache: Cache::new(cache_capacity),
            writer: Arc::new(Mutex::new(())),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn field_stats(&self, label: &str, field: &str) -> Result<Option<FieldStats>> {
        let key = (label.to_string(), field.to_string());
        if let Some(hit) = self.stats_cache.get(&key) {
            return Ok(hit);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let row = sqlx::query(
            "SELECT n, mean_px, mean_py, m2_px, m2_py FROM field_stats WHERE label = ? AND field = ?",
        )
        .bind(label)
        .bind(field)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load stats for {label}/{field}"))?;
        let stats = row.map(|r| stats_from_row(&r));
        self.fill(&self.stats_cache, key, stats, generation);
        Ok(stats)
    }

    pub async fn field_regex(&self, label: &str, field: &str) -> Result<Option<String>> {
        let key = (label.to_string(), field.to_string());
        if let Some(hit) = self.regex_cache.get(&key) {
            return Ok(hit);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let regex: Option<String> =
            sqlx::query_scalar("SELECT regex FROM regex_cache WHERE label = ? AND field = ?")
                .bind(label)
                .bind(field)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("failed to load regex for {label}/{field}"))?;
        self.fill(&self.regex_cache, key, regex.clone(), generation);
        Ok(regex)
    }

    /// Caches a value read at `generation`, dropping it again if an update
    /// committed in the meantime.
    fn fill<V>(&self, cache: &Cache<FieldKey, V>, key: FieldKey, value: V, generation: u64)
    where
        V: Clone + Send + Sync + 'static,
    {
        cache.insert(key.clone(), value);
        if self.generation.load(Ordering::SeqCst) != generation {
            cache.invalidate(&key);
        }
    }

    pub async fn field_confidence(
        &self,
        label: &str,
        field: &str,
        z: f64,
    ) -> Result<Option<FieldConfidence>> {
        Ok(self
            .field_stats(label, field)
            .await?
            .and_then(|stats| stats.confidence(z)))
    }

    /// Folds one observed position into the field's statistics and, when
    /// given, replaces its learned regex.
    pub async fn update_field(
        &self,
        label: &str,
        field: &str,
        px: f64,
        py: f64,
        regex: Option<&str>,
    ) -> Result<FieldStats> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query(
            "SELECT n, mean_px, mean_py, m2_px, m2_py FROM field_stats WHERE label = ? AND field = ?",
        )
        .bind(label)
        .bind(field)
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| stats_from_row(&r))
        .unwrap_or_default();
        let updated = current.observe(px, py);

        sqlx::query(
            "INSERT INTO field_stats (label, field, n, mean_px, mean_py, m2_px, m2_py)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(label, field) DO UPDATE SET
                n = excluded.n,
                mean_px = excluded.mean_px,
                mean_py = excluded.mean_py,
                m2_px = excluded.m2_px,
                m2_py = excluded.m2_py",
        )
        .bind(label)
        .bind(field)
        .bind(updated.n)
        .bind(updated.mean_px)
        .bind(updated.mean_py)
        .bind(updated.m2_px)
        .bind(updated.m2_py)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to upsert stats for {label}/{field}"))?;

        if let Some(regex) = regex.filter(|r| !r.is_empty()) {
            sqlx::query(
                "INSERT INTO regex_cache (label, field, regex) VALUES (?, ?, ?)
                 ON CONFLICT(label, field) DO UPDATE SET regex = excluded.regex",
            )
            .bind(label)
            .bind(field)
            .bind(regex)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to upsert regex for {label}/{field}"))?;
        }

        tx.commit().await?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.stats_cache.invalidate_all();
        self.regex_cache.invalidate_all();
        debug!(label, field, n = updated.n, "layout memory: field updated");
        Ok(updated)
    }

    pub async fn list_field_stats(&self, label: &str) -> Result<Vec<StoredFieldStats>> {
        let rows = sqlx::query(
            "SELECT s.field, s.n, s.mean_px, s.mean_py, s.m2_px, s.m2_py, r.regex
             FROM field_stats s
             LEFT JOIN regex_cache r ON r.label = s.label AND r.field = s.field
             WHERE s.label = ?
             ORDER BY s.field",
        )
        .bind(label)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoredFieldStats {
                field: row.get("field"),
                stats: stats_from_row(&row),
                regex: row.get("regex"),
            })
            .collect())
    }

    pub async fn cached_result(&self, doc_text: &str, schema: &str) -> Result<Option<Map<String, Value>>> {
        let fp = fingerprint(doc_text, schema);
        let raw: Option<String> =
            sqlx::query_scalar("SELECT result_json FROM doc_cache WHERE fingerprint = ?")
                .bind(&fp)
                .fetch_optional(&self.pool)
                .await?;
        raw.map(|raw| {
            serde_json::from_str::<Map<String, Value>>(&raw)
                .with_context(|| format!("corrupt cached result for fingerprint {fp}"))
        })
        .transpose()
    }

    pub async fn store_cached_result(
        &self,
        doc_text: &str,
        schema: &str,
        result: &Map<String, Value>,
        label: Option<&str>,
    ) -> Result<()> {
        let fp = fingerprint(doc_text, schema);
        sqlx::query(
            "INSERT INTO doc_cache (fingerprint, label, result_json) VALUES (?, ?, ?)
             ON CONFLICT(fingerprint) DO UPDATE SET result_json = excluded.result_json",
        )
        .bind(&fp)
        .bind(label)
        .bind(serde_json::to_string(result)?)
        .execute(&self.pool)
        .await
        .context("failed to store cached result")?;
        Ok(())
    }

    pub async fn list_cached_documents(&self, label: Option<&str>) -> Result<Vec<CachedDocument>> {
        let rows = sqlx::query(
            "SELECT fingerprint, label, created_at FROM doc_cache
             WHERE ?1 IS NULL OR label = ?1
             ORDER BY created_at DESC",
        )
        .bind(label)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(CachedDocument {
                    fingerprint: row.try_get("fingerprint")?,
                    label: row.try_get("label")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Deletes cached results, all of them or only those stored under `label`.
    pub async fn purge_doc_cache(&self, label: Option<&str>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM doc_cache WHERE ?1 IS NULL OR label = ?1")
            .bind(label)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// SHA-256 over the schema followed by the whitespace-normalised text.
pub fn fingerprint(doc_text: &str, schema: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(schema.as_bytes());
    hasher.update(doc_text.split_whitespace().collect::<Vec<_>>().join(" ").as_bytes());
    format!("{:x}", hasher.finalize())
}

fn stats_from_row(row: &sqlx::sqlite::SqliteRow) -> FieldStats {
    FieldStats {
        n: row.get("n"),
        mean_px: row.get("mean_px"),
        mean_py: row.get("mean_py"),
        m2_px: row.get("m2_px"),
        m2_py: row.get("m2_py"),
    }
}

/// Creates the directory holding a file-backed SQLite database.
pub fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
