//! Persistent fingerprint -> batch-id mapping, backed by an embedded SQLite
//! file. Schema matches the `request_cache` table shipped in `migrations/`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::Result;

pub const CACHE_PATH_ENV_VAR: &str = "BATCHLING_CACHE_PATH";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CacheEntry {
    pub request_hash: String,
    pub provider: String,
    pub endpoint: String,
    pub model: String,
    pub host: String,
    pub batch_id: String,
    pub custom_id: String,
    pub created_at: f64,
}

/// Resolve the cache database path: explicit override, then
/// `BATCHLING_CACHE_PATH`, then the platform user-cache directory.
pub fn resolve_cache_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Ok(env_path) = std::env::var(CACHE_PATH_ENV_VAR) {
        return PathBuf::from(env_path);
    }
    directories::ProjectDirs::from("", "", "batchling")
        .map(|dirs| dirs.cache_dir().join("cache.sqlite3"))
        .unwrap_or_else(|| PathBuf::from("batchling-cache.sqlite3"))
}

pub struct RequestCacheStore {
    pool: SqlitePool,
}

impl RequestCacheStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::error::BatchlingError::Cache(sqlx::Error::Io(e))
            })?;
        }
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            crate::error::BatchlingError::Cache(sqlx::Error::Migrate(Box::new(e)))
        })?;
        Ok(Self { pool })
    }

    pub async fn get_by_hash(&self, request_hash: &str) -> Result<Option<CacheEntry>> {
        let entry = sqlx::query_as::<_, CacheEntry>(
            "SELECT request_hash, provider, endpoint, model, host, batch_id, custom_id, created_at \
             FROM request_cache WHERE request_hash = ?",
        )
        .bind(request_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    pub async fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO request_cache (request_hash, provider, endpoint, model, host, batch_id, custom_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(request_hash) DO UPDATE SET \
                provider=excluded.provider, endpoint=excluded.endpoint, model=excluded.model, \
                host=excluded.host, batch_id=excluded.batch_id, custom_id=excluded.custom_id, \
                created_at=excluded.created_at",
        )
        .bind(&entry.request_hash)
        .bind(&entry.provider)
        .bind(&entry.endpoint)
        .bind(&entry.model)
        .bind(&entry.host)
        .bind(&entry.batch_id)
        .bind(&entry.custom_id)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_many(&self, entries: &[CacheEntry]) -> Result<()> {
        for entry in entries {
            self.upsert(entry).await?;
        }
        Ok(())
    }

    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<()> {
        sqlx::query("DELETE FROM request_cache WHERE created_at < ?")
            .bind(cutoff.timestamp() as f64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_by_hashes(&self, hashes: &[String]) -> Result<()> {
        for hash in hashes {
            sqlx::query("DELETE FROM request_cache WHERE request_hash = ?")
                .bind(hash)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (RequestCacheStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.sqlite3");
        let store = RequestCacheStore::open(&path).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let (store, _dir) = temp_store().await;
        let entry = CacheEntry {
            request_hash: "abc".to_string(),
            provider: "openai".to_string(),
            endpoint: "/v1/chat/completions".to_string(),
            model: "gpt-4o".to_string(),
            host: "api.openai.com".to_string(),
            batch_id: "batch_1".to_string(),
            custom_id: "req_1".to_string(),
            created_at: 100.0,
        };
        store.upsert(&entry).await.unwrap();
        let fetched = store.get_by_hash("abc").await.unwrap().unwrap();
        assert_eq!(fetched.batch_id, "batch_1");
    }

    #[tokio::test]
    async fn delete_older_than_sweeps_stale_rows() {
        let (store, _dir) = temp_store().await;
        let old = CacheEntry {
            request_hash: "old".to_string(),
            provider: "openai".to_string(),
            endpoint: "/v1/chat/completions".to_string(),
            model: "gpt-4o".to_string(),
            host: "api.openai.com".to_string(),
            batch_id: "batch_old".to_string(),
            custom_id: "req_old".to_string(),
            created_at: 0.0,
        };
        store.upsert(&old).await.unwrap();
        store
            .delete_older_than(DateTime::from_timestamp(1000, 0).unwrap())
            .await
            .unwrap();
        assert!(store.get_by_hash("old").await.unwrap().is_none());
    }
}
