//! Embedding caches keyed by a SHA-256 of the exact input text.
//!
//! [`SqliteEmbeddingCache`] keeps one durable row per `(model, key)` so
//! vectors survive restarts. [`MemoryEmbeddingCache`] is the per-process
//! variant used in tests.

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{blob_to_vec, vec_to_blob};
use crate::error::Result;
use crate::models::format_ts;

/// Stable cache key for `text`: lowercase hex SHA-256.
pub fn cache_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
pub trait EmbeddingCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<f32>>>;
    async fn put(&self, key: &str, embedding: &[f32]) -> Result<()>;
    async fn len(&self) -> Result<usize>;
}

/// Cache persisted in the `embedding_cache` table, scoped to one model.
pub struct SqliteEmbeddingCache {
    pool: SqlitePool,
    model: String,
}

impl SqliteEmbeddingCache {
    pub fn new(pool: SqlitePool, model: impl Into<String>) -> Self {
        Self {
            pool,
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingCache for SqliteEmbeddingCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT embedding FROM embedding_cache WHERE model = ? AND key = ?")
                .bind(&self.model)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    async fn put(&self, key: &str, embedding: &[f32]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embedding_cache (model, key, dims, embedding, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(model, key) DO UPDATE SET
                dims = excluded.dims,
                embedding = excluded.embedding,
                created_at = excluded.created_at
            "#,
        )
        .bind(&self.model)
        .bind(key)
        .bind(embedding.len() as i64)
        .bind(vec_to_blob(embedding))
        .bind(format_ts(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache WHERE model = ?")
            .bind(&self.model)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[derive(Default)]
pub struct MemoryEmbeddingCache {
    entries: RwLock<HashMap<String, Vec<f32>>>,
}

impl MemoryEmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EmbeddingCache for MemoryEmbeddingCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<f32>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, embedding: &[f32]) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), embedding.to_vec());
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    #[test]
    fn test_cache_key_is_stable_sha256() {
        assert_eq!(
            cache_key("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_ne!(cache_key("hello"), cache_key("hello "));
    }

    #[tokio::test]
    async fn test_sqlite_cache_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("kb.sqlite");

        {
            let pool = db::connect_path(&path).await.unwrap();
            migrate::run_migrations(&pool).await.unwrap();
            let cache = SqliteEmbeddingCache::new(pool.clone(), "m1");
            cache.put(&cache_key("a"), &[0.5, -1.0]).await.unwrap();
            cache.put(&cache_key("a"), &[0.25, -1.0]).await.unwrap();
            assert_eq!(cache.len().await.unwrap(), 1);
            pool.close().await;
        }

        let pool = db::connect_path(&path).await.unwrap();
        let cache = SqliteEmbeddingCache::new(pool.clone(), "m1");
        assert_eq!(cache.get(&cache_key("a")).await.unwrap(), Some(vec![0.25, -1.0]));
        assert_eq!(cache.get(&cache_key("b")).await.unwrap(), None);

        let other_model = SqliteEmbeddingCache::new(pool, "m2");
        assert_eq!(other_model.get(&cache_key("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_cache() {
        let cache = MemoryEmbeddingCache::new();
        assert_eq!(cache.len().await.unwrap(), 0);
        cache.put("k", &[1.0]).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(vec![1.0]));
        assert_eq!(cache.len().await.unwrap(), 1);
    }
}
