//! [`VectorStore`] over the `vectors` table.
//!
//! Vectors are little-endian f32 BLOBs; search loads one collection and
//! scores it in process.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use super::{check_filter, check_lengths, matches_filter, rank, MetadataFilter, VectorHit, VectorSelector, VectorStore};
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::Result;
use crate::models::Metadata;

#[derive(Clone)]
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

struct StoredRow {
    id: String,
    vector: Vec<f32>,
    document: Option<String>,
    metadata: Metadata,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load(&self, collection: &str) -> Result<Vec<StoredRow>> {
        let rows = sqlx::query(
            "SELECT id, embedding, document, metadata_json FROM vectors WHERE collection = ?",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StoredRow> {
                let blob: Vec<u8> = row.try_get("embedding")?;
                let metadata_json: String = row.try_get("metadata_json")?;
                Ok(StoredRow {
                    id: row.try_get("id")?,
                    vector: blob_to_vec(&blob),
                    document: row.try_get("document")?,
                    metadata: serde_json::from_str(&metadata_json)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn add(
        &self,
        collection: &str,
        ids: &[String],
        embeddings: &[Vec<f32>],
        documents: Option<&[String]>,
        metadatas: Option<&[Metadata]>,
    ) -> Result<()> {
        check_lengths(ids, embeddings, documents, metadatas)?;

        let mut tx = self.pool.begin().await?;
        for (i, id) in ids.iter().enumerate() {
            let document = documents.map(|d| d[i].as_str());
            let metadata_json = match metadatas {
                Some(m) => serde_json::to_string(&m[i])?,
                None => "{}".to_string(),
            };

            sqlx::query(
                r#"
                INSERT INTO vectors (collection, id, embedding, document, metadata_json)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    embedding = excluded.embedding,
                    document = excluded.document,
                    metadata_json = excluded.metadata_json
                "#,
            )
            .bind(collection)
            .bind(id)
            .bind(vec_to_blob(&embeddings[i]))
            .bind(document)
            .bind(&metadata_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Vec<VectorHit> {
        let rows = match self.load(collection).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(collection, error = %e, "vector search failed");
                return Vec::new();
            }
        };

        rank(
            rows.iter()
                .filter(|r| matches_filter(&r.metadata, filter))
                .map(|r| (r.id.as_str(), r.vector.as_slice(), r.document.as_deref(), &r.metadata)),
            query,
            top_k,
        )
    }

    async fn delete(&self, collection: &str, selector: &VectorSelector) -> Result<usize> {
        let ids: Vec<String> = match selector {
            VectorSelector::Ids(ids) => ids.clone(),
            VectorSelector::Filter(filter) => {
                check_filter(filter)?;
                self.load(collection)
                    .await?
                    .into_iter()
                    .filter(|r| matches_filter(&r.metadata, Some(filter)))
                    .map(|r| r.id)
                    .collect()
            }
        };

        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in &ids {
            let result = sqlx::query("DELETE FROM vectors WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT collection FROM vectors ORDER BY collection")
                .fetch_all(&self.pool)
                .await?;
        Ok(names)
    }

    async fn delete_collection(&self, collection: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM vectors WHERE collection = ?")
            .bind(collection)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
