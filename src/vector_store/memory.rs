//! In-memory [`VectorStore`] for tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{check_filter, check_lengths, matches_filter, rank, MetadataFilter, VectorHit, VectorSelector, VectorStore};
use crate::error::Result;
use crate::models::Metadata;

struct StoredVector {
    vector: Vec<f32>,
    document: Option<String>,
    metadata: Metadata,
}

#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<BTreeMap<String, BTreeMap<String, StoredVector>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(
        &self,
        collection: &str,
        ids: &[String],
        embeddings: &[Vec<f32>],
        documents: Option<&[String]>,
        metadatas: Option<&[Metadata]>,
    ) -> Result<()> {
        check_lengths(ids, embeddings, documents, metadatas)?;

        let mut collections = self.collections.write().await;
        let entries = collections.entry(collection.to_string()).or_default();
        for (i, id) in ids.iter().enumerate() {
            entries.insert(
                id.clone(),
                StoredVector {
                    vector: embeddings[i].clone(),
                    document: documents.map(|d| d[i].clone()),
                    metadata: metadatas.map(|m| m[i].clone()).unwrap_or_default(),
                },
            );
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Vec<VectorHit> {
        let collections = self.collections.read().await;
        let Some(entries) = collections.get(collection) else {
            return Vec::new();
        };

        rank(
            entries
                .iter()
                .filter(|(_, v)| matches_filter(&v.metadata, filter))
                .map(|(id, v)| (id.as_str(), v.vector.as_slice(), v.document.as_deref(), &v.metadata)),
            query,
            top_k,
        )
    }

    async fn delete(&self, collection: &str, selector: &VectorSelector) -> Result<usize> {
        if let VectorSelector::Filter(filter) = selector {
            check_filter(filter)?;
        }

        let mut collections = self.collections.write().await;
        let Some(entries) = collections.get_mut(collection) else {
            return Ok(0);
        };

        let before = entries.len();
        match selector {
            VectorSelector::Ids(ids) => {
                for id in ids {
                    entries.remove(id);
                }
            }
            VectorSelector::Filter(filter) => {
                entries.retain(|_, v| !matches_filter(&v.metadata, Some(filter)));
            }
        }
        let removed = before - entries.len();

        if entries.is_empty() {
            collections.remove(collection);
        }
        Ok(removed)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map_or(0, |entries| entries.len()))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self.collections.read().await.keys().cloned().collect())
    }

    async fn delete_collection(&self, collection: &str) -> Result<bool> {
        Ok(self.collections.write().await.remove(collection).is_some())
    }
}
