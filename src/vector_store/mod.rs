//! Named-collection nearest-neighbour index over embedded chunks.
//!
//! One collection per content kind. Vectors are compared by cosine
//! similarity; hits carry both `distance = 1 - similarity` and
//! `score = 1 - distance`.
//!
//! | Backend | Storage |
//! |---------|---------|
//! | [`SqliteVectorStore`] | `vectors` table, brute-force scan per collection |
//! | [`InMemoryVectorStore`] | Process memory, for tests |
//!
//! `search` never fails: a missing collection or a backend error yields an
//! empty hit list and a log line.

mod memory;
mod sqlite;

pub use memory::InMemoryVectorStore;
pub use sqlite::SqliteVectorStore;

use async_trait::async_trait;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::models::Metadata;

/// Equality constraints on metadata keys; every key must match.
pub type MetadataFilter = Metadata;

/// Which vectors [`VectorStore::delete`] removes.
#[derive(Debug, Clone)]
pub enum VectorSelector {
    Ids(Vec<String>),
    Filter(MetadataFilter),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub id: String,
    pub document: Option<String>,
    pub metadata: Metadata,
    pub distance: f32,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VectorStats {
    pub collections: BTreeMap<String, usize>,
    pub total: usize,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Upsert vectors. Re-adding an id replaces its vector and payload.
    async fn add(
        &self,
        collection: &str,
        ids: &[String],
        embeddings: &[Vec<f32>],
        documents: Option<&[String]>,
        metadatas: Option<&[Metadata]>,
    ) -> Result<()>;

    /// Up to `top_k` nearest neighbours of `query`, best first.
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Vec<VectorHit>;

    /// Remove matching vectors, returning how many were removed.
    async fn delete(&self, collection: &str, selector: &VectorSelector) -> Result<usize>;

    async fn count(&self, collection: &str) -> Result<usize>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Drop a collection. Returns `false` if it held nothing.
    async fn delete_collection(&self, collection: &str) -> Result<bool>;

    async fn get_stats(&self) -> Result<VectorStats> {
        let mut stats = VectorStats::default();
        for name in self.list_collections().await? {
            let n = self.count(&name).await?;
            stats.total += n;
            stats.collections.insert(name, n);
        }
        Ok(stats)
    }
}

/// Reject parallel arrays of mismatched length before anything is written.
pub(crate) fn check_lengths(
    ids: &[String],
    embeddings: &[Vec<f32>],
    documents: Option<&[String]>,
    metadatas: Option<&[Metadata]>,
) -> Result<()> {
    let n = ids.len();
    if embeddings.len() != n
        || documents.is_some_and(|d| d.len() != n)
        || metadatas.is_some_and(|m| m.len() != n)
    {
        return Err(Error::validation(format!(
            "vector add: {} ids but {} embeddings, {:?} documents, {:?} metadatas",
            n,
            embeddings.len(),
            documents.map(|d| d.len()),
            metadatas.map(|m| m.len())
        )));
    }
    Ok(())
}

pub(crate) fn check_filter(filter: &MetadataFilter) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::validation("vector delete filter must name at least one key"));
    }
    Ok(())
}

pub fn matches_filter(metadata: &Metadata, filter: Option<&MetadataFilter>) -> bool {
    match filter {
        None => true,
        Some(f) => f.iter().all(|(k, v)| metadata.get(k) == Some(v)),
    }
}

/// Score candidates against `query` and keep the best `top_k`.
pub(crate) fn rank<'a, I>(candidates: I, query: &[f32], top_k: usize) -> Vec<VectorHit>
where
    I: IntoIterator<Item = (&'a str, &'a [f32], Option<&'a str>, &'a Metadata)>,
{
    let mut hits: Vec<VectorHit> = candidates
        .into_iter()
        .map(|(id, vector, document, metadata)| {
            let similarity = cosine_similarity(query, vector);
            let distance = 1.0 - similarity;
            VectorHit {
                id: id.to_string(),
                document: document.map(str::to_string),
                metadata: metadata.clone(),
                distance,
                score: 1.0 - distance,
            }
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(top_k);
    hits
}
