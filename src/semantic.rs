//! Semantic indexing: content → chunks → embeddings → vector collections.
//!
//! Each content kind has its own collection. A content item with id `X`
//! becomes vectors `X:chunk:0`, `X:chunk:1`, …, each carrying
//! `source_id = X` in its metadata so the whole set can be found again
//! without knowing how many chunks there were.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::chunk::{Chunk, EmailChunker, TextChunker};
use crate::config::{Config, RetrievalConfig};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::models::{format_ts, Content, ContentKind, Metadata};
use crate::store::SqliteStore;
use crate::vector_store::{MetadataFilter, VectorSelector, VectorStats, VectorStore};

/// Vector id of chunk `index` of `content_id`.
pub fn chunk_id(content_id: &str, index: usize) -> String {
    format!("{}:chunk:{}", content_id, index)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub content_processed: u64,
    pub chunks_created: u64,
    pub embeddings_generated: u64,
    pub errors: u64,
}

pub struct SemanticIndexer {
    store: SqliteStore,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<Embedder>,
    text_chunker: TextChunker,
    email_chunker: EmailChunker,
    batch_size: usize,
}

impl SemanticIndexer {
    pub fn new(store: SqliteStore, vectors: Arc<dyn VectorStore>, embedder: Arc<Embedder>) -> Self {
        Self {
            store,
            vectors,
            embedder,
            text_chunker: TextChunker::default(),
            email_chunker: EmailChunker::default(),
            batch_size: RetrievalConfig::default().semantic_batch_size,
        }
    }

    pub fn from_config(
        store: SqliteStore,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<Embedder>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            vectors,
            embedder,
            text_chunker: TextChunker::from_config(&config.chunking),
            email_chunker: EmailChunker::from_config(&config.chunking),
            batch_size: config.retrieval.semantic_batch_size.max(1),
        }
    }

    pub fn vectors(&self) -> &Arc<dyn VectorStore> {
        &self.vectors
    }

    /// Chunk `content` with the chunker for its kind. Empty bodies give no chunks.
    pub fn chunk_content(&self, content: &Content) -> Vec<Chunk> {
        let body = match content.body.as_deref() {
            Some(body) if !body.trim().is_empty() => body,
            _ => return Vec::new(),
        };
        let title = content.title.as_deref().unwrap_or("");
        let base = base_metadata(content);

        match content.kind {
            ContentKind::Email => {
                let header = |key: &str| {
                    content
                        .metadata
                        .get(key)
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string()
                };
                self.email_chunker.chunk_email(
                    title,
                    body,
                    &header("from"),
                    &header("to"),
                    &content.id,
                    Some(&base),
                )
            }
            _ => self.text_chunker.chunk_document(
                title,
                body,
                &content.id,
                content.kind.as_str(),
                Some(&base),
            ),
        }
    }

    /// Index one content item, replacing any vectors it had before.
    ///
    /// Returns the number of chunks stored; an empty body is a no-op.
    pub async fn index_content(&self, content: &Content) -> Result<usize> {
        let chunks = self.chunk_content(content);
        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        // The new chunk count may be smaller than the old one.
        self.delete_content(&content.id, &content.kind).await?;

        let ids: Vec<String> = chunks
            .iter()
            .map(|c| chunk_id(&content.id, c.chunk_index))
            .collect();
        let metadatas: Vec<Metadata> = chunks.into_iter().map(|c| c.metadata).collect();
        self.vectors
            .add(
                content.kind.collection(),
                &ids,
                &embeddings,
                Some(&texts),
                Some(&metadatas),
            )
            .await?;

        debug!(content_id = %content.id, chunks = ids.len(), "indexed content");
        Ok(ids.len())
    }

    /// Index every stored content item, optionally only of `kinds`.
    ///
    /// A failed batch is logged and counted; the run continues.
    pub async fn index_all(&self, kinds: Option<&[ContentKind]>) -> Result<IndexStats> {
        let contents = match kinds {
            Some(kinds) => {
                let mut all = Vec::new();
                for kind in kinds {
                    all.extend(self.store.list_content(Some(kind)).await?);
                }
                all
            }
            None => self.store.list_content(None).await?,
        };

        let mut by_kind: BTreeMap<ContentKind, Vec<Content>> = BTreeMap::new();
        for content in contents {
            by_kind.entry(content.kind.clone()).or_default().push(content);
        }

        let mut stats = IndexStats::default();

        for (kind, items) in &by_kind {
            for batch in items.chunks(self.batch_size) {
                let mut ids = Vec::new();
                let mut texts = Vec::new();
                let mut metadatas = Vec::new();

                for content in batch {
                    stats.content_processed += 1;
                    for chunk in self.chunk_content(content) {
                        ids.push(chunk_id(&content.id, chunk.chunk_index));
                        texts.push(chunk.text);
                        metadatas.push(chunk.metadata);
                    }
                }
                stats.chunks_created += ids.len() as u64;

                if ids.is_empty() {
                    continue;
                }

                let embeddings = match self.embedder.embed_batch(&texts).await {
                    Ok(embeddings) => embeddings,
                    Err(e) => {
                        error!(collection = kind.collection(), error = %e, "embedding batch failed");
                        stats.errors += 1;
                        continue;
                    }
                };

                match self
                    .vectors
                    .add(kind.collection(), &ids, &embeddings, Some(&texts), Some(&metadatas))
                    .await
                {
                    Ok(()) => stats.embeddings_generated += embeddings.len() as u64,
                    Err(e) => {
                        error!(collection = kind.collection(), error = %e, "vector upsert failed");
                        stats.errors += 1;
                    }
                }
            }
        }

        info!(
            processed = stats.content_processed,
            chunks = stats.chunks_created,
            embeddings = stats.embeddings_generated,
            errors = stats.errors,
            "semantic index complete"
        );
        Ok(stats)
    }

    /// Remove every chunk vector of `content_id`. Returns how many were removed.
    pub async fn delete_content(&self, content_id: &str, kind: &ContentKind) -> Result<usize> {
        let mut filter = MetadataFilter::new();
        filter.insert("source_id".into(), Value::from(content_id));
        self.vectors
            .delete(kind.collection(), &VectorSelector::Filter(filter))
            .await
    }

    pub async fn get_stats(&self) -> Result<VectorStats> {
        self.vectors.get_stats().await
    }
}

/// Metadata every chunk of `content` carries, before chunk-level keys.
fn base_metadata(content: &Content) -> Metadata {
    let mut meta = content.metadata.clone();
    meta.insert("source".into(), Value::from(content.source.as_str()));
    if let Some(account) = &content.source_account {
        meta.insert("source_account".into(), Value::from(account.as_str()));
    }
    if let Some(ts) = &content.timestamp {
        meta.insert("timestamp".into(), Value::from(format_ts(ts)));
    }
    if let Some(url) = &content.url {
        meta.insert("url".into(), Value::from(url.as_str()));
    }
    meta
}
