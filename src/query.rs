//! Hybrid retrieval over the knowledge store and the vector collections.
//!
//! # Fusion
//!
//! 1. Semantic branch: embed the query once, search each collection for
//!    `top_k × candidate_multiplier` chunks, map chunk ids back to content ids.
//! 2. Keyword branch: substring search over titles and bodies, scored by
//!    [`keyword_score`].
//! 3. Concatenate semantic then keyword, keep the first hit per content id,
//!    sort by score (desc), truncate to `top_k`.
//!
//! Each branch catches and logs its own failures, so one broken backend
//! degrades the result list instead of failing the query.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::models::{parse_ts, Content, ContentKind, Direction, Entity, EntityKind, Metadata};
use crate::store::{ContentFilter, EntityFilter, SqliteStore, StoreStats};
use crate::vector_store::{MetadataFilter, VectorHit, VectorStats, VectorStore};

/// Keyword scores never exceed this, so any semantic hit above it outranks
/// every keyword-only hit.
pub const KEYWORD_SCORE_CAP: f64 = 0.8;

/// Inputs for one [`QueryEngine::search`] call.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    /// Restrict to these kinds (and their collections). `None` searches all.
    pub content_types: Option<Vec<ContentKind>>,
    pub sources: Option<Vec<String>>,
    /// Inclusive lower bound on content timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on content timestamp.
    pub until: Option<DateTime<Utc>>,
    pub top_k: usize,
    pub use_semantic: bool,
    pub use_keyword: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            content_types: None,
            sources: None,
            since: None,
            until: None,
            top_k: RetrievalConfig::default().top_k,
            use_semantic: true,
            use_keyword: true,
        }
    }

    pub fn with_types(mut self, kinds: Vec<ContentKind>) -> Self {
        self.content_types = Some(kinds);
        self
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn keyword_only(mut self) -> Self {
        self.use_semantic = false;
        self.use_keyword = true;
        self
    }

    pub fn semantic_only(mut self) -> Self {
        self.use_semantic = true;
        self.use_keyword = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Semantic,
    Keyword,
}

/// One fused result. `id` is always a content id.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    /// Vector id of the matching chunk; `None` for keyword hits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    pub content_type: ContentKind,
    pub title: Option<String>,
    /// Matching chunk for semantic hits, the body for keyword hits.
    pub text: String,
    pub source: Option<String>,
    pub url: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub score: f64,
    pub search_type: SearchType,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryStats {
    pub knowledge_graph: StoreStats,
    pub vector_store: VectorStats,
}

/// Keyword relevance: title occurrences count triple, capped at
/// [`KEYWORD_SCORE_CAP`]. Matching is case-insensitive.
pub fn keyword_score(query: &str, title: Option<&str>, body: Option<&str>) -> f64 {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return 0.0;
    }
    let hits = |text: Option<&str>| text.map_or(0, |t| t.to_lowercase().matches(&needle).count());
    let weighted = hits(title) * 3 + hits(body);
    (weighted as f64 * 0.1).min(KEYWORD_SCORE_CAP)
}

/// Content id a chunk vector belongs to: `X:chunk:N` → `X`. Ids without
/// a chunk suffix are returned unchanged.
pub fn parent_content_id(chunk_id: &str) -> &str {
    chunk_id
        .rsplit_once(":chunk:")
        .map_or(chunk_id, |(parent, _)| parent)
}

pub struct QueryEngine {
    store: SqliteStore,
    vectors: Arc<dyn VectorStore>,
    embedder: Option<Arc<Embedder>>,
    candidate_multiplier: usize,
}

impl QueryEngine {
    /// Without an embedder only the keyword branch can run.
    pub fn new(store: SqliteStore, vectors: Arc<dyn VectorStore>, embedder: Option<Arc<Embedder>>) -> Self {
        Self {
            store,
            vectors,
            embedder,
            candidate_multiplier: RetrievalConfig::default().candidate_multiplier,
        }
    }

    pub fn with_retrieval(mut self, config: &RetrievalConfig) -> Self {
        self.candidate_multiplier = config.candidate_multiplier.max(1);
        self
    }

    /// Run both branches and fuse their results.
    pub async fn search(&self, req: &SearchRequest) -> Vec<SearchHit> {
        if req.query.trim().is_empty() || req.top_k == 0 {
            return Vec::new();
        }
        let candidates = req.top_k * self.candidate_multiplier;

        let mut all = Vec::new();
        if req.use_semantic {
            all.extend(self.semantic_search(req, candidates).await);
        }
        if req.use_keyword {
            all.extend(self.keyword_search(req, candidates).await);
        }

        fuse(all, req.top_k)
    }

    async fn semantic_search(&self, req: &SearchRequest, candidates: usize) -> Vec<SearchHit> {
        let Some(embedder) = &self.embedder else {
            debug!("no embedder configured, skipping semantic branch");
            return Vec::new();
        };

        let query_vec = match embedder.embed(&req.query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "semantic search failed to embed query");
                return Vec::new();
            }
        };

        let collections: Vec<String> = match &req.content_types {
            Some(kinds) => kinds.iter().map(|k| k.collection().to_string()).collect(),
            None => match self.vectors.list_collections().await {
                Ok(names) => names,
                Err(e) => {
                    warn!(error = %e, "semantic search could not list collections");
                    return Vec::new();
                }
            },
        };

        let filters: Vec<Option<MetadataFilter>> = source_scopes(req)
            .into_iter()
            .map(|source| {
                source.map(|s| {
                    let mut filter = MetadataFilter::new();
                    filter.insert("source".into(), Value::from(s));
                    filter
                })
            })
            .collect();

        let mut hits = Vec::new();
        for collection in &collections {
            for filter in &filters {
                hits.extend(
                    self.vectors
                        .search(collection, &query_vec, candidates, filter.as_ref())
                        .await
                        .into_iter()
                        .filter_map(|hit| semantic_hit(req, collection, hit)),
                );
            }
        }

        // Best chunk first, so deduplication keeps each content's top chunk.
        sort_by_score(&mut hits);
        debug!(collections = collections.len(), hits = hits.len(), "semantic branch done");
        hits
    }

    async fn keyword_search(&self, req: &SearchRequest, candidates: usize) -> Vec<SearchHit> {
        let kinds: Vec<Option<ContentKind>> = match &req.content_types {
            Some(kinds) => kinds.iter().cloned().map(Some).collect(),
            None => vec![None],
        };

        let mut batches = Vec::new();
        for kind in &kinds {
            for source in source_scopes(req) {
                let filter = ContentFilter {
                    kind: kind.clone(),
                    source,
                    since: req.since,
                    until: req.until,
                    limit: candidates as i64,
                    ..ContentFilter::matching(req.query.trim())
                };
                batches.push(self.store.search_content(&filter).await);
            }
        }

        merge_keyword_rows(batches)
            .into_iter()
            .map(|c| SearchHit {
                score: keyword_score(&req.query, c.title.as_deref(), c.body.as_deref()),
                id: c.id,
                chunk_id: None,
                content_type: c.kind,
                title: c.title,
                text: c.body.unwrap_or_default(),
                source: Some(c.source),
                url: c.url,
                timestamp: c.timestamp,
                metadata: c.metadata,
                search_type: SearchType::Keyword,
            })
            .collect()
    }

    pub async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        self.store.get_entity(id).await
    }

    pub async fn get_content(&self, id: &str) -> Result<Option<Content>> {
        self.store.get_content(id).await
    }

    /// People whose name or email contains `query`.
    pub async fn find_person(&self, query: &str) -> Result<Vec<Entity>> {
        self.store
            .search_entities(&EntityFilter {
                query: Some(query.to_string()),
                kind: Some(EntityKind::Person),
                source: None,
                limit: 20,
            })
            .await
    }

    /// Content linked to `person_id`, newest first.
    pub async fn get_person_activity(
        &self,
        person_id: &str,
        content_types: Option<&[ContentKind]>,
        limit: usize,
    ) -> Result<Vec<Content>> {
        let edges = self
            .store
            .get_relationships(person_id, None, Direction::Incoming)
            .await?;

        let mut seen = HashSet::new();
        let mut activity = Vec::new();
        for edge in edges {
            if !seen.insert(edge.from_id.clone()) {
                continue;
            }
            if let Some(content) = self.store.get_content(&edge.from_id).await? {
                if content_types.map_or(true, |kinds| kinds.contains(&content.kind)) {
                    activity.push(content);
                }
            }
        }

        activity.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        activity.truncate(limit);
        Ok(activity)
    }

    pub async fn get_stats(&self) -> Result<QueryStats> {
        Ok(QueryStats {
            knowledge_graph: self.store.get_stats().await?,
            vector_store: self.vectors.get_stats().await?,
        })
    }
}

/// One backend query per requested source, or a single unscoped one.
fn source_scopes(req: &SearchRequest) -> Vec<Option<String>> {
    match &req.sources {
        Some(sources) => sources.iter().cloned().map(Some).collect(),
        None => vec![None],
    }
}

fn semantic_hit(req: &SearchRequest, collection: &str, hit: VectorHit) -> Option<SearchHit> {
    let meta_str = |key: &str| hit.metadata.get(key).and_then(Value::as_str).map(str::to_string);
    let timestamp = meta_str("timestamp").as_deref().and_then(parse_ts);
    if !time_allowed(req, timestamp) {
        return None;
    }

    Some(SearchHit {
        id: parent_content_id(&hit.id).to_string(),
        chunk_id: Some(hit.id.clone()),
        content_type: ContentKind::from(collection),
        title: meta_str("title"),
        text: hit.document.clone().unwrap_or_default(),
        source: meta_str("source"),
        url: meta_str("url"),
        timestamp,
        score: f64::from(hit.score),
        metadata: hit.metadata,
        search_type: SearchType::Semantic,
    })
}

/// Rows from every keyword query that succeeded; failed ones are logged and skipped.
fn merge_keyword_rows(batches: Vec<Result<Vec<Content>>>) -> Vec<Content> {
    let mut rows = Vec::new();
    for batch in batches {
        match batch {
            Ok(found) => rows.extend(found),
            Err(e) => warn!(error = %e, "keyword search failed"),
        }
    }
    rows
}

/// Bounds are inclusive; undated content never passes a bound.
fn time_allowed(req: &SearchRequest, timestamp: Option<DateTime<Utc>>) -> bool {
    if req.since.is_none() && req.until.is_none() {
        return true;
    }
    match timestamp {
        None => false,
        Some(ts) => req.since.map_or(true, |s| ts >= s) && req.until.map_or(true, |u| ts <= u),
    }
}

fn sort_by_score(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}

/// First hit per content id wins; the survivors are ranked and cut to `top_k`.
fn fuse(hits: Vec<SearchHit>, top_k: usize) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    let mut fused: Vec<SearchHit> = hits.into_iter().filter(|h| seen.insert(h.id.clone())).collect();
    sort_by_score(&mut fused);
    fused.truncate(top_k);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn hit(id: &str, score: f64, search_type: SearchType) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            chunk_id: None,
            content_type: ContentKind::Note,
            title: None,
            text: String::new(),
            source: None,
            url: None,
            timestamp: None,
            metadata: Metadata::new(),
            score,
            search_type,
        }
    }

    #[test]
    fn test_keyword_score_weights_title() {
        assert!((keyword_score("report", Some("Report"), None) - 0.3).abs() < 1e-9);
        assert!((keyword_score("report", None, Some("report, REPORT")) - 0.2).abs() < 1e-9);
        assert_eq!(keyword_score("", Some("anything"), None), 0.0);
    }

    #[test]
    fn test_keyword_score_is_capped() {
        let body = "q ".repeat(50);
        assert_eq!(keyword_score("q", Some("q q q"), Some(&body)), KEYWORD_SCORE_CAP);
    }

    #[test]
    fn test_parent_content_id() {
        assert_eq!(parent_content_id("gmail:work:1:chunk:3"), "gmail:work:1");
        assert_eq!(parent_content_id("a:chunk:1:chunk:2"), "a:chunk:1");
        assert_eq!(parent_content_id("plain-id"), "plain-id");
    }

    #[test]
    fn test_fuse_first_occurrence_wins() {
        let hits = vec![
            hit("a", 0.4, SearchType::Semantic),
            hit("b", 0.9, SearchType::Semantic),
            hit("a", 0.8, SearchType::Keyword),
            hit("c", 0.5, SearchType::Keyword),
        ];
        let fused = fuse(hits, 10);
        let ids: Vec<&str> = fused.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(fused[2].search_type, SearchType::Semantic);
        assert_eq!(fused[2].score, 0.4);
    }

    #[test]
    fn test_fuse_truncates() {
        let hits = (0..5).map(|i| hit(&i.to_string(), i as f64 / 10.0, SearchType::Keyword)).collect();
        let fused = fuse(hits, 2);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].id, "4");
    }

    #[test]
    fn test_time_bounds_inclusive() {
        let t = Utc::now();
        let req = SearchRequest::new("x").between(Some(t), Some(t));
        assert!(time_allowed(&req, Some(t)));
        assert!(!time_allowed(&req, None));
        assert!(time_allowed(&SearchRequest::new("x"), None));
    }

    #[test]
    fn test_failed_keyword_query_keeps_other_rows() {
        let note = |id: &str| Content::new(id, ContentKind::Note, "notes", id);
        let rows = merge_keyword_rows(vec![
            Ok(vec![note("a")]),
            Err(Error::validation("no such table")),
            Ok(vec![note("b"), note("c")]),
        ]);
        let ids: Vec<&str> = rows.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
