//! End-to-end tests for hybrid retrieval: store + semantic index + fusion.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use memex::embedding::{Embedder, EmbeddingProvider, MemoryEmbeddingCache};
use memex::extract::link_people;
use memex::models::{Content, ContentKind, NormalizedRecord};
use memex::query::{QueryEngine, SearchRequest, SearchType};
use memex::semantic::SemanticIndexer;
use memex::store::SqliteStore;
use memex::vector_store::InMemoryVectorStore;
use memex::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ─── Fake providers ─────────────────────────────────────────────────

/// Embeds text by which topics it mentions, plus a constant axis.
struct TopicProvider;

#[async_trait]
impl EmbeddingProvider for TopicProvider {
    fn model_name(&self) -> &str {
        "topics"
    }
    fn dims(&self) -> usize {
        3
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                let has = |w: &str| if t.contains(w) { 1.0 } else { 0.0 };
                vec![has("rust"), has("garden"), 1.0]
            })
            .collect())
    }
}

struct DownProvider;

#[async_trait]
impl EmbeddingProvider for DownProvider {
    fn model_name(&self) -> &str {
        "topics"
    }
    fn dims(&self) -> usize {
        3
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::Provider("401 unauthorized".into()))
    }
}

// ─── Fixture ────────────────────────────────────────────────────────

fn day(month: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, d, 12, 0, 0).unwrap()
}

struct Fixture {
    _tmp: TempDir,
    store: SqliteStore,
    vectors: Arc<InMemoryVectorStore>,
}

impl Fixture {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open_path(&tmp.path().join("kb.sqlite")).await.unwrap();
        let vectors = Arc::new(InMemoryVectorStore::new());

        let rust = Content::new("notes:main:rust", ContentKind::Note, "notes", "rust")
            .with_account("main")
            .with_title("Rust ownership")
            .with_body("The Rust borrow checker enforces ownership.")
            .with_timestamp(day(1, 10));
        let garden = Content::new("notes:main:garden", ContentKind::Note, "notes", "garden")
            .with_account("main")
            .with_title("Garden notes")
            .with_body("Tomatoes in the garden need staking.")
            .with_timestamp(day(2, 10));
        let standup = Content::new("gmail:work:1", ContentKind::Email, "gmail", "1")
            .with_account("work")
            .with_title("Standup")
            .with_body("Blocked on the release checklist.")
            .with_timestamp(day(3, 10))
            .with_meta("from", "Ada <ada@example.com>");

        for (content, with_ada) in [(rust, true), (garden, false), (standup, true)] {
            let mut record = NormalizedRecord::new(content);
            if with_ada {
                record = link_people(record, "Ada <ada@example.com>", "sender");
            }
            for entity in &record.entities {
                store.upsert_entity(entity).await.unwrap();
            }
            store.upsert_content(&record.content).await.unwrap();
            for rel in &record.relationships {
                store.add_relationship(rel).await.unwrap();
            }
        }

        let indexer = SemanticIndexer::new(store.clone(), vectors.clone(), embedder(Arc::new(TopicProvider)));
        let stats = indexer.index_all(None).await.unwrap();
        assert_eq!(stats.content_processed, 3);
        assert_eq!(stats.errors, 0);

        Self {
            _tmp: tmp,
            store,
            vectors,
        }
    }

    fn engine(&self, provider: Arc<dyn EmbeddingProvider>) -> QueryEngine {
        QueryEngine::new(self.store.clone(), self.vectors.clone(), Some(embedder(provider)))
    }
}

fn embedder(provider: Arc<dyn EmbeddingProvider>) -> Arc<Embedder> {
    Arc::new(Embedder::new(provider, Arc::new(MemoryEmbeddingCache::new())).with_retry(0, Duration::ZERO))
}

fn ids(hits: &[memex::query::SearchHit]) -> Vec<&str> {
    hits.iter().map(|h| h.id.as_str()).collect()
}

// ─── Fusion ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_hit_in_both_branches_appears_once_with_semantic_score() {
    let fx = Fixture::new().await;
    let hits = fx.engine(Arc::new(TopicProvider)).search(&SearchRequest::new("rust")).await;

    let rust: Vec<_> = hits.iter().filter(|h| h.id == "notes:main:rust").collect();
    assert_eq!(rust.len(), 1);
    assert_eq!(rust[0].search_type, SearchType::Semantic);
    assert!((rust[0].score - 1.0).abs() < 1e-4);
    assert_eq!(rust[0].chunk_id.as_deref(), Some("notes:main:rust:chunk:0"));

    // The email mentions neither topic (cos 0.707), garden mentions the other (0.5).
    assert_eq!(ids(&hits), vec!["notes:main:rust", "gmail:work:1", "notes:main:garden"]);
}

#[tokio::test]
async fn test_top_k_truncates_fused_list() {
    let fx = Fixture::new().await;
    let hits = fx
        .engine(Arc::new(TopicProvider))
        .search(&SearchRequest::new("rust").with_top_k(1))
        .await;
    assert_eq!(ids(&hits), vec!["notes:main:rust"]);
}

#[tokio::test]
async fn test_embedding_outage_degrades_to_keyword_results() {
    let fx = Fixture::new().await;
    let hits = fx.engine(Arc::new(DownProvider)).search(&SearchRequest::new("rust")).await;

    assert_eq!(ids(&hits), vec!["notes:main:rust"]);
    assert_eq!(hits[0].search_type, SearchType::Keyword);
    // One title hit (×3) plus one body hit.
    assert!((hits[0].score - 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn test_storage_outage_degrades_to_semantic_results() {
    let fx = Fixture::new().await;
    let engine = fx.engine(Arc::new(TopicProvider));
    fx.store.close().await;

    let hits = engine.search(&SearchRequest::new("rust")).await;
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|h| h.search_type == SearchType::Semantic));
}

#[tokio::test]
async fn test_engine_without_embedder_is_keyword_only() {
    let fx = Fixture::new().await;
    let engine = QueryEngine::new(fx.store.clone(), fx.vectors.clone(), None);
    let hits = engine.search(&SearchRequest::new("garden")).await;
    assert_eq!(ids(&hits), vec!["notes:main:garden"]);
    assert_eq!(hits[0].search_type, SearchType::Keyword);
}

// ─── Filters ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_source_and_type_filters_apply_to_both_branches() {
    let fx = Fixture::new().await;
    let engine = fx.engine(Arc::new(TopicProvider));

    let hits = engine
        .search(&SearchRequest::new("rust").with_sources(vec!["gmail".into()]))
        .await;
    assert_eq!(ids(&hits), vec!["gmail:work:1"]);

    let hits = engine
        .search(&SearchRequest::new("rust").with_types(vec![ContentKind::Note]))
        .await;
    assert_eq!(ids(&hits), vec!["notes:main:rust", "notes:main:garden"]);
}

#[tokio::test]
async fn test_source_filter_survives_many_newer_matches_elsewhere() {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open_path(&tmp.path().join("kb.sqlite")).await.unwrap();
    let vectors = Arc::new(InMemoryVectorStore::new());

    // Newer, lower-sorting ids from another source crowd a top_k * multiplier window.
    for i in 0..10 {
        let note = Content::new(format!("a-note:{i}"), ContentKind::Note, "notes", i.to_string())
            .with_title("Weekly plan")
            .with_body("The plan for this week.")
            .with_timestamp(day(6, 1 + i));
        store.upsert_content(&note).await.unwrap();
    }
    let mail = Content::new("gmail:work:plan", ContentKind::Note, "gmail", "plan")
        .with_title("Weekly plan")
        .with_body("The plan for this week.")
        .with_timestamp(day(1, 1));
    store.upsert_content(&mail).await.unwrap();

    let indexer = SemanticIndexer::new(store.clone(), vectors.clone(), embedder(Arc::new(TopicProvider)));
    indexer.index_all(None).await.unwrap();

    let engine = QueryEngine::new(store.clone(), vectors.clone(), Some(embedder(Arc::new(TopicProvider))));
    let req = SearchRequest::new("plan").with_top_k(1).with_sources(vec!["gmail".into()]);

    for (req, search_type) in [
        (req.clone().keyword_only(), SearchType::Keyword),
        (req.clone().semantic_only(), SearchType::Semantic),
    ] {
        let hits = engine.search(&req).await;
        assert_eq!(ids(&hits), vec!["gmail:work:plan"]);
        assert_eq!(hits[0].search_type, search_type);
    }
    assert_eq!(ids(&engine.search(&req).await), vec!["gmail:work:plan"]);
}

#[tokio::test]
async fn test_time_bounds_are_inclusive() {
    let fx = Fixture::new().await;
    let engine = fx.engine(Arc::new(TopicProvider));

    let hits = engine
        .search(&SearchRequest::new("rust").between(Some(day(2, 10)), Some(day(3, 10))))
        .await;
    assert_eq!(ids(&hits), vec!["gmail:work:1", "notes:main:garden"]);
}

#[tokio::test]
async fn test_blank_query_returns_nothing() {
    let fx = Fixture::new().await;
    assert!(fx.engine(Arc::new(TopicProvider)).search(&SearchRequest::new("  ")).await.is_empty());
}

// ─── Lookups ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_find_person_and_activity() {
    let fx = Fixture::new().await;
    let engine = fx.engine(Arc::new(TopicProvider));

    let people = engine.find_person("ADA").await.unwrap();
    assert_eq!(people.len(), 1);
    assert_eq!(people[0].id, "person:ada@example.com");

    let activity = engine
        .get_person_activity("person:ada@example.com", None, 10)
        .await
        .unwrap();
    let activity_ids: Vec<&str> = activity.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(activity_ids, vec!["gmail:work:1", "notes:main:rust"]);

    let emails = engine
        .get_person_activity("person:ada@example.com", Some(&[ContentKind::Email]), 10)
        .await
        .unwrap();
    assert_eq!(emails.len(), 1);

    assert!(engine.get_entity("person:nobody@example.com").await.unwrap().is_none());
    assert!(engine.get_content("notes:main:garden").await.unwrap().is_some());
}

#[tokio::test]
async fn test_stats_merge_store_and_vectors() {
    let fx = Fixture::new().await;
    let stats = fx.engine(Arc::new(TopicProvider)).get_stats().await.unwrap();

    assert_eq!(stats.knowledge_graph.total_content, 3);
    assert_eq!(stats.knowledge_graph.total_entities, 1);
    assert_eq!(stats.vector_store.total, 3);
    assert_eq!(stats.vector_store.collections.get("note"), Some(&2));
    assert_eq!(stats.vector_store.collections.get("email"), Some(&1));
}
