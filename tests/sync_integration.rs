//! End-to-end tests for the sync protocol.
//!
//! A fake mail connector serves messages from memory, with knobs for a
//! change feed, expired cursors, listing failures and mid-run cancellation.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use memex::config::SyncConfig;
use memex::embedding::{Embedder, EmbeddingProvider, MemoryEmbeddingCache};
use memex::extract::link_people;
use memex::models::{Content, ContentKind, Direction, NormalizedRecord};
use memex::progress::NoProgress;
use memex::semantic::SemanticIndexer;
use memex::store::SqliteStore;
use memex::sync::{Change, ChangePage, ListPage, SourceConnector, SyncOrchestrator, SyncReport};
use memex::vector_store::{InMemoryVectorStore, VectorStore};
use memex::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ─── Fake connector ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Msg {
    id: String,
    subject: String,
    body: String,
    day: u32,
}

fn msg(id: &str, subject: &str, day: u32) -> Msg {
    Msg {
        id: id.to_string(),
        subject: subject.to_string(),
        body: format!("{} notes. Ada will follow up with Bob next week.", subject),
        day,
    }
}

struct FakeMail {
    account: String,
    items: Mutex<Vec<Msg>>,
    changes: Mutex<Vec<Change<Msg>>>,
    change_feed: bool,
    expired: AtomicBool,
    fail_page: Option<usize>,
    cancel_after_page: Option<(usize, CancellationToken)>,
}

impl FakeMail {
    fn new(account: &str, items: Vec<Msg>) -> Self {
        Self {
            account: account.to_string(),
            items: Mutex::new(items),
            changes: Mutex::new(Vec::new()),
            change_feed: true,
            expired: AtomicBool::new(false),
            fail_page: None,
            cancel_after_page: None,
        }
    }

    fn without_change_feed(mut self) -> Self {
        self.change_feed = false;
        self
    }

    fn failing_at_page(mut self, page: usize) -> Self {
        self.fail_page = Some(page);
        self
    }

    fn cancelling_after_page(mut self, page: usize, token: CancellationToken) -> Self {
        self.cancel_after_page = Some((page, token));
        self
    }

    fn push_change(&self, change: Change<Msg>) {
        if let Change::Upsert(m) = &change {
            let mut items = self.items.lock().unwrap();
            items.retain(|i| i.id != m.id);
            items.push(m.clone());
        }
        self.changes.lock().unwrap().push(change);
    }

    fn content_id(&self, id: &str) -> String {
        format!("gmail:{}:{}", self.account, id)
    }
}

#[async_trait]
impl SourceConnector for FakeMail {
    type Item = Msg;

    fn source(&self) -> &str {
        "gmail"
    }

    fn account(&self) -> &str {
        &self.account
    }

    fn supports_change_feed(&self) -> bool {
        self.change_feed
    }

    async fn current_cursor(&self) -> Result<Option<String>> {
        Ok(Some(format!("h{}", self.changes.lock().unwrap().len())))
    }

    async fn list_page(&self, page_token: Option<&str>, page_size: usize) -> Result<ListPage<Msg>> {
        let offset: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
        let page = offset / page_size;
        if self.fail_page == Some(page) {
            return Err(Error::TransientProvider("listing timed out".into()));
        }
        if let Some((after, token)) = &self.cancel_after_page {
            if *after == page {
                token.cancel();
            }
        }

        let items = self.items.lock().unwrap();
        let end = (offset + page_size).min(items.len());
        Ok(ListPage {
            items: items[offset..end].to_vec(),
            next_page_token: (end < items.len()).then(|| end.to_string()),
        })
    }

    async fn changes_since(&self, cursor: &str, _page_token: Option<&str>) -> Result<ChangePage<Msg>> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(Error::token_expired("gmail", &self.account));
        }
        let start: usize = cursor.trim_start_matches('h').parse().unwrap();
        let changes = self.changes.lock().unwrap();
        Ok(ChangePage {
            changes: changes[start..].to_vec(),
            next_page_token: None,
            new_cursor: Some(format!("h{}", changes.len())),
        })
    }

    fn normalize(&self, item: &Msg) -> Result<NormalizedRecord> {
        let content = Content::new(self.content_id(&item.id), ContentKind::Email, "gmail", item.id.clone())
            .with_account(self.account.clone())
            .with_title(item.subject.clone())
            .with_body(item.body.clone())
            .with_timestamp(Utc.with_ymd_and_hms(2024, 3, item.day, 9, 0, 0).unwrap())
            .with_meta("from", "Ada Lovelace <ada@example.com>")
            .with_meta("to", "bob@example.com");
        let record = link_people(NormalizedRecord::new(content), "Ada Lovelace <ada@example.com>", "sender");
        Ok(link_people(record, "bob@example.com", "recipient"))
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

async fn setup(max_items: usize) -> (TempDir, SqliteStore, SyncOrchestrator) {
    let tmp = TempDir::new().unwrap();
    let store = SqliteStore::open_path(&tmp.path().join("kb.sqlite")).await.unwrap();
    let config = SyncConfig {
        page_size: 2,
        ..SyncConfig::default()
    }
    .with_source("gmail", &["work"], max_items);
    let orchestrator = SyncOrchestrator::new(store.clone(), config).with_progress(Arc::new(NoProgress));
    (tmp, store, orchestrator)
}

fn five_messages() -> Vec<Msg> {
    (1..=5).map(|i| msg(&i.to_string(), &format!("Status {}", i), i)).collect()
}

fn expect_full(report: SyncReport) -> memex::sync::FullSyncStats {
    match report {
        SyncReport::Full(stats) => stats,
        other => panic!("expected full report, got {:?}", other),
    }
}

fn expect_delta(report: SyncReport) -> memex::sync::DeltaSyncStats {
    match report {
        SyncReport::Delta(stats) => stats,
        other => panic!("expected delta report, got {:?}", other),
    }
}

// ─── Full sync ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_sync_ingests_everything_and_persists_cursor() {
    let (_tmp, store, orchestrator) = setup(100).await;
    let mail = FakeMail::new("work", five_messages());

    let stats = expect_full(orchestrator.run_full(&mail, &CancellationToken::new()).await.unwrap());
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.indexed, 5);
    assert_eq!(stats.entities_extracted, 2);
    assert_eq!(stats.pages, 3);
    assert_eq!(stats.errors, 0);
    assert!(stats.cursor_advanced);

    let state = store.get_last_sync("gmail", "work").await.unwrap().unwrap();
    assert_eq!(state.sync_token.as_deref(), Some("h0"));
    assert_eq!(state.metadata["type"], "full");
    assert_eq!(state.metadata["processed"], 5);

    let edges = store
        .get_relationships("person:ada@example.com", Some("sender"), Direction::Incoming)
        .await
        .unwrap();
    assert_eq!(edges.len(), 5);
}

#[tokio::test]
async fn test_full_sync_rerun_is_idempotent() {
    let (_tmp, store, orchestrator) = setup(100).await;
    let mail = FakeMail::new("work", five_messages());
    let cancel = CancellationToken::new();

    orchestrator.run_full(&mail, &cancel).await.unwrap();
    let again = expect_full(orchestrator.run_full(&mail, &cancel).await.unwrap());

    assert_eq!(again.processed, 5);
    assert_eq!(again.indexed, 0);
    assert_eq!(again.entities_extracted, 0);

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.total_content, 5);
    assert_eq!(stats.total_entities, 2);
    assert_eq!(stats.total_relationships, 10);
}

#[tokio::test]
async fn test_unknown_account_is_rejected_before_any_work() {
    let (_tmp, store, orchestrator) = setup(100).await;
    let mail = FakeMail::new("personal", five_messages());

    let err = orchestrator.run_full(&mail, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = orchestrator.run_delta(&mail, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    assert!(store.get_last_sync("gmail", "personal").await.unwrap().is_none());
    assert_eq!(store.get_stats().await.unwrap().total_content, 0);
}

#[tokio::test]
async fn test_bad_record_is_counted_and_skipped() {
    let (_tmp, store, orchestrator) = setup(100).await;
    let mut items = five_messages();
    items.insert(2, msg("", "No id", 9));
    let mail = FakeMail::new("work", items);

    let stats = expect_full(orchestrator.run_full(&mail, &CancellationToken::new()).await.unwrap());
    assert_eq!(stats.processed, 6);
    assert_eq!(stats.indexed, 5);
    assert_eq!(stats.errors, 1);
    assert!(stats.cursor_advanced);
    assert_eq!(store.get_stats().await.unwrap().total_content, 5);
}

#[tokio::test]
async fn test_listing_failure_aborts_without_advancing_cursor() {
    let (_tmp, store, orchestrator) = setup(100).await;
    let cancel = CancellationToken::new();

    // Establish a prior cursor.
    let healthy = FakeMail::new("work", five_messages());
    healthy.push_change(Change::Upsert(msg("6", "Status 6", 6)));
    orchestrator.run_full(&healthy, &cancel).await.unwrap();
    let before = store.get_last_sync("gmail", "work").await.unwrap().unwrap();
    assert_eq!(before.sync_token.as_deref(), Some("h1"));

    let broken = FakeMail::new("work", five_messages()).failing_at_page(1);
    let stats = expect_full(orchestrator.run_full(&broken, &cancel).await.unwrap());
    assert!(stats.aborted);
    assert!(!stats.cursor_advanced);
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.errors, 1);

    let after = store.get_last_sync("gmail", "work").await.unwrap().unwrap();
    assert_eq!(after.sync_token.as_deref(), Some("h1"));
    assert_eq!(after.last_sync, before.last_sync);
    assert_eq!(after.metadata["aborted"], true);
}

#[tokio::test]
async fn test_cancelled_run_does_not_advance_cursor() {
    let (_tmp, store, orchestrator) = setup(100).await;
    let cancel = CancellationToken::new();
    let mail = FakeMail::new("work", five_messages()).cancelling_after_page(0, cancel.clone());

    let stats = expect_full(orchestrator.run_full(&mail, &cancel).await.unwrap());
    assert!(stats.cancelled);
    assert_eq!(stats.pages, 1);
    assert_eq!(stats.processed, 2);
    assert!(!stats.cursor_advanced);

    // Partial stats are recorded, but no cursor exists to resume from.
    let state = store.get_last_sync("gmail", "work").await.unwrap().unwrap();
    assert!(state.sync_token.is_none());
    assert_eq!(state.metadata["cancelled"], true);

    // Re-running from scratch converges.
    let rerun = expect_full(orchestrator.run_full(&mail, &CancellationToken::new()).await.unwrap());
    assert_eq!(rerun.processed, 5);
    assert_eq!(rerun.indexed, 3);
    assert_eq!(store.get_stats().await.unwrap().total_content, 5);
}

#[tokio::test]
async fn test_max_items_cap_stops_listing() {
    let (_tmp, store, orchestrator) = setup(3).await;
    let mail = FakeMail::new("work", five_messages());

    let stats = expect_full(orchestrator.run_full(&mail, &CancellationToken::new()).await.unwrap());
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.pages, 2);
    assert!(stats.cursor_advanced);
    assert_eq!(store.get_stats().await.unwrap().total_content, 3);
}

// ─── Delta sync ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_delta_without_prior_state_runs_full_sync() {
    let (_tmp, store, orchestrator) = setup(100).await;
    let mail = FakeMail::new("work", five_messages());

    let report = orchestrator.run_delta(&mail, &CancellationToken::new()).await.unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["type"], "full");
    assert!(json.get("processed").is_some());
    assert!(json.get("added").is_none());

    let state = store.get_last_sync("gmail", "work").await.unwrap().unwrap();
    assert_eq!(state.metadata["type"], "full");
}

#[tokio::test]
async fn test_delta_applies_adds_updates_and_removals() {
    let (_tmp, store, orchestrator) = setup(100).await;
    let cancel = CancellationToken::new();
    let mail = FakeMail::new("work", five_messages());
    orchestrator.run_full(&mail, &cancel).await.unwrap();

    mail.push_change(Change::Upsert(msg("6", "Launch plan", 6)));
    mail.push_change(Change::Upsert(msg("2", "Status 2 (revised)", 2)));
    mail.push_change(Change::Remove {
        content_id: mail.content_id("3"),
    });

    let stats = expect_delta(orchestrator.run_delta(&mail, &cancel).await.unwrap());
    assert_eq!(stats.added, 1);
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.errors, 0);
    assert!(stats.cursor_advanced);

    assert!(store.get_content("gmail:work:3").await.unwrap().is_none());
    let revised = store.get_content("gmail:work:2").await.unwrap().unwrap();
    assert_eq!(revised.title.as_deref(), Some("Status 2 (revised)"));

    let state = store.get_last_sync("gmail", "work").await.unwrap().unwrap();
    assert_eq!(state.sync_token.as_deref(), Some("h3"));
    assert_eq!(state.metadata["type"], "delta");

    // Nothing new since the last cursor.
    let idle = expect_delta(orchestrator.run_delta(&mail, &cancel).await.unwrap());
    assert_eq!(idle.added + idle.updated + idle.deleted, 0);
}

#[tokio::test]
async fn test_expired_token_falls_back_to_full_sync() {
    let (_tmp, _store, orchestrator) = setup(100).await;
    let cancel = CancellationToken::new();
    let mail = FakeMail::new("work", five_messages());
    orchestrator.run_full(&mail, &cancel).await.unwrap();

    mail.expired.store(true, Ordering::SeqCst);
    let stats = expect_full(orchestrator.run_delta(&mail, &cancel).await.unwrap());
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.indexed, 0);
}

#[tokio::test]
async fn test_relist_delta_deletes_missing_content() {
    let (_tmp, store, orchestrator) = setup(100).await;
    let cancel = CancellationToken::new();
    let mail = FakeMail::new("work", five_messages()).without_change_feed();
    orchestrator.run_full(&mail, &cancel).await.unwrap();

    mail.items.lock().unwrap().retain(|m| m.id != "4");
    mail.items.lock().unwrap().push(msg("7", "Offsite", 7));

    let stats = expect_delta(orchestrator.run_delta(&mail, &cancel).await.unwrap());
    assert_eq!(stats.added, 1);
    assert_eq!(stats.updated, 4);
    assert_eq!(stats.deleted, 1);
    assert!(store.get_content("gmail:work:4").await.unwrap().is_none());
    assert!(store.get_content("gmail:work:7").await.unwrap().is_some());
}

#[tokio::test]
async fn test_relist_delta_keeps_content_when_listing_is_capped() {
    let (_tmp, store, orchestrator) = setup(3).await;
    let cancel = CancellationToken::new();
    let mail = FakeMail::new("work", five_messages()).without_change_feed();
    orchestrator.run_full(&mail, &cancel).await.unwrap();

    // Items 4 and 5 were never listed; a capped re-list must not treat
    // anything as deleted.
    mail.items.lock().unwrap().retain(|m| m.id != "1");
    let stats = expect_delta(orchestrator.run_delta(&mail, &cancel).await.unwrap());
    assert_eq!(stats.deleted, 0);
    assert!(store.get_content("gmail:work:1").await.unwrap().is_some());
}

// ─── Inline semantic indexing ───────────────────────────────────────

struct LengthProvider;

#[async_trait]
impl EmbeddingProvider for LengthProvider {
    fn model_name(&self) -> &str {
        "length"
    }
    fn dims(&self) -> usize {
        2
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
    }
}

#[tokio::test]
async fn test_inline_indexing_tracks_upserts_and_removals() {
    let (_tmp, store, orchestrator) = setup(100).await;
    let vectors = Arc::new(InMemoryVectorStore::new());
    let embedder = Arc::new(Embedder::new(Arc::new(LengthProvider), Arc::new(MemoryEmbeddingCache::new())));
    let indexer = Arc::new(SemanticIndexer::new(store.clone(), vectors.clone(), embedder));
    let orchestrator = orchestrator.with_semantic(indexer);
    let cancel = CancellationToken::new();

    let mail = FakeMail::new("work", five_messages());
    let stats = expect_full(orchestrator.run_full(&mail, &cancel).await.unwrap());
    assert_eq!(stats.index_errors, 0);
    assert_eq!(vectors.count("email").await.unwrap(), 5);

    mail.push_change(Change::Remove {
        content_id: mail.content_id("1"),
    });
    let delta = expect_delta(orchestrator.run_delta(&mail, &cancel).await.unwrap());
    assert_eq!(delta.deleted, 1);
    assert_eq!(vectors.count("email").await.unwrap(), 4);
}
