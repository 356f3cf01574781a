//! Full and delta synchronization from a source into the store.
//!
//! A source plugs in by implementing [`SourceConnector`]: it lists its items
//! page by page, optionally reports changes since a cursor, and normalizes
//! each raw item into a [`NormalizedRecord`]. The [`SyncOrchestrator`] does
//! the rest.
//!
//! # Full sync
//!
//! 1. Validate `(source, account)` against the configured sources.
//! 2. Snapshot the source's current cursor.
//! 3. Page through every item (up to `max_items`), upserting entities,
//!    content, and relationships for each.
//! 4. On completion, persist the snapshotted cursor and the run's stats.
//!
//! # Delta sync
//!
//! With no stored cursor, delta runs a full sync. Otherwise it applies the
//! source's change feed from that cursor and persists the new cursor. A
//! [`Error::TokenExpired`] from the source also falls back to a full sync.
//! Sources without a change feed are re-listed and diffed against what the
//! store holds for them.
//!
//! # Failure handling
//!
//! | Failure | Effect |
//! |---------|--------|
//! | Unknown source/account | `Err(Validation)` before any work |
//! | One record fails to normalize or store | Logged, counted in `errors`, run continues |
//! | Listing a page fails | Run stops; counted in `errors`, `aborted = true` |
//! | Semantic indexing of a record fails | Counted in `index_errors`, run continues |
//! | Cancelled | Run stops at the next page boundary, `cancelled = true` |
//!
//! Stopped runs still record their stats in the sync state, but keep the
//! prior cursor and `last_sync`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{NormalizedRecord, SyncState};
use crate::progress::{SyncMode, SyncProgressEvent, SyncProgressReporter, TracingProgress};
use crate::semantic::SemanticIndexer;
use crate::store::SqliteStore;

/// One page of a source listing.
#[derive(Debug, Clone)]
pub struct ListPage<I> {
    pub items: Vec<I>,
    pub next_page_token: Option<String>,
}

/// One entry of a source's change feed.
#[derive(Debug, Clone)]
pub enum Change<I> {
    Upsert(I),
    Remove { content_id: String },
}

/// One page of a source's change feed.
#[derive(Debug, Clone)]
pub struct ChangePage<I> {
    pub changes: Vec<Change<I>>,
    pub next_page_token: Option<String>,
    /// Cursor to resume from after this page; the last one seen is persisted.
    pub new_cursor: Option<String>,
}

/// Boundary between the orchestrator and one account of one source.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Raw item as the source delivers it.
    type Item: Send + Sync;

    fn source(&self) -> &str;
    fn account(&self) -> &str;

    /// Whether [`changes_since`](Self::changes_since) is available. Sources
    /// without a change feed are delta-synced by re-listing.
    fn supports_change_feed(&self) -> bool {
        true
    }

    /// The source's current resumption cursor, if it has one.
    async fn current_cursor(&self) -> Result<Option<String>>;

    async fn list_page(&self, page_token: Option<&str>, page_size: usize) -> Result<ListPage<Self::Item>>;

    /// Changes since `cursor`. Returns [`Error::TokenExpired`] if the source
    /// no longer accepts `cursor`.
    async fn changes_since(&self, _cursor: &str, _page_token: Option<&str>) -> Result<ChangePage<Self::Item>> {
        Err(Error::validation(format!("{} has no change feed", self.source())))
    }

    fn normalize(&self, item: &Self::Item) -> Result<NormalizedRecord>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullSyncStats {
    pub processed: u64,
    /// Content rows that did not exist before this run.
    pub indexed: u64,
    pub entities_extracted: u64,
    pub errors: u64,
    pub index_errors: u64,
    pub pages: u64,
    pub cancelled: bool,
    pub aborted: bool,
    pub cursor_advanced: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSyncStats {
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    pub entities_extracted: u64,
    pub errors: u64,
    pub index_errors: u64,
    pub pages: u64,
    pub cancelled: bool,
    pub aborted: bool,
    pub cursor_advanced: bool,
}

/// Outcome of a sync run; also persisted as the sync state's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SyncReport {
    Full(FullSyncStats),
    Delta(DeltaSyncStats),
}

impl SyncReport {
    pub fn errors(&self) -> u64 {
        match self {
            SyncReport::Full(s) => s.errors,
            SyncReport::Delta(s) => s.errors,
        }
    }

    /// A run that finished with errors is degraded, not failed.
    pub fn is_degraded(&self) -> bool {
        self.errors() > 0
    }
}

struct Ingested {
    content_id: String,
    is_new: bool,
    new_entities: u64,
    index_errors: u64,
}

/// Where the run leaves the sync cursor.
enum CursorUpdate {
    Advance {
        last_sync: DateTime<Utc>,
        token: Option<String>,
    },
    Keep,
}

pub struct SyncOrchestrator {
    store: SqliteStore,
    config: SyncConfig,
    semantic: Option<Arc<SemanticIndexer>>,
    progress: Arc<dyn SyncProgressReporter>,
}

impl SyncOrchestrator {
    pub fn new(store: SqliteStore, config: SyncConfig) -> Self {
        Self {
            store,
            config,
            semantic: None,
            progress: Arc::new(TracingProgress),
        }
    }

    /// Index each upserted record right away and drop vectors of removed ones.
    pub fn with_semantic(mut self, indexer: Arc<SemanticIndexer>) -> Self {
        self.semantic = Some(indexer);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Sync everything the source lists.
    ///
    /// Only validation errors are returned; everything else lands in the stats.
    pub async fn run_full<C: SourceConnector>(
        &self,
        connector: &C,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let max_items = self
            .config
            .validate_target(connector.source(), connector.account())?
            .max_items;
        Ok(self.full_sync(connector, max_items, cancel).await)
    }

    /// Sync what changed since the last completed run.
    ///
    /// Falls back to a full sync (and returns [`SyncReport::Full`]) when no
    /// cursor is stored or the source rejects it.
    pub async fn run_delta<C: SourceConnector>(
        &self,
        connector: &C,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let (source, account) = (connector.source(), connector.account());
        let max_items = self.config.validate_target(source, account)?.max_items;

        let prior = match self.store.get_last_sync(source, account).await {
            Ok(state) => state,
            Err(e) => {
                error!(source, account, error = %e, "could not read sync state");
                None
            }
        };

        if !connector.supports_change_feed() {
            return Ok(match prior {
                Some(_) => SyncReport::Delta(self.relist_delta(connector, max_items, cancel).await),
                None => {
                    info!(source, account, "no prior sync, running full sync");
                    self.full_sync(connector, max_items, cancel).await
                }
            });
        }

        let Some((token, prior)) = prior.and_then(|s| s.sync_token.clone().map(|t| (t, s))) else {
            info!(source, account, "no sync token, running full sync");
            return Ok(self.full_sync(connector, max_items, cancel).await);
        };

        match self.change_delta(connector, &token, &prior, cancel).await {
            Ok(stats) => Ok(SyncReport::Delta(stats)),
            Err(Error::TokenExpired { .. }) => {
                warn!(source, account, "sync token expired, falling back to full sync");
                Ok(self.full_sync(connector, max_items, cancel).await)
            }
            Err(e) => {
                // change_delta only surfaces token expiry; anything else is a bug upstream.
                error!(source, account, error = %e, "delta sync failed");
                Ok(SyncReport::Delta(DeltaSyncStats {
                    errors: 1,
                    aborted: true,
                    ..DeltaSyncStats::default()
                }))
            }
        }
    }

    async fn full_sync<C: SourceConnector>(
        &self,
        connector: &C,
        max_items: usize,
        cancel: &CancellationToken,
    ) -> SyncReport {
        let (source, account) = (connector.source(), connector.account());
        self.started(source, account, SyncMode::Full);

        let started_at = Utc::now();
        let mut stats = FullSyncStats::default();

        let cursor = match connector.current_cursor().await {
            Ok(cursor) => cursor,
            Err(e) => {
                error!(source, account, error = %e, "could not read source cursor");
                stats.errors += 1;
                stats.aborted = true;
                None
            }
        };

        let mut page_token: Option<String> = None;
        while !stats.aborted {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }

            let page = match connector.list_page(page_token.as_deref(), self.config.page_size).await {
                Ok(page) => page,
                Err(e) => {
                    error!(source, account, error = %e, "listing failed, stopping run");
                    stats.errors += 1;
                    stats.aborted = true;
                    break;
                }
            };
            stats.pages += 1;

            for item in &page.items {
                if stats.processed >= max_items as u64 {
                    break;
                }
                stats.processed += 1;
                match self.ingest(connector, item).await {
                    Ok(done) => {
                        if done.is_new {
                            stats.indexed += 1;
                        }
                        stats.entities_extracted += done.new_entities;
                        stats.index_errors += done.index_errors;
                    }
                    Err(e) => {
                        warn!(source, account, error = %e, "skipping record");
                        stats.errors += 1;
                    }
                }
            }

            self.page_done(source, account, stats.pages, stats.processed);

            match page.next_page_token {
                Some(next) if stats.processed < max_items as u64 => page_token = Some(next),
                _ => break,
            }
        }

        let update = if stats.cancelled || stats.aborted {
            CursorUpdate::Keep
        } else {
            CursorUpdate::Advance {
                last_sync: started_at,
                token: cursor,
            }
        };
        stats.cursor_advanced = matches!(update, CursorUpdate::Advance { .. });

        let mut report = SyncReport::Full(stats);
        self.record_run(source, account, update, &mut report).await;
        self.finished(source, account, &report);
        report
    }

    async fn change_delta<C: SourceConnector>(
        &self,
        connector: &C,
        cursor: &str,
        prior: &SyncState,
        cancel: &CancellationToken,
    ) -> Result<DeltaSyncStats> {
        let (source, account) = (connector.source(), connector.account());
        self.started(source, account, SyncMode::Delta);

        let started_at = Utc::now();
        let mut stats = DeltaSyncStats::default();
        let mut latest_cursor: Option<String> = None;
        let mut page_token: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }

            let page = match connector.changes_since(cursor, page_token.as_deref()).await {
                Ok(page) => page,
                Err(e @ Error::TokenExpired { .. }) => return Err(e),
                Err(e) => {
                    error!(source, account, error = %e, "change feed failed, stopping run");
                    stats.errors += 1;
                    stats.aborted = true;
                    break;
                }
            };
            stats.pages += 1;

            for change in &page.changes {
                match change {
                    Change::Upsert(item) => match self.ingest(connector, item).await {
                        Ok(done) => {
                            if done.is_new {
                                stats.added += 1;
                            } else {
                                stats.updated += 1;
                            }
                            stats.entities_extracted += done.new_entities;
                            stats.index_errors += done.index_errors;
                        }
                        Err(e) => {
                            warn!(source, account, error = %e, "skipping change");
                            stats.errors += 1;
                        }
                    },
                    Change::Remove { content_id } => match self.remove(content_id).await {
                        Ok((removed, index_errors)) => {
                            if removed {
                                stats.deleted += 1;
                            }
                            stats.index_errors += index_errors;
                        }
                        Err(e) => {
                            warn!(source, account, content_id = %content_id, error = %e, "could not remove content");
                            stats.errors += 1;
                        }
                    },
                }
            }

            if page.new_cursor.is_some() {
                latest_cursor = page.new_cursor;
            }
            self.page_done(source, account, stats.pages, stats.added + stats.updated + stats.deleted);

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        let update = if stats.cancelled || stats.aborted {
            CursorUpdate::Keep
        } else {
            CursorUpdate::Advance {
                last_sync: started_at,
                token: latest_cursor.or_else(|| prior.sync_token.clone()),
            }
        };
        stats.cursor_advanced = matches!(update, CursorUpdate::Advance { .. });

        let mut report = SyncReport::Delta(stats);
        self.record_run(source, account, update, &mut report).await;
        self.finished(source, account, &report);

        match report {
            SyncReport::Delta(stats) => Ok(stats),
            SyncReport::Full(_) => Err(Error::validation("delta run produced a full report")),
        }
    }

    /// Delta for sources without a change feed: list everything, then delete
    /// stored content the listing no longer returns.
    async fn relist_delta<C: SourceConnector>(
        &self,
        connector: &C,
        max_items: usize,
        cancel: &CancellationToken,
    ) -> DeltaSyncStats {
        let (source, account) = (connector.source(), connector.account());
        self.started(source, account, SyncMode::Delta);

        let started_at = Utc::now();
        let mut stats = DeltaSyncStats::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut capped = false;

        let cursor = match connector.current_cursor().await {
            Ok(cursor) => cursor,
            Err(e) => {
                error!(source, account, error = %e, "could not read source cursor");
                stats.errors += 1;
                stats.aborted = true;
                None
            }
        };

        let mut page_token: Option<String> = None;
        while !stats.aborted {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }

            let page = match connector.list_page(page_token.as_deref(), self.config.page_size).await {
                Ok(page) => page,
                Err(e) => {
                    error!(source, account, error = %e, "listing failed, stopping run");
                    stats.errors += 1;
                    stats.aborted = true;
                    break;
                }
            };
            stats.pages += 1;

            for item in &page.items {
                if seen.len() + stats.errors as usize >= max_items {
                    capped = true;
                    break;
                }
                match self.ingest(connector, item).await {
                    Ok(done) => {
                        if done.is_new {
                            stats.added += 1;
                        } else {
                            stats.updated += 1;
                        }
                        stats.entities_extracted += done.new_entities;
                        stats.index_errors += done.index_errors;
                        seen.insert(done.content_id);
                    }
                    Err(e) => {
                        warn!(source, account, error = %e, "skipping record");
                        stats.errors += 1;
                    }
                }
            }

            self.page_done(source, account, stats.pages, seen.len() as u64);

            match page.next_page_token {
                Some(next) if !capped => page_token = Some(next),
                _ => break,
            }
        }

        let listing_complete = !stats.cancelled && !stats.aborted && !capped;
        if listing_complete && stats.errors == 0 {
            match self.store.content_ids_by_source(source, Some(account)).await {
                Ok(stored) => {
                    for gone in stored.difference(&seen) {
                        match self.remove(gone).await {
                            Ok((removed, index_errors)) => {
                                if removed {
                                    stats.deleted += 1;
                                }
                                stats.index_errors += index_errors;
                            }
                            Err(e) => {
                                warn!(source, account, content_id = %gone, error = %e, "could not remove content");
                                stats.errors += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(source, account, error = %e, "could not load stored ids");
                    stats.errors += 1;
                }
            }
        } else if listing_complete {
            // A record that failed to normalize would look deleted.
            warn!(source, account, errors = stats.errors, "skipping deletion pass after record errors");
        }

        let update = if stats.cancelled || stats.aborted {
            CursorUpdate::Keep
        } else {
            CursorUpdate::Advance {
                last_sync: started_at,
                token: cursor,
            }
        };
        stats.cursor_advanced = matches!(update, CursorUpdate::Advance { .. });

        let mut report = SyncReport::Delta(stats);
        self.record_run(source, account, update, &mut report).await;
        self.finished(source, account, &report);
        match report {
            SyncReport::Delta(stats) => stats,
            SyncReport::Full(_) => DeltaSyncStats::default(),
        }
    }

    /// Normalize one item and write it: entities, then content, then edges.
    async fn ingest<C: SourceConnector>(&self, connector: &C, item: &C::Item) -> Result<Ingested> {
        let record = connector.normalize(item)?;
        record.validate(connector.source())?;

        let mut new_entities = 0;
        for entity in &record.entities {
            if self.store.upsert_entity(entity).await? {
                new_entities += 1;
            }
        }

        let is_new = self.store.upsert_content(&record.content).await?;

        for rel in &record.relationships {
            self.store.add_relationship(rel).await?;
        }

        let mut index_errors = 0;
        if let Some(semantic) = &self.semantic {
            if let Err(e) = semantic.index_content(&record.content).await {
                warn!(content_id = %record.content.id, error = %e, "semantic indexing failed");
                index_errors += 1;
            }
        }

        Ok(Ingested {
            content_id: record.content.id,
            is_new,
            new_entities,
            index_errors,
        })
    }

    /// Delete content and its vectors. Returns whether it existed, plus
    /// the number of vector cleanup failures.
    async fn remove(&self, content_id: &str) -> Result<(bool, u64)> {
        let existing = self.store.get_content(content_id).await?;
        let removed = self.store.delete_content(content_id).await?;

        let mut index_errors = 0;
        if let (Some(semantic), Some(content)) = (&self.semantic, existing) {
            if let Err(e) = semantic.delete_content(content_id, &content.kind).await {
                warn!(content_id, error = %e, "could not delete vectors");
                index_errors += 1;
            }
        }
        Ok((removed, index_errors))
    }

    /// Persist the run's stats and, if it completed, its cursor.
    async fn record_run(
        &self,
        source: &str,
        account: &str,
        update: CursorUpdate,
        report: &mut SyncReport,
    ) {
        let (last_sync, token) = match update {
            CursorUpdate::Advance { last_sync, token } => (last_sync, token),
            CursorUpdate::Keep => match self.store.get_last_sync(source, account).await {
                Ok(Some(prior)) => (prior.last_sync, prior.sync_token),
                Ok(None) => (DateTime::<Utc>::default(), None),
                Err(e) => {
                    error!(source, account, error = %e, "could not read sync state");
                    bump_errors(report);
                    return;
                }
            },
        };

        let metadata = match serde_json::to_value(&*report) {
            Ok(v) => v,
            Err(e) => {
                error!(source, account, error = %e, "could not serialize sync stats");
                serde_json::Value::Null
            }
        };

        if let Err(e) = self
            .store
            .set_last_sync(source, account, last_sync, token.as_deref(), &metadata)
            .await
        {
            error!(source, account, error = %e, "could not write sync state");
            bump_errors(report);
        }
    }

    fn started(&self, source: &str, account: &str, mode: SyncMode) {
        self.progress.report(SyncProgressEvent::Started {
            source: source.to_string(),
            account: account.to_string(),
            mode,
        });
    }

    fn page_done(&self, source: &str, account: &str, page: u64, seen: u64) {
        self.progress.report(SyncProgressEvent::Page {
            source: source.to_string(),
            account: account.to_string(),
            page,
            seen,
        });
    }

    fn finished(&self, source: &str, account: &str, report: &SyncReport) {
        let (mode, seen) = match report {
            SyncReport::Full(s) => (SyncMode::Full, s.processed),
            SyncReport::Delta(s) => (SyncMode::Delta, s.added + s.updated + s.deleted),
        };
        self.progress.report(SyncProgressEvent::Finished {
            source: source.to_string(),
            account: account.to_string(),
            mode,
            seen,
            errors: report.errors(),
        });
    }
}

fn bump_errors(report: &mut SyncReport) {
    match report {
        SyncReport::Full(s) => s.errors += 1,
        SyncReport::Delta(s) => s.errors += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serializes_with_type_tag() {
        let full = serde_json::to_value(SyncReport::Full(FullSyncStats {
            processed: 3,
            ..FullSyncStats::default()
        }))
        .unwrap();
        assert_eq!(full["type"], "full");
        assert_eq!(full["processed"], 3);
        assert!(full.get("added").is_none());

        let delta = serde_json::to_value(SyncReport::Delta(DeltaSyncStats::default())).unwrap();
        assert_eq!(delta["type"], "delta");
        assert!(delta.get("added").is_some());

        let back: SyncReport = serde_json::from_value(full).unwrap();
        assert!(matches!(back, SyncReport::Full(FullSyncStats { processed: 3, .. })));
    }

    #[test]
    fn test_degraded_when_errors() {
        let report = SyncReport::Delta(DeltaSyncStats {
            errors: 2,
            ..DeltaSyncStats::default()
        });
        assert!(report.is_degraded());
        assert!(!SyncReport::Full(FullSyncStats::default()).is_degraded());
    }
}
