//! SQLite-backed knowledge store.
//!
//! Durable home for entities, content, relationships, sync cursors, and the
//! append-only changelog. Every public method runs in a single transaction:
//! it either commits every change it made or none of them. There is no
//! atomicity across calls; concurrent upserts of the same id race under
//! last-write-wins.
//!
//! # Operations
//!
//! | Method | Returns |
//! |--------|---------|
//! | [`upsert_entity`](SqliteStore::upsert_entity) | `true` if newly inserted |
//! | [`upsert_content`](SqliteStore::upsert_content) | `true` if newly inserted |
//! | [`add_relationship`](SqliteStore::add_relationship) | `false` on duplicate edge |
//! | [`delete_content`](SqliteStore::delete_content) / [`delete_entity`](SqliteStore::delete_entity) | `false` if absent |
//! | [`search_content`](SqliteStore::search_content) | Substring match, newest first |
//! | [`search_entities`](SqliteStore::search_entities) | Name or email match |
//! | [`get_last_sync`](SqliteStore::get_last_sync) / [`set_last_sync`](SqliteStore::set_last_sync) | Sync cursor per `(source, account)` |
//!
//! Substring matching uses SQLite `LIKE`, which folds ASCII case only.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::migrate;
use crate::models::{
    format_ts, parse_ts, ChangeAction, ChangeLogEntry, Content, ContentKind, Direction, Entity,
    EntityKind, Metadata, Relationship, SyncState,
};

/// Filters for [`SqliteStore::search_content`]. All set filters are ANDed;
/// time bounds are inclusive.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    pub query: Option<String>,
    pub kind: Option<ContentKind>,
    pub source: Option<String>,
    pub source_account: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self {
            query: None,
            kind: None,
            source: None,
            source_account: None,
            since: None,
            until: None,
            limit: 100,
        }
    }
}

impl ContentFilter {
    pub fn matching(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }
}

/// Filters for [`SqliteStore::search_entities`].
#[derive(Debug, Clone)]
pub struct EntityFilter {
    pub query: Option<String>,
    pub kind: Option<EntityKind>,
    pub source: Option<String>,
    pub limit: i64,
}

impl Default for EntityFilter {
    fn default() -> Self {
        Self {
            query: None,
            kind: None,
            source: None,
            limit: 100,
        }
    }
}

/// Counts reported by [`SqliteStore::get_stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub entities_by_type: BTreeMap<String, i64>,
    pub content_by_type: BTreeMap<String, i64>,
    pub content_by_source: BTreeMap<String, i64>,
    pub total_entities: i64,
    pub total_content: i64,
    pub total_relationships: i64,
    pub sync_state: Vec<SyncState>,
}

/// The storage layer. Cheap to clone; clones share one connection pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and apply migrations.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        Self::open_path(&config.db.path).await
    }

    pub async fn open_path(path: &Path) -> anyhow::Result<Self> {
        let pool = db::connect_path(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============ Entities ============

    /// Insert or update an entity.
    ///
    /// Returns `true` when no row with this id existed before the call.
    /// Re-submitting identical fields writes nothing.
    pub async fn upsert_entity(&self, entity: &Entity) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let existing = sqlx::query("SELECT * FROM entities WHERE id = ?")
            .bind(&entity.id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| entity_from_row(&row))
            .transpose()?;

        let metadata_json = serde_json::to_string(&entity.metadata)?;

        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO entities (id, type, name, email, source, source_account,
                                          metadata_json, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&entity.id)
                .bind(entity.kind.as_str())
                .bind(&entity.name)
                .bind(&entity.email)
                .bind(&entity.source)
                .bind(&entity.source_account)
                .bind(&metadata_json)
                .bind(format_ts(&now))
                .bind(format_ts(&now))
                .execute(&mut *tx)
                .await?;

                let stored = Entity {
                    created_at: Some(now),
                    updated_at: Some(now),
                    ..entity.clone()
                };
                let new_value = serde_json::to_value(&stored)?;
                log_change(&mut tx, "entities", &entity.id, ChangeAction::Insert, None, Some(&new_value)).await?;
                tx.commit().await?;
                Ok(true)
            }
            Some(old) => {
                if same_entity(&old, entity) {
                    tx.commit().await?;
                    return Ok(false);
                }

                sqlx::query(
                    r#"
                    UPDATE entities
                    SET type = ?, name = ?, email = ?, source = ?, source_account = ?,
                        metadata_json = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(entity.kind.as_str())
                .bind(&entity.name)
                .bind(&entity.email)
                .bind(&entity.source)
                .bind(&entity.source_account)
                .bind(&metadata_json)
                .bind(format_ts(&now))
                .bind(&entity.id)
                .execute(&mut *tx)
                .await?;

                let stored = Entity {
                    created_at: old.created_at,
                    updated_at: Some(now),
                    ..entity.clone()
                };
                let old_value = serde_json::to_value(&old)?;
                let new_value = serde_json::to_value(&stored)?;
                log_change(
                    &mut tx,
                    "entities",
                    &entity.id,
                    ChangeAction::Update,
                    Some(&old_value),
                    Some(&new_value),
                )
                .await?;
                tx.commit().await?;
                Ok(false)
            }
        }
    }

    pub async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        sqlx::query("SELECT * FROM entities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| entity_from_row(&row))
            .transpose()
    }

    /// Delete an entity and every relationship touching it.
    ///
    /// Returns `false` if no such entity exists.
    pub async fn delete_entity(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let old = match sqlx::query("SELECT * FROM entities WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        {
            Some(row) => entity_from_row(&row)?,
            None => return Ok(false),
        };

        sqlx::query("DELETE FROM entities WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        delete_edges_of(&mut tx, id).await?;

        let old_value = serde_json::to_value(&old)?;
        log_change(&mut tx, "entities", id, ChangeAction::Delete, Some(&old_value), None).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Entities whose name or email contains `query`, most recently updated first.
    pub async fn search_entities(&self, filter: &EntityFilter) -> Result<Vec<Entity>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM entities WHERE 1 = 1");

        if let Some(q) = filter.query.as_deref().filter(|q| !q.is_empty()) {
            let pattern = like_pattern(q);
            qb.push(" AND (name LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR email LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }
        if let Some(kind) = &filter.kind {
            qb.push(" AND type = ").push_bind(kind.as_str().to_string());
        }
        if let Some(source) = &filter.source {
            qb.push(" AND source = ").push_bind(source.clone());
        }
        qb.push(" ORDER BY updated_at DESC, id ASC LIMIT ")
            .push_bind(filter.limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(entity_from_row).collect()
    }

    // ============ Content ============

    /// Insert or update content.
    ///
    /// Returns `true` when no row with this id existed before the call.
    /// Re-submitting identical fields writes nothing.
    pub async fn upsert_content(&self, content: &Content) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let existing = sqlx::query("SELECT * FROM content WHERE id = ?")
            .bind(&content.id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| content_from_row(&row))
            .transpose()?;

        let metadata_json = serde_json::to_string(&content.metadata)?;
        let ts = content.timestamp.as_ref().map(format_ts);

        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO content (id, type, source, source_account, title, body,
                                         source_id, url, timestamp, metadata_json,
                                         created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&content.id)
                .bind(content.kind.as_str())
                .bind(&content.source)
                .bind(&content.source_account)
                .bind(&content.title)
                .bind(&content.body)
                .bind(&content.source_id)
                .bind(&content.url)
                .bind(&ts)
                .bind(&metadata_json)
                .bind(format_ts(&now))
                .bind(format_ts(&now))
                .execute(&mut *tx)
                .await?;

                let stored = Content {
                    created_at: Some(now),
                    updated_at: Some(now),
                    ..content.clone()
                };
                let new_value = serde_json::to_value(&stored)?;
                log_change(&mut tx, "content", &content.id, ChangeAction::Insert, None, Some(&new_value)).await?;
                tx.commit().await?;
                Ok(true)
            }
            Some(old) => {
                if same_content(&old, content) {
                    tx.commit().await?;
                    return Ok(false);
                }

                sqlx::query(
                    r#"
                    UPDATE content
                    SET type = ?, source = ?, source_account = ?, title = ?, body = ?,
                        source_id = ?, url = ?, timestamp = ?, metadata_json = ?,
                        updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(content.kind.as_str())
                .bind(&content.source)
                .bind(&content.source_account)
                .bind(&content.title)
                .bind(&content.body)
                .bind(&content.source_id)
                .bind(&content.url)
                .bind(&ts)
                .bind(&metadata_json)
                .bind(format_ts(&now))
                .bind(&content.id)
                .execute(&mut *tx)
                .await?;

                let stored = Content {
                    created_at: old.created_at,
                    updated_at: Some(now),
                    ..content.clone()
                };
                let old_value = serde_json::to_value(&old)?;
                let new_value = serde_json::to_value(&stored)?;
                log_change(
                    &mut tx,
                    "content",
                    &content.id,
                    ChangeAction::Update,
                    Some(&old_value),
                    Some(&new_value),
                )
                .await?;
                tx.commit().await?;
                Ok(false)
            }
        }
    }

    pub async fn get_content(&self, id: &str) -> Result<Option<Content>> {
        sqlx::query("SELECT * FROM content WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| content_from_row(&row))
            .transpose()
    }

    /// Delete content and every relationship touching it.
    ///
    /// Returns `false` if no such content exists.
    pub async fn delete_content(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let old = match sqlx::query("SELECT * FROM content WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        {
            Some(row) => content_from_row(&row)?,
            None => return Ok(false),
        };

        sqlx::query("DELETE FROM content WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        delete_edges_of(&mut tx, id).await?;

        let old_value = serde_json::to_value(&old)?;
        log_change(&mut tx, "content", id, ChangeAction::Delete, Some(&old_value), None).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Case-insensitive substring search over title and body.
    ///
    /// Results are ordered by timestamp, newest first; content without a
    /// timestamp sorts last.
    pub async fn search_content(&self, filter: &ContentFilter) -> Result<Vec<Content>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM content WHERE 1 = 1");

        if let Some(q) = filter.query.as_deref().filter(|q| !q.is_empty()) {
            let pattern = like_pattern(q);
            qb.push(" AND (title LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR body LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }
        if let Some(kind) = &filter.kind {
            qb.push(" AND type = ").push_bind(kind.as_str().to_string());
        }
        if let Some(source) = &filter.source {
            qb.push(" AND source = ").push_bind(source.clone());
        }
        if let Some(account) = &filter.source_account {
            qb.push(" AND source_account = ").push_bind(account.clone());
        }
        if let Some(since) = &filter.since {
            qb.push(" AND timestamp >= ").push_bind(format_ts(since));
        }
        if let Some(until) = &filter.until {
            qb.push(" AND timestamp <= ").push_bind(format_ts(until));
        }
        qb.push(" ORDER BY timestamp DESC, id ASC LIMIT ")
            .push_bind(filter.limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(content_from_row).collect()
    }

    /// Every content row, optionally of one kind, newest first.
    pub async fn list_content(&self, kind: Option<&ContentKind>) -> Result<Vec<Content>> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query("SELECT * FROM content WHERE type = ? ORDER BY timestamp DESC, id ASC")
                    .bind(kind.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM content ORDER BY timestamp DESC, id ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(content_from_row).collect()
    }

    /// Ids of all content synced from `source` (and `account`, if given).
    ///
    /// Used to detect items that disappeared from a source that can only be
    /// re-listed, not asked for changes.
    pub async fn content_ids_by_source(
        &self,
        source: &str,
        account: Option<&str>,
    ) -> Result<HashSet<String>> {
        let ids: Vec<String> = match account {
            Some(account) => {
                sqlx::query_scalar("SELECT id FROM content WHERE source = ? AND source_account = ?")
                    .bind(source)
                    .bind(account)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT id FROM content WHERE source = ?")
                    .bind(source)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(ids.into_iter().collect())
    }

    // ============ Relationships ============

    /// Add a directed edge. Returns `false` if `(from_id, to_id, relation)`
    /// already exists; the existing edge is left untouched.
    pub async fn add_relationship(&self, rel: &Relationship) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let metadata_json = serde_json::to_string(&rel.metadata)?;

        let result = sqlx::query(
            r#"
            INSERT INTO relationships (from_id, from_type, to_id, to_type, relation,
                                       metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(from_id, to_id, relation) DO NOTHING
            "#,
        )
        .bind(&rel.from_id)
        .bind(&rel.from_type)
        .bind(&rel.to_id)
        .bind(&rel.to_type)
        .bind(&rel.relation)
        .bind(&metadata_json)
        .bind(format_ts(&Utc::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_relationships(
        &self,
        node_id: &str,
        relation: Option<&str>,
        direction: Direction,
    ) -> Result<Vec<Relationship>> {
        let mut results = Vec::new();

        let columns: &[&str] = match direction {
            Direction::Outgoing => &["from_id"],
            Direction::Incoming => &["to_id"],
            Direction::Both => &["from_id", "to_id"],
        };

        for column in columns {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM relationships WHERE ");
            qb.push(*column).push(" = ").push_bind(node_id.to_string());
            if let Some(rel) = relation {
                qb.push(" AND relation = ").push_bind(rel.to_string());
            }
            qb.push(" ORDER BY id ASC");

            let rows = qb.build().fetch_all(&self.pool).await?;
            for row in &rows {
                results.push(relationship_from_row(row)?);
            }
        }

        Ok(results)
    }

    // ============ Sync state ============

    pub async fn get_last_sync(&self, source: &str, account: &str) -> Result<Option<SyncState>> {
        let row = sqlx::query("SELECT * FROM sync_state WHERE source = ? AND account = ?")
            .bind(source)
            .bind(account)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| sync_state_from_row(&r)).transpose()
    }

    /// Record the sync cursor for `(source, account)`, replacing any prior row.
    pub async fn set_last_sync(
        &self,
        source: &str,
        account: &str,
        last_sync: DateTime<Utc>,
        sync_token: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO sync_state (source, account, last_sync, last_sync_token, metadata_json)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source, account) DO UPDATE SET
                last_sync = excluded.last_sync,
                last_sync_token = excluded.last_sync_token,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(source)
        .bind(account)
        .bind(format_ts(&last_sync))
        .bind(sync_token)
        .bind(serde_json::to_string(metadata)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // ============ Audit & stats ============

    /// Changelog rows for one record, oldest first.
    pub async fn changelog_for(&self, table: &str, record_id: &str) -> Result<Vec<ChangeLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM changelog WHERE table_name = ? AND record_id = ? ORDER BY id ASC",
        )
        .bind(table)
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ChangeLogEntry> {
                let old_value: Option<String> = row.try_get("old_value")?;
                let new_value: Option<String> = row.try_get("new_value")?;
                Ok(ChangeLogEntry {
                    id: row.try_get("id")?,
                    table_name: row.try_get("table_name")?,
                    record_id: row.try_get("record_id")?,
                    action: row.try_get("action")?,
                    old_value: old_value.map(|s| serde_json::from_str(&s)).transpose()?,
                    new_value: new_value.map(|s| serde_json::from_str(&s)).transpose()?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    pub async fn get_stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats {
            entities_by_type: grouped_counts(&self.pool, "SELECT type, COUNT(*) FROM entities GROUP BY type").await?,
            content_by_type: grouped_counts(&self.pool, "SELECT type, COUNT(*) FROM content GROUP BY type").await?,
            content_by_source: grouped_counts(&self.pool, "SELECT source, COUNT(*) FROM content GROUP BY source").await?,
            ..StoreStats::default()
        };

        stats.total_entities = sqlx::query_scalar("SELECT COUNT(*) FROM entities")
            .fetch_one(&self.pool)
            .await?;
        stats.total_content = sqlx::query_scalar("SELECT COUNT(*) FROM content")
            .fetch_one(&self.pool)
            .await?;
        stats.total_relationships = sqlx::query_scalar("SELECT COUNT(*) FROM relationships")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query("SELECT * FROM sync_state ORDER BY source, account")
            .fetch_all(&self.pool)
            .await?;
        stats.sync_state = rows
            .iter()
            .map(sync_state_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(stats)
    }
}

async fn grouped_counts(pool: &SqlitePool, sql: &str) -> Result<BTreeMap<String, i64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(sql).fetch_all(pool).await?;
    Ok(rows.into_iter().collect())
}

async fn log_change(
    conn: &mut SqliteConnection,
    table: &str,
    record_id: &str,
    action: ChangeAction,
    old_value: Option<&serde_json::Value>,
    new_value: Option<&serde_json::Value>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO changelog (table_name, record_id, action, old_value, new_value, timestamp)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(table)
    .bind(record_id)
    .bind(action.as_str())
    .bind(old_value.map(|v| v.to_string()))
    .bind(new_value.map(|v| v.to_string()))
    .bind(format_ts(&Utc::now()))
    .execute(conn)
    .await?;
    Ok(())
}

async fn delete_edges_of(conn: &mut SqliteConnection, node_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM relationships WHERE from_id = ? OR to_id = ?")
        .bind(node_id)
        .bind(node_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Build a `LIKE` pattern matching `query` anywhere, with wildcards escaped.
fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn same_entity(stored: &Entity, incoming: &Entity) -> bool {
    stored.kind == incoming.kind
        && stored.name == incoming.name
        && stored.email == incoming.email
        && stored.source == incoming.source
        && stored.source_account == incoming.source_account
        && stored.metadata == incoming.metadata
}

fn same_content(stored: &Content, incoming: &Content) -> bool {
    stored.kind == incoming.kind
        && stored.source == incoming.source
        && stored.source_account == incoming.source_account
        && stored.title == incoming.title
        && stored.body == incoming.body
        && stored.source_id == incoming.source_id
        && stored.url == incoming.url
        && stored.timestamp.as_ref().map(format_ts) == incoming.timestamp.as_ref().map(format_ts)
        && stored.metadata == incoming.metadata
}

fn parse_metadata(raw: &str) -> Result<Metadata> {
    Ok(serde_json::from_str(raw)?)
}

fn opt_ts(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(column)?;
    Ok(raw.as_deref().and_then(parse_ts))
}

fn entity_from_row(row: &SqliteRow) -> Result<Entity> {
    let kind: String = row.try_get("type")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    Ok(Entity {
        id: row.try_get("id")?,
        kind: EntityKind::from(kind.as_str()),
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        source: row.try_get("source")?,
        source_account: row.try_get("source_account")?,
        metadata: parse_metadata(&metadata_json)?,
        created_at: opt_ts(row, "created_at")?,
        updated_at: opt_ts(row, "updated_at")?,
    })
}

fn content_from_row(row: &SqliteRow) -> Result<Content> {
    let kind: String = row.try_get("type")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    Ok(Content {
        id: row.try_get("id")?,
        kind: ContentKind::from(kind.as_str()),
        source: row.try_get("source")?,
        source_account: row.try_get("source_account")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        source_id: row.try_get("source_id")?,
        url: row.try_get("url")?,
        timestamp: opt_ts(row, "timestamp")?,
        metadata: parse_metadata(&metadata_json)?,
        created_at: opt_ts(row, "created_at")?,
        updated_at: opt_ts(row, "updated_at")?,
    })
}

fn relationship_from_row(row: &SqliteRow) -> Result<Relationship> {
    let metadata_json: String = row.try_get("metadata_json")?;
    Ok(Relationship {
        from_id: row.try_get("from_id")?,
        from_type: row.try_get("from_type")?,
        to_id: row.try_get("to_id")?,
        to_type: row.try_get("to_type")?,
        relation: row.try_get("relation")?,
        metadata: parse_metadata(&metadata_json)?,
    })
}

fn sync_state_from_row(row: &SqliteRow) -> Result<SyncState> {
    let metadata_json: String = row.try_get("metadata_json")?;
    let last_sync: String = row.try_get("last_sync")?;
    Ok(SyncState {
        source: row.try_get("source")?,
        account: row.try_get("account")?,
        last_sync: parse_ts(&last_sync).unwrap_or_default(),
        sync_token: row.try_get("last_sync_token")?,
        metadata: serde_json::from_str(&metadata_json)?,
    })
}
