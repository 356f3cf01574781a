//! Database schema migrations (idempotent).
//!
//! | Table | Holds |
//! |-------|-------|
//! | `entities` | People, channels, repos extracted from content |
//! | `content` | One row per synced unit of material |
//! | `relationships` | Directed edges, unique on `(from_id, to_id, relation)` |
//! | `changelog` | Append-only audit of entity/content writes |
//! | `sync_state` | One cursor row per `(source, account)` |
//! | `embedding_cache` | One vector per `(model, text hash)` |
//! | `vectors` | Chunk vectors, partitioned by collection |

use anyhow::Result;
use sqlx::SqlitePool;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        name TEXT NOT NULL,
        email TEXT,
        source TEXT NOT NULL,
        source_account TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(type)",
    "CREATE INDEX IF NOT EXISTS idx_entities_source ON entities(source)",
    "CREATE INDEX IF NOT EXISTS idx_entities_email ON entities(email)",
    r#"
    CREATE TABLE IF NOT EXISTS content (
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        source TEXT NOT NULL,
        source_account TEXT,
        title TEXT,
        body TEXT,
        source_id TEXT NOT NULL,
        url TEXT,
        timestamp TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_content_type ON content(type)",
    "CREATE INDEX IF NOT EXISTS idx_content_source ON content(source, source_account)",
    "CREATE INDEX IF NOT EXISTS idx_content_timestamp ON content(timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_content_source_id ON content(source_id)",
    r#"
    CREATE TABLE IF NOT EXISTS relationships (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_id TEXT NOT NULL,
        from_type TEXT NOT NULL,
        to_id TEXT NOT NULL,
        to_type TEXT NOT NULL,
        relation TEXT NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        UNIQUE(from_id, to_id, relation)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_rel_from ON relationships(from_id)",
    "CREATE INDEX IF NOT EXISTS idx_rel_to ON relationships(to_id)",
    "CREATE INDEX IF NOT EXISTS idx_rel_relation ON relationships(relation)",
    r#"
    CREATE TABLE IF NOT EXISTS changelog (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL,
        record_id TEXT NOT NULL,
        action TEXT NOT NULL,
        old_value TEXT,
        new_value TEXT,
        timestamp TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_changelog_record ON changelog(table_name, record_id)",
    "CREATE INDEX IF NOT EXISTS idx_changelog_timestamp ON changelog(timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS sync_state (
        source TEXT NOT NULL,
        account TEXT NOT NULL,
        last_sync TEXT NOT NULL,
        last_sync_token TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (source, account)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embedding_cache (
        model TEXT NOT NULL,
        key TEXT NOT NULL,
        dims INTEGER NOT NULL,
        embedding BLOB NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (model, key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vectors (
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        embedding BLOB NOT NULL,
        document TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (collection, id)
    )
    "#,
];

/// Create every table and index if missing. Safe to run on each startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
