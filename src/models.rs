//! Core data models used throughout memex.
//!
//! These types represent the entities, content, relationships and sync
//! cursors that flow from source connectors into the knowledge store, and
//! from there into the semantic index.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Open key-value metadata attached to entities, content, and chunks.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Kind of synced material. Each kind maps to one vector collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentKind {
    Email,
    File,
    Event,
    Issue,
    PullRequest,
    Commit,
    Message,
    Paper,
    Note,
    Collection,
    Repository,
    Other(String),
}

impl ContentKind {
    pub fn as_str(&self) -> &str {
        match self {
            ContentKind::Email => "email",
            ContentKind::File => "file",
            ContentKind::Event => "event",
            ContentKind::Issue => "issue",
            ContentKind::PullRequest => "pull_request",
            ContentKind::Commit => "commit",
            ContentKind::Message => "message",
            ContentKind::Paper => "paper",
            ContentKind::Note => "note",
            ContentKind::Collection => "collection",
            ContentKind::Repository => "repository",
            ContentKind::Other(s) => s.as_str(),
        }
    }

    /// Name of the vector collection holding this kind's chunks.
    pub fn collection(&self) -> &str {
        self.as_str()
    }
}

impl From<&str> for ContentKind {
    fn from(s: &str) -> Self {
        match s {
            "email" => ContentKind::Email,
            "file" => ContentKind::File,
            "event" => ContentKind::Event,
            "issue" => ContentKind::Issue,
            "pull_request" => ContentKind::PullRequest,
            "commit" => ContentKind::Commit,
            "message" => ContentKind::Message,
            "paper" => ContentKind::Paper,
            "note" => ContentKind::Note,
            "collection" => ContentKind::Collection,
            "repository" => ContentKind::Repository,
            other => ContentKind::Other(other.to_string()),
        }
    }
}

impl FromStr for ContentKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(ContentKind::from(s))
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ContentKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContentKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ContentKind::from(s.as_str()))
    }
}

/// Kind of actor extracted from content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Person,
    Channel,
    Repo,
    Other(String),
}

impl EntityKind {
    pub fn as_str(&self) -> &str {
        match self {
            EntityKind::Person => "person",
            EntityKind::Channel => "channel",
            EntityKind::Repo => "repo",
            EntityKind::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for EntityKind {
    fn from(s: &str) -> Self {
        match s {
            "person" => EntityKind::Person,
            "channel" => EntityKind::Channel,
            "repo" => EntityKind::Repo,
            other => EntityKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EntityKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EntityKind::from(s.as_str()))
    }
}

/// Knowledge-graph node for a person, channel, or other actor.
///
/// `created_at`/`updated_at` are maintained by the store; values supplied
/// on upsert are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub name: String,
    pub email: Option<String>,
    pub source: String,
    pub source_account: Option<String>,
    pub metadata: Metadata,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity {
    pub fn new(id: impl Into<String>, kind: EntityKind, name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            email: None,
            source: source.into(),
            source_account: None,
            metadata: Metadata::new(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.source_account = Some(account.into());
        self
    }
}

/// Knowledge-graph node for one synced unit of material.
///
/// `body` is the text submitted to chunking. `created_at`/`updated_at` are
/// maintained by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub id: String,
    pub kind: ContentKind,
    pub source: String,
    pub source_account: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub source_id: String,
    pub url: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Content {
    pub fn new(
        id: impl Into<String>,
        kind: ContentKind,
        source: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            source: source.into(),
            source_account: None,
            title: None,
            body: None,
            source_id: source_id.into(),
            url: None,
            timestamp: None,
            metadata: Metadata::new(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.source_account = Some(account.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Directed, typed edge. Unique on `(from_id, to_id, relation)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub from_id: String,
    pub from_type: String,
    pub to_id: String,
    pub to_type: String,
    pub relation: String,
    pub metadata: Metadata,
}

impl Relationship {
    pub fn new(
        from_id: impl Into<String>,
        from_type: impl Into<String>,
        to_id: impl Into<String>,
        to_type: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            from_id: from_id.into(),
            from_type: from_type.into(),
            to_id: to_id.into(),
            to_type: to_type.into(),
            relation: relation.into(),
            metadata: Metadata::new(),
        }
    }
}

/// Which edges of a node [`get_relationships`](crate::store::SqliteStore::get_relationships) returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// Per-(source, account) sync cursor. Last write wins.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncState {
    pub source: String,
    pub account: String,
    pub last_sync: DateTime<Utc>,
    pub sync_token: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Insert => "insert",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }
}

/// One append-only audit row.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub table_name: String,
    pub record_id: String,
    pub action: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub timestamp: String,
}

/// What a source connector hands the sync orchestrator for one raw item.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub content: Content,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

impl NormalizedRecord {
    pub fn new(content: Content) -> Self {
        Self {
            content,
            entities: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Attach an entity plus an edge from this record's content to it.
    pub fn link(mut self, entity: Entity, relation: &str) -> Self {
        self.relationships.push(Relationship::new(
            self.content.id.clone(),
            self.content.kind.as_str(),
            entity.id.clone(),
            entity.kind.as_str(),
            relation,
        ));
        self.entities.push(entity);
        self
    }

    /// Boundary check applied before anything is written.
    pub fn validate(&self, source: &str) -> Result<()> {
        let c = &self.content;
        if c.id.trim().is_empty() {
            return Err(Error::validation("content id is empty"));
        }
        if c.source_id.trim().is_empty() {
            return Err(Error::validation(format!("content {} has no source_id", c.id)));
        }
        if c.source != source {
            return Err(Error::validation(format!(
                "content {} claims source '{}' but was produced by '{}'",
                c.id, c.source, source
            )));
        }
        if let Some(e) = self.entities.iter().find(|e| e.id.trim().is_empty()) {
            return Err(Error::validation(format!(
                "entity '{}' extracted from {} has no id",
                e.name, c.id
            )));
        }
        Ok(())
    }
}

/// Format a timestamp the way every table stores it.
///
/// Fixed microsecond precision keeps lexical and chronological order equal.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp; `None` for anything unparseable.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_content_kind_round_trips_through_str() {
        for kind in [
            ContentKind::Email,
            ContentKind::PullRequest,
            ContentKind::Repository,
            ContentKind::Other("bookmark".into()),
        ] {
            assert_eq!(ContentKind::from(kind.as_str()), kind);
        }
        assert_eq!(ContentKind::PullRequest.collection(), "pull_request");
    }

    #[test]
    fn test_content_kind_serializes_as_string() {
        let json = serde_json::to_string(&ContentKind::Email).unwrap();
        assert_eq!(json, "\"email\"");
        let back: ContentKind = serde_json::from_str("\"paper\"").unwrap();
        assert_eq!(back, ContentKind::Paper);
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 11, 2, 3, 4, 5).unwrap();
        assert!(format_ts(&a) < format_ts(&b));
        assert_eq!(parse_ts(&format_ts(&a)), Some(a));
    }

    #[test]
    fn test_validate_rejects_foreign_source() {
        let record = NormalizedRecord::new(Content::new(
            "gmail:work:1",
            ContentKind::Email,
            "gmail",
            "1",
        ));
        assert!(record.validate("gmail").is_ok());
        assert!(matches!(record.validate("drive"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_missing_source_id() {
        let record = NormalizedRecord::new(Content::new("x", ContentKind::Note, "notes", " "));
        assert!(record.validate("notes").is_err());
    }

    #[test]
    fn test_link_adds_edge_from_content() {
        let person = Entity::new("person:a@b.com", EntityKind::Person, "A", "gmail");
        let record = NormalizedRecord::new(Content::new("gmail:w:1", ContentKind::Email, "gmail", "1"))
            .link(person, "sender");
        assert_eq!(record.entities.len(), 1);
        let edge = &record.relationships[0];
        assert_eq!(edge.from_id, "gmail:w:1");
        assert_eq!(edge.from_type, "email");
        assert_eq!(edge.to_id, "person:a@b.com");
        assert_eq!(edge.relation, "sender");
    }
}
