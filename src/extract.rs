//! Person extraction from mail-style address headers.
//!
//! Source normalizers use this to turn `From`/`To`/`Cc` values into person
//! entities linked to the content they appear on.
//!
//! Accepted forms, comma separated:
//! - `ada@example.com`
//! - `Ada Lovelace <ada@example.com>`
//! - `"Lovelace, Ada" <ada@example.com>`
//!
//! Emails are lowercased so the same person always maps to one entity id.

use crate::models::{Entity, EntityKind, NormalizedRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub email: String,
    pub name: Option<String>,
}

/// Entity id for the person owning `email`.
pub fn person_id(email: &str) -> String {
    format!("person:{}", email.trim().to_lowercase())
}

/// Parse every address in a header value. Unparseable fragments are skipped.
pub fn parse_addresses(text: &str) -> Vec<Address> {
    split_outside_quotes(text)
        .into_iter()
        .flat_map(parse_one)
        .collect()
}

/// Split on commas that are not inside quotes or angle brackets.
fn split_outside_quotes(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' | ';' if !in_quotes && !in_angle => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn parse_one(part: &str) -> Vec<Address> {
    let part = part.trim();
    if part.is_empty() {
        return Vec::new();
    }

    if let (Some(open), Some(close)) = (part.rfind('<'), part.rfind('>')) {
        if open < close {
            let email = part[open + 1..close].trim();
            if !is_email(email) {
                return Vec::new();
            }
            let name = part[..open].trim().trim_matches('"').trim();
            return vec![Address {
                email: email.to_lowercase(),
                name: (!name.is_empty()).then(|| name.to_string()),
            }];
        }
    }

    // No angle brackets: pick out bare addresses.
    part.split_whitespace()
        .map(|token| token.trim_matches(|c: char| matches!(c, '"' | '\'' | '(' | ')' | '<' | '>')))
        .filter(|token| is_email(token))
        .map(|email| Address {
            email: email.to_lowercase(),
            name: None,
        })
        .collect()
}

fn is_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !domain.contains('@') && !s.contains(char::is_whitespace)
        }
        None => false,
    }
}

/// Person entity for `address`, named by display name or else by email.
pub fn person_entity(address: &Address, source: &str, account: Option<&str>) -> Entity {
    let name = address.name.clone().unwrap_or_else(|| address.email.clone());
    let mut entity = Entity::new(person_id(&address.email), EntityKind::Person, name, source)
        .with_email(address.email.clone());
    if let Some(account) = account {
        entity = entity.with_account(account);
    }
    entity
}

/// Link every address in `header` to `record` under `relation`.
pub fn link_people(record: NormalizedRecord, header: &str, relation: &str) -> NormalizedRecord {
    let source = record.content.source.clone();
    let account = record.content.source_account.clone();
    parse_addresses(header).iter().fold(record, |record, address| {
        record.link(person_entity(address, &source, account.as_deref()), relation)
    })
}
