//! Sync progress reporting.
//!
//! The orchestrator emits one event when a run starts, one per page it
//! ingests, and one when the run ends. Reporters decide where that goes:
//! the `tracing` log, JSON lines on stderr, or nowhere.

use std::io::Write;
use tracing::info;

/// Which sync mode a run is in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncMode {
    Full,
    Delta,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Delta => "delta",
        }
    }
}

/// A single progress event for sync.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    Started {
        source: String,
        account: String,
        mode: SyncMode,
    },
    /// One page ingested; `seen` counts items across all pages so far.
    Page {
        source: String,
        account: String,
        page: u64,
        seen: u64,
    },
    Finished {
        source: String,
        account: String,
        mode: SyncMode,
        seen: u64,
        errors: u64,
    },
}

pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Progress as `info` events on the `memex::sync` target.
pub struct TracingProgress;

impl SyncProgressReporter for TracingProgress {
    fn report(&self, event: SyncProgressEvent) {
        match &event {
            SyncProgressEvent::Started {
                source,
                account,
                mode,
            } => {
                info!(target: "memex::sync", "sync {}:{}  {} started", source, account, mode.as_str());
            }
            SyncProgressEvent::Page {
                source,
                account,
                page,
                seen,
            } => {
                info!(
                    target: "memex::sync",
                    "sync {}:{}  page {}  {} items",
                    source,
                    account,
                    page,
                    format_number(*seen)
                );
            }
            SyncProgressEvent::Finished {
                source,
                account,
                mode,
                seen,
                errors,
            } => {
                info!(
                    target: "memex::sync",
                    "sync {}:{}  {} finished  {} items, {} errors",
                    source,
                    account,
                    mode.as_str(),
                    format_number(*seen),
                    errors
                );
            }
        }
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &SyncProgressEvent) -> serde_json::Value {
        match event {
            SyncProgressEvent::Started {
                source,
                account,
                mode,
            } => serde_json::json!({
                "event": "started",
                "source": source,
                "account": account,
                "mode": mode.as_str(),
            }),
            SyncProgressEvent::Page {
                source,
                account,
                page,
                seen,
            } => serde_json::json!({
                "event": "page",
                "source": source,
                "account": account,
                "page": page,
                "seen": seen,
            }),
            SyncProgressEvent::Finished {
                source,
                account,
                mode,
                seen,
                errors,
            } => serde_json::json!({
                "event": "finished",
                "source": source,
                "account": account,
                "mode": mode.as_str(),
                "seen": seen,
                "errors": errors,
            }),
        }
    }
}

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn json_event_shape() {
        let v = JsonProgress::to_json(&SyncProgressEvent::Finished {
            source: "gmail".into(),
            account: "work".into(),
            mode: SyncMode::Delta,
            seen: 12,
            errors: 1,
        });
        assert_eq!(v["event"], "finished");
        assert_eq!(v["mode"], "delta");
        assert_eq!(v["seen"], 12);
    }
}
