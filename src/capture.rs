//! The short-lived capture path.
//!
//! One event in, one observation out. Anything beyond the observation insert
//! (tool usage counting) is a side effect: its failure is logged and reported
//! in the outcome but never fails the capture.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::types::{Classification, NewObservation, RegistryDefaults, ToolScope};
use crate::memory::{observations, registry, sessions};

/// A captured event, as read from the host.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureEvent {
    pub partition_key: String,
    /// Defaults to the partition's most recent open session.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub classification: Option<Classification>,
    /// Tool invocation that produced this event, if any.
    #[serde(default)]
    pub tool: Option<ToolUse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolUse {
    pub name: String,
    /// `global` entries are shared across partitions; anything else is
    /// recorded against the event's partition.
    #[serde(default = "default_tool_scope")]
    pub scope: ToolScope,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_tool_scope() -> ToolScope {
    ToolScope::Project
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureOutcome {
    pub observation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Usage count after this event, when a tool was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_usage_count: Option<i64>,
    /// Side-effect failures that did not affect the capture.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Store the event's observation, then record tool usage best-effort.
///
/// Only the observation insert can make this return `Err`.
pub fn capture(conn: &Connection, event: &CaptureEvent) -> Result<CaptureOutcome> {
    let mut warnings = Vec::new();

    let session_id = match &event.session_id {
        Some(id) => Some(id.clone()),
        None => match sessions::current_open(conn, &event.partition_key) {
            Ok(session) => session.map(|s| s.id),
            Err(e) => {
                tracing::warn!(error = %e, partition = %event.partition_key, "open session lookup failed");
                warnings.push(format!("session lookup: {e}"));
                None
            }
        },
    };

    let observation = observations::create(
        conn,
        &NewObservation {
            partition_key: event.partition_key.clone(),
            session_id: session_id.clone(),
            title: event.title.clone(),
            content: event.content.clone(),
            source: event.source.clone(),
            classification: event.classification,
        },
    )?;

    let tool_usage_count = event.tool.as_ref().and_then(|tool| {
        let partition = match tool.scope {
            ToolScope::Global => None,
            ToolScope::Project | ToolScope::Plugin => Some(event.partition_key.as_str()),
        };
        let defaults = RegistryDefaults {
            scope: tool.scope,
            description: tool.description.clone(),
        };
        match registry::record_usage_or_create(conn, &tool.name, partition, &defaults) {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(error = %e, tool = %tool.name, "tool usage not recorded");
                warnings.push(format!("tool usage: {e}"));
                None
            }
        }
    });

    tracing::info!(
        id = %observation.id,
        partition = %event.partition_key,
        tool = ?event.tool.as_ref().map(|t| t.name.as_str()),
        "captured"
    );

    Ok(CaptureOutcome {
        observation_id: observation.id,
        session_id,
        tool_usage_count,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{OpenOptions, Store};

    fn test_store() -> Store {
        Store::open_in_memory(&OpenOptions::default().vector_extension(false)).unwrap()
    }

    fn event(json: &str) -> CaptureEvent {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn capture_attaches_open_session() {
        let store = test_store();
        let session = sessions::start(store.conn(), "p1").unwrap();

        let outcome = capture(
            store.conn(),
            &event(r#"{"partition_key": "p1", "content": "ran the test suite"}"#),
        )
        .unwrap();
        assert_eq!(outcome.session_id.as_deref(), Some(session.id.as_str()));
        assert!(outcome.warnings.is_empty());

        let stored = observations::get_by_id(store.conn(), &outcome.observation_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.session_id, Some(session.id));
    }

    #[test]
    fn capture_records_tool_usage() {
        let store = test_store();
        let json = r#"{"partition_key": "p1", "content": "cargo test", "tool": {"name": "cargo"}}"#;
        capture(store.conn(), &event(json)).unwrap();
        let outcome = capture(store.conn(), &event(json)).unwrap();
        assert_eq!(outcome.tool_usage_count, Some(2));

        let entry = registry::get(store.conn(), "cargo", Some("p1")).unwrap().unwrap();
        assert_eq!(entry.scope, ToolScope::Project);
    }

    #[test]
    fn tool_failure_does_not_fail_capture() {
        let store = test_store();
        store.conn().execute_batch("DROP TABLE tools;").unwrap();

        let outcome = capture(
            store.conn(),
            &event(r#"{"partition_key": "p1", "content": "still stored", "tool": {"name": "x"}}"#),
        )
        .unwrap();
        assert!(outcome.tool_usage_count.is_none());
        assert_eq!(outcome.warnings.len(), 1);
        assert!(observations::get_by_id(store.conn(), &outcome.observation_id)
            .unwrap()
            .is_some());
    }

    #[test]
    fn empty_content_fails_capture() {
        let store = test_store();
        assert!(capture(store.conn(), &event(r#"{"partition_key": "p1", "content": ""}"#)).is_err());
    }
}
