// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Data model: [`Session`] and [`SessionMessage`].
//!
//! `SessionMessage.content` reuses [`vargos_model::MessageContent`] rather
//! than inventing a parallel representation — the agent runtime already
//! speaks this type throughout `vargos-core`/`vargos-model`, and the
//! `Role::Tool` variant there is this crate's `toolResult` role.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vargos_model::{MessageContent, Role};

/// One of the three session roots the session-key grammar names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Main,
    Subagent,
    Cron,
}

/// A durable conversation thread ( "Session").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    pub kind: SessionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, rename = "agentId", skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    /// Opaque key/value bag. Sub-agent sessions carry `parentSessionKey` here.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Session {
    pub fn new(session_key: impl Into<String>, kind: SessionKind) -> Self {
        let now = Utc::now();
        Self {
            session_key: session_key.into(),
            kind,
            label: None,
            agent_id: None,
            created_at: now,
            updated_at: now,
            metadata: serde_json::json!({}),
        }
    }

    pub fn parent_session_key(&self) -> Option<&str> {
        self.metadata.get("parentSessionKey").and_then(|v| v.as_str())
    }
}

/// An append-only entry in a session ( "SessionMessage").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: String,
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// `true` if `key` names a sub-agent session (`<parentKey>:subagent:<id>`).
pub fn is_subagent_key(key: &str) -> bool {
    key.contains(":subagent:")
}

/// Split a sub-agent session key into `(parent_key, id)`.
pub fn split_subagent_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(":subagent:")
}

/// Derive a filesystem-safe name for a session key.
///
/// The grammar only ever puts `:` between otherwise
/// filesystem-safe segments (`[A-Za-z0-9-]+`), so replacing it is lossless
/// for every key the grammar actually produces.
pub fn safe_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_subagent_key_detects_marker() {
        assert!(is_subagent_key("whatsapp:u1:subagent:abc"));
        assert!(!is_subagent_key("whatsapp:u1"));
        assert!(!is_subagent_key("cron:daily-report"));
    }

    #[test]
    fn split_subagent_key_returns_parent_and_id() {
        let (parent, id) = split_subagent_key("whatsapp:u1:subagent:abc").unwrap();
        assert_eq!(parent, "whatsapp:u1");
        assert_eq!(id, "abc");
    }

    #[test]
    fn split_subagent_key_none_for_non_subagent() {
        assert!(split_subagent_key("cli:1").is_none());
    }

    #[test]
    fn safe_key_replaces_colons() {
        assert_eq!(safe_key("whatsapp:u1"), "whatsapp_u1");
    }

    #[test]
    fn safe_key_preserves_already_safe_chars() {
        assert_eq!(safe_key("cli:my-id_1"), "cli_my-id_1");
    }

    #[test]
    fn new_session_stamps_created_and_updated_equal() {
        let s = Session::new("cli:1", SessionKind::Main);
        assert_eq!(s.created_at, s.updated_at);
        assert!(s.parent_session_key().is_none());
    }

    #[test]
    fn session_round_trips_through_json() {
        let mut s = Session::new("whatsapp:u1:subagent:abc", SessionKind::Subagent);
        s.metadata = serde_json::json!({"parentSessionKey": "whatsapp:u1"});
        let json = serde_json::to_string(&s).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_key, s.session_key);
        assert_eq!(back.parent_session_key(), Some("whatsapp:u1"));
    }
}
