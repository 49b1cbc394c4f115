// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`SqliteSessionStore`] — a relational backend for deployments that want
//! queryable history instead of a flat JSONL-per-session layout: a single
//! shared connection behind a [`tokio::sync::Mutex`], synchronous calls run
//! inline since SQLite itself serializes writers.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;
use vargos_model::{MessageContent, Role};

use crate::error::SessionError;
use crate::store::{NewMessage, SessionPatch, SessionStore};
use crate::types::{Session, SessionKind, SessionMessage};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_key TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    label       TEXT,
    agent_id    TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    metadata    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY,
    session_key TEXT NOT NULL REFERENCES sessions(session_key) ON DELETE CASCADE,
    role        TEXT NOT NULL,
    content     TEXT NOT NULL,
    timestamp   TEXT NOT NULL,
    metadata    TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_session_ts ON messages(session_key, timestamp);
"#;

fn kind_str(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::Main => "main",
        SessionKind::Subagent => "subagent",
        SessionKind::Cron => "cron",
    }
}

fn parse_kind(s: &str) -> Result<SessionKind, SessionError> {
    match s {
        "main" => Ok(SessionKind::Main),
        "subagent" => Ok(SessionKind::Subagent),
        "cron" => Ok(SessionKind::Cron),
        other => Err(SessionError::Storage(format!("unknown session kind `{other}`"))),
    }
}

fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn from_rfc3339(s: &str) -> Result<DateTime<Utc>, SessionError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SessionError::Storage(e.to_string()))
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<(String, String, Option<String>, Option<String>, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let conn = Connection::open(path).map_err(|e| SessionError::Storage(e.to_string()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(|e| SessionError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA).map_err(|e| SessionError::Storage(e.to_string()))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, SessionError> {
        let conn = Connection::open_in_memory().map_err(|e| SessionError::Storage(e.to_string()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(|e| SessionError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA).map_err(|e| SessionError::Storage(e.to_string()))?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

#[async_trait::async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, session: Session) -> Result<Session, SessionError> {
        let conn = self.conn.lock().await;
        let metadata = serde_json::to_string(&session.metadata).map_err(|e| SessionError::Storage(e.to_string()))?;
        let result = conn.execute(
            "INSERT INTO sessions (session_key, kind, label, agent_id, created_at, updated_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.session_key,
                kind_str(session.kind),
                session.label,
                session.agent_id,
                to_rfc3339(session.created_at),
                to_rfc3339(session.updated_at),
                metadata,
            ],
        );
        match result {
            Ok(_) => Ok(session),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                Err(SessionError::AlreadyExists(session.session_key))
            }
            Err(e) => Err(SessionError::Storage(e.to_string())),
        }
    }

    async fn get(&self, session_key: &str) -> Result<Option<Session>, SessionError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT session_key, kind, label, agent_id, created_at, updated_at, metadata
                 FROM sessions WHERE session_key = ?1",
                params![session_key],
                row_to_session,
            )
            .optional()
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        row.map(|(session_key, kind, label, agent_id, created_at, updated_at, metadata)| {
            Ok(Session {
                session_key,
                kind: parse_kind(&kind)?,
                label,
                agent_id,
                created_at: from_rfc3339(&created_at)?,
                updated_at: from_rfc3339(&updated_at)?,
                metadata: serde_json::from_str(&metadata).map_err(|e| SessionError::Storage(e.to_string()))?,
            })
        })
        .transpose()
    }

    async fn update(&self, session_key: &str, patch: SessionPatch) -> Result<Session, SessionError> {
        let existing = self.get(session_key).await?.ok_or_else(|| SessionError::NotFound(session_key.to_string()))?;
        let mut updated = existing;
        if let Some(label) = patch.label {
            updated.label = label;
        }
        if let Some(agent_id) = patch.agent_id {
            updated.agent_id = agent_id;
        }
        if let Some(metadata) = patch.metadata {
            updated.metadata = metadata;
        }
        updated.updated_at = Utc::now();

        let conn = self.conn.lock().await;
        let metadata = serde_json::to_string(&updated.metadata).map_err(|e| SessionError::Storage(e.to_string()))?;
        conn.execute(
            "UPDATE sessions SET label = ?1, agent_id = ?2, updated_at = ?3, metadata = ?4 WHERE session_key = ?5",
            params![updated.label, updated.agent_id, to_rfc3339(updated.updated_at), metadata, session_key],
        )
        .map_err(|e| SessionError::Storage(e.to_string()))?;
        Ok(updated)
    }

    async fn delete(&self, session_key: &str) -> Result<(), SessionError> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute("DELETE FROM sessions WHERE session_key = ?1", params![session_key])
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        if affected == 0 {
            return Err(SessionError::NotFound(session_key.to_string()));
        }
        // Sub-agent sessions are independent rows, not children of the parent
        // row via foreign key, so cascade them explicitly by key prefix.
        conn.execute(
            "DELETE FROM sessions WHERE session_key LIKE ?1",
            params![format!("{session_key}:subagent:%")],
        )
        .map_err(|e| SessionError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn list(&self, kind: Option<SessionKind>, limit: Option<usize>) -> Result<Vec<Session>, SessionError> {
        let conn = self.conn.lock().await;
        let sql = match (kind, limit) {
            (Some(_), Some(_)) => {
                "SELECT session_key, kind, label, agent_id, created_at, updated_at, metadata
                 FROM sessions WHERE kind = ?1 ORDER BY updated_at DESC LIMIT ?2"
            }
            (Some(_), None) => {
                "SELECT session_key, kind, label, agent_id, created_at, updated_at, metadata
                 FROM sessions WHERE kind = ?1 ORDER BY updated_at DESC"
            }
            (None, Some(_)) => {
                "SELECT session_key, kind, label, agent_id, created_at, updated_at, metadata
                 FROM sessions ORDER BY updated_at DESC LIMIT ?1"
            }
            (None, None) => {
                "SELECT session_key, kind, label, agent_id, created_at, updated_at, metadata
                 FROM sessions ORDER BY updated_at DESC"
            }
        };

        let mut stmt = conn.prepare(sql).map_err(|e| SessionError::Storage(e.to_string()))?;
        let rows = match (kind, limit) {
            (Some(k), Some(l)) => stmt.query_map(params![kind_str(k), l as i64], row_to_session),
            (Some(k), None) => stmt.query_map(params![kind_str(k)], row_to_session),
            (None, Some(l)) => stmt.query_map(params![l as i64], row_to_session),
            (None, None) => stmt.query_map(params![], row_to_session),
        }
        .map_err(|e| SessionError::Storage(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let (session_key, kind, label, agent_id, created_at, updated_at, metadata) =
                row.map_err(|e| SessionError::Storage(e.to_string()))?;
            out.push(Session {
                session_key,
                kind: parse_kind(&kind)?,
                label,
                agent_id,
                created_at: from_rfc3339(&created_at)?,
                updated_at: from_rfc3339(&updated_at)?,
                metadata: serde_json::from_str(&metadata).map_err(|e| SessionError::Storage(e.to_string()))?,
            });
        }
        Ok(out)
    }

    async fn add_message(&self, session_key: &str, input: NewMessage) -> Result<SessionMessage, SessionError> {
        if self.get(session_key).await?.is_none() {
            return Err(SessionError::NotFound(session_key.to_string()));
        }

        let msg = SessionMessage {
            id: Uuid::new_v4().to_string(),
            session_key: session_key.to_string(),
            role: input.role,
            content: input.content,
            timestamp: Utc::now(),
            metadata: input.metadata,
        };

        let conn = self.conn.lock().await;
        let content = serde_json::to_string(&msg.content).map_err(|e| SessionError::Storage(e.to_string()))?;
        let metadata = msg.metadata.as_ref().map(serde_json::to_string).transpose().map_err(|e| SessionError::Storage(e.to_string()))?;
        conn.execute(
            "INSERT INTO messages (id, session_key, role, content, timestamp, metadata) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![msg.id, msg.session_key, role_str(msg.role), content, to_rfc3339(msg.timestamp), metadata],
        )
        .map_err(|e| SessionError::Storage(e.to_string()))?;
        conn.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE session_key = ?2",
            params![to_rfc3339(msg.timestamp), session_key],
        )
        .map_err(|e| SessionError::Storage(e.to_string()))?;

        Ok(msg)
    }

    async fn get_messages(
        &self,
        session_key: &str,
        limit: Option<usize>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionMessage>, SessionError> {
        let conn = self.conn.lock().await;
        let before_str = before.map(to_rfc3339).unwrap_or_else(|| Utc.timestamp_opt(i64::MAX / 1000, 0).unwrap().to_rfc3339());

        let mut stmt = conn
            .prepare(
                "SELECT id, session_key, role, content, timestamp, metadata FROM messages
                 WHERE session_key = ?1 AND timestamp < ?2 ORDER BY timestamp DESC LIMIT ?3",
            )
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        let cap = limit.unwrap_or(i64::MAX as usize) as i64;
        let rows = stmt
            .query_map(params![session_key, before_str, cap], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(|e| SessionError::Storage(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let (id, session_key, role, content, timestamp, metadata) = row.map_err(|e| SessionError::Storage(e.to_string()))?;
            out.push(SessionMessage {
                id,
                session_key,
                role: parse_role(&role)?,
                content: serde_json::from_str(&content).map_err(|e| SessionError::Storage(e.to_string()))?,
                timestamp: from_rfc3339(&timestamp)?,
                metadata: metadata.map(|m| serde_json::from_str(&m)).transpose().map_err(|e| SessionError::Storage(e.to_string()))?,
            });
        }
        out.reverse();
        Ok(out)
    }
}

fn role_str(role: &Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn parse_role(s: &str) -> Result<Role, SessionError> {
    match s {
        "system" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "tool" => Ok(Role::Tool),
        other => Err(SessionError::Storage(format!("unknown role `{other}`"))),
    }
}
