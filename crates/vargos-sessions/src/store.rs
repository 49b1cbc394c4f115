// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`SessionStore`] — the storage-backend trait both the file and SQLite
//! backends implement, carrying the exact same ordering and existence
//! semantics regardless of which one is mounted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vargos_model::{MessageContent, Role};

use crate::error::SessionError;
use crate::types::{Session, SessionKind, SessionMessage};

/// Fields to change on `session.update`. `None` means "leave as is"; an
/// explicit `Some(None)` clears an optional field. `sessionKey` and
/// `createdAt` are never mutable ("update may not change
/// sessionKey or createdAt").
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub label: Option<Option<String>>,
    pub agent_id: Option<Option<String>>,
    pub metadata: Option<serde_json::Value>,
}

/// Input to `session.addMessage` — everything the store needs to fill in
/// `id` and `timestamp` itself.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: MessageContent,
    pub metadata: Option<serde_json::Value>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Not idempotent: fails with [`SessionError::AlreadyExists`] if `session.session_key`
    /// already names a session.
    async fn create(&self, session: Session) -> Result<Session, SessionError>;

    async fn get(&self, session_key: &str) -> Result<Option<Session>, SessionError>;

    /// Fails with [`SessionError::NotFound`] if no such session exists.
    async fn update(&self, session_key: &str, patch: SessionPatch) -> Result<Session, SessionError>;

    /// Cascades to every message (and, for a main session, every sub-agent
    /// file that sits beside it).
    async fn delete(&self, session_key: &str) -> Result<(), SessionError>;

    async fn list(&self, kind: Option<SessionKind>, limit: Option<usize>) -> Result<Vec<Session>, SessionError>;

    /// Fails with [`SessionError::NotFound`] if `session_key` does not exist.
    async fn add_message(&self, session_key: &str, input: NewMessage) -> Result<SessionMessage, SessionError>;

    /// Returns messages oldest-first. With `before`, only messages strictly
    /// older than that timestamp are returned.
    async fn get_messages(
        &self,
        session_key: &str,
        limit: Option<usize>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionMessage>, SessionError>;
}
