// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`FileSessionStore`] — the default backend: one directory per root
//! session, each session (main or sub-agent) stored as a single JSONL file
//! whose first line is the session header and whose remaining lines are
//! messages, oldest first. Sub-agent sessions store their own JSONL file
//! beside the parent's, inside the same directory, so deleting the root
//! directory cascades to every sub-agent transcript it ever spawned.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::SessionError;
use crate::store::{NewMessage, SessionPatch, SessionStore};
use crate::types::{safe_key, split_subagent_key, Session, SessionKind, SessionMessage};

fn log_path(dir: &Path, safe: &str) -> PathBuf {
    dir.join(format!("{safe}.jsonl"))
}

/// `root(":subagent:" id)?` → the directory is always named after the root.
fn root_dir(base: &Path, session_key: &str) -> (PathBuf, String) {
    let root = split_subagent_key(session_key).map(|(root, _)| root).unwrap_or(session_key);
    let safe_root = safe_key(root);
    (base.join(&safe_root), safe_root)
}

pub struct FileSessionStore {
    base: PathBuf,
    /// Serializes writes to a given root directory's session files so
    /// concurrent `addMessage`/`update` calls on the same session can't
    /// interleave partial writes.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileSessionStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into(), locks: Mutex::new(HashMap::new()) }
    }

    async fn lock_for(&self, safe_root: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(safe_root.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Read only the header (line 1) without paying for the rest of the
    /// file. Used by `list`, which only needs the header of every session.
    async fn read_header_only(&self, dir: &Path, safe: &str) -> Result<Option<Session>, SessionError> {
        let path = log_path(dir, safe);
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SessionError::Storage(e.to_string())),
        };
        let mut lines = BufReader::new(file).lines();
        loop {
            match lines.next_line().await.map_err(|e| SessionError::Storage(e.to_string()))? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    let session: Session =
                        serde_json::from_str(&line).map_err(|e| SessionError::Storage(e.to_string()))?;
                    return Ok(Some(session));
                }
                None => return Ok(None),
            }
        }
    }

    /// Read the whole session file: header (line 1) plus every message
    /// (subsequent lines), oldest first.
    async fn read_session_file(
        &self,
        dir: &Path,
        safe: &str,
    ) -> Result<Option<(Session, Vec<SessionMessage>)>, SessionError> {
        let path = log_path(dir, safe);
        let contents = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SessionError::Storage(e.to_string())),
        };
        let mut lines = contents.lines().filter(|l| !l.trim().is_empty());
        let header_line = match lines.next() {
            Some(l) => l,
            None => return Ok(None),
        };
        let session: Session =
            serde_json::from_str(header_line).map_err(|e| SessionError::Storage(e.to_string()))?;
        let messages = lines
            .map(|l| serde_json::from_str(l).map_err(|e| SessionError::Storage(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some((session, messages)))
    }

    /// Rewrite the whole session file atomically: header on line 1, then one
    /// line per message in order. Used for `create`, `update` (header-only
    /// change) and `add_message` (header bump + new message line) alike, so
    /// the header is never anything but the first line on disk.
    async fn write_session_file(
        &self,
        dir: &Path,
        safe: &str,
        session: &Session,
        messages: &[SessionMessage],
    ) -> Result<(), SessionError> {
        let path = log_path(dir, safe);
        let tmp = path.with_extension("jsonl.tmp");
        let mut buf = serde_json::to_string(session).map_err(|e| SessionError::Storage(e.to_string()))?;
        buf.push('\n');
        for msg in messages {
            buf.push_str(&serde_json::to_string(msg).map_err(|e| SessionError::Storage(e.to_string()))?);
            buf.push('\n');
        }
        fs::write(&tmp, buf.as_bytes()).await.map_err(|e| SessionError::Storage(e.to_string()))?;
        fs::rename(&tmp, &path).await.map_err(|e| SessionError::Storage(e.to_string()))
    }
}

#[async_trait::async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self, session: Session) -> Result<Session, SessionError> {
        let (dir, safe_root) = root_dir(&self.base, &session.session_key);
        let lock = self.lock_for(&safe_root).await;
        let _guard = lock.lock().await;

        fs::create_dir_all(&dir).await.map_err(|e| SessionError::Storage(e.to_string()))?;
        let safe_self = safe_key(&session.session_key);
        if self.read_header_only(&dir, &safe_self).await?.is_some() {
            return Err(SessionError::AlreadyExists(session.session_key));
        }
        self.write_session_file(&dir, &safe_self, &session, &[]).await?;
        Ok(session)
    }

    async fn get(&self, session_key: &str) -> Result<Option<Session>, SessionError> {
        let (dir, _) = root_dir(&self.base, session_key);
        self.read_header_only(&dir, &safe_key(session_key)).await
    }

    async fn update(&self, session_key: &str, patch: SessionPatch) -> Result<Session, SessionError> {
        let (dir, safe_root) = root_dir(&self.base, session_key);
        let lock = self.lock_for(&safe_root).await;
        let _guard = lock.lock().await;

        let safe_self = safe_key(session_key);
        let (mut session, messages) = self
            .read_session_file(&dir, &safe_self)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_key.to_string()))?;

        if let Some(label) = patch.label {
            session.label = label;
        }
        if let Some(agent_id) = patch.agent_id {
            session.agent_id = agent_id;
        }
        if let Some(metadata) = patch.metadata {
            session.metadata = metadata;
        }
        session.updated_at = Utc::now();

        self.write_session_file(&dir, &safe_self, &session, &messages).await?;
        Ok(session)
    }

    async fn delete(&self, session_key: &str) -> Result<(), SessionError> {
        let (dir, safe_root) = root_dir(&self.base, session_key);
        let lock = self.lock_for(&safe_root).await;
        let _guard = lock.lock().await;

        if split_subagent_key(session_key).is_some() {
            let safe_self = safe_key(session_key);
            let _ = fs::remove_file(log_path(&dir, &safe_self)).await;
            return Ok(());
        }

        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SessionError::NotFound(session_key.to_string()))
            }
            Err(e) => Err(SessionError::Storage(e.to_string())),
        }
    }

    async fn list(&self, kind: Option<SessionKind>, limit: Option<usize>) -> Result<Vec<Session>, SessionError> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.base).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(SessionError::Storage(e.to_string())),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| SessionError::Storage(e.to_string()))? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let dir = entry.path();
            let mut sub = fs::read_dir(&dir).await.map_err(|e| SessionError::Storage(e.to_string()))?;
            while let Some(f) = sub.next_entry().await.map_err(|e| SessionError::Storage(e.to_string()))? {
                let path = f.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let safe = match path.file_stem().and_then(|s| s.to_str()) {
                    Some(s) => s,
                    None => continue,
                };
                let session = match self.read_header_only(&dir, safe).await? {
                    Some(s) => s,
                    None => continue,
                };
                if kind.map(|k| k == session.kind).unwrap_or(true) {
                    out.push(session);
                }
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn add_message(&self, session_key: &str, input: NewMessage) -> Result<SessionMessage, SessionError> {
        let (dir, safe_root) = root_dir(&self.base, session_key);
        let lock = self.lock_for(&safe_root).await;
        let _guard = lock.lock().await;

        let safe_self = safe_key(session_key);
        let (mut session, mut messages) = self
            .read_session_file(&dir, &safe_self)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_key.to_string()))?;

        let msg = SessionMessage {
            id: Uuid::new_v4().to_string(),
            session_key: session_key.to_string(),
            role: input.role,
            content: input.content,
            timestamp: Utc::now(),
            metadata: input.metadata,
        };
        messages.push(msg.clone());
        session.updated_at = msg.timestamp;

        self.write_session_file(&dir, &safe_self, &session, &messages).await?;
        Ok(msg)
    }

    async fn get_messages(
        &self,
        session_key: &str,
        limit: Option<usize>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionMessage>, SessionError> {
        let (dir, _) = root_dir(&self.base, session_key);
        let (_, mut msgs) = self.read_session_file(&dir, &safe_key(session_key)).await?.unwrap_or_default();
        if let Some(before) = before {
            msgs.retain(|m| m.timestamp < before);
        }
        if let Some(limit) = limit {
            if msgs.len() > limit {
                let start = msgs.len() - limit;
                msgs.drain(..start);
            }
        }
        Ok(msgs)
    }
}
