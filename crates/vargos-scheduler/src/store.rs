// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`CronStore`] — persists the task list to a single JSON file so schedules
//! survive process restarts ("Tasks persist across restarts").
//!
//! Grounded on `vargos_sessions::FileSessionStore`'s write-then-rename
//! idiom: the whole task list is small enough that a single file (rather
//! than one-file-per-task) is the natural fit, rewritten atomically on every
//! mutation.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use cron::Schedule;
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CronError;
use crate::types::{CronTask, CronTaskPatch};

/// Validate a cron expression without keeping the parsed schedule around.
pub fn validate_schedule(expr: &str) -> Result<Schedule, CronError> {
    Schedule::from_str(expr).map_err(|e| CronError::InvalidArgument(format!("invalid cron expression `{expr}`: {e}")))
}

pub struct CronStore {
    path: PathBuf,
    tasks: Mutex<Vec<CronTask>>,
}

impl CronStore {
    /// Loads `path` if it exists; otherwise starts with an empty task list.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, CronError> {
        let path = path.into();
        let tasks = match fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| CronError::Storage(e.to_string()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(CronError::Storage(e.to_string())),
        };
        Ok(Self { path, tasks: Mutex::new(tasks) })
    }

    async fn persist(&self, tasks: &[CronTask]) -> Result<(), CronError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| CronError::Storage(e.to_string()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(tasks).map_err(|e| CronError::Storage(e.to_string()))?;
        fs::write(&tmp, bytes).await.map_err(|e| CronError::Storage(e.to_string()))?;
        fs::rename(&tmp, &self.path).await.map_err(|e| CronError::Storage(e.to_string()))
    }

    pub async fn list(&self) -> Vec<CronTask> {
        self.tasks.lock().await.clone()
    }

    pub async fn get(&self, task_id: &str) -> Option<CronTask> {
        self.tasks.lock().await.iter().find(|t| t.task_id == task_id).cloned()
    }

    pub async fn add(
        &self,
        schedule: String,
        session_key: String,
        task: String,
        notify: Option<Vec<String>>,
    ) -> Result<CronTask, CronError> {
        validate_schedule(&schedule)?;
        let now = Utc::now();
        let new_task = CronTask {
            task_id: Uuid::new_v4().to_string(),
            schedule,
            session_key,
            task,
            notify,
            enabled: true,
            created_at: now,
            updated_at: now,
            last_fired_at: None,
        };
        let mut tasks = self.tasks.lock().await;
        tasks.push(new_task.clone());
        self.persist(&tasks).await?;
        Ok(new_task)
    }

    pub async fn remove(&self, task_id: &str) -> Result<(), CronError> {
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|t| t.task_id != task_id);
        if tasks.len() == before {
            return Err(CronError::NotFound(task_id.to_string()));
        }
        self.persist(&tasks).await
    }

    pub async fn update(&self, task_id: &str, patch: CronTaskPatch) -> Result<CronTask, CronError> {
        let mut tasks = self.tasks.lock().await;
        let t = tasks
            .iter_mut()
            .find(|t| t.task_id == task_id)
            .ok_or_else(|| CronError::NotFound(task_id.to_string()))?;
        if let Some(schedule) = patch.schedule {
            validate_schedule(&schedule)?;
            t.schedule = schedule;
        }
        if let Some(session_key) = patch.session_key {
            t.session_key = session_key;
        }
        if let Some(task) = patch.task {
            t.task = task;
        }
        if let Some(notify) = patch.notify {
            t.notify = notify;
        }
        if let Some(enabled) = patch.enabled {
            t.enabled = enabled;
        }
        t.updated_at = Utc::now();
        let updated = t.clone();
        self.persist(&tasks).await?;
        Ok(updated)
    }

    /// Records that `task_id` fired just now. Used by the scheduler loop so
    /// a restart does not re-fire a slot already processed.
    pub async fn mark_fired(&self, task_id: &str, at: chrono::DateTime<Utc>) -> Result<(), CronError> {
        let mut tasks = self.tasks.lock().await;
        if let Some(t) = tasks.iter_mut().find(|t| t.task_id == task_id) {
            t.last_fired_at = Some(at);
        }
        self.persist(&tasks).await
    }
}

#[allow(dead_code)]
fn _unused_path_accessor(s: &CronStore) -> &Path {
    &s.path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron-tasks.json");
        let store = CronStore::load(&path).await.unwrap();
        store
            .add("0 * * * * *".into(), "cron:t1".into(), "check inbox".into(), None)
            .await
            .unwrap();

        let reloaded = CronStore::load(&path).await.unwrap();
        let tasks = reloaded.list().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].session_key, "cron:t1");
    }

    #[tokio::test]
    async fn add_rejects_invalid_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::load(dir.path().join("tasks.json")).await.unwrap();
        let err = store
            .add("not a cron expr".into(), "cron:t1".into(), "x".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CronError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn remove_unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::load(dir.path().join("tasks.json")).await.unwrap();
        let err = store.remove("ghost").await.unwrap_err();
        assert!(matches!(err, CronError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_changes_only_patched_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::load(dir.path().join("tasks.json")).await.unwrap();
        let task = store
            .add("0 * * * * *".into(), "cron:t1".into(), "x".into(), None)
            .await
            .unwrap();

        let updated = store
            .update(
                &task.task_id,
                CronTaskPatch { enabled: Some(false), ..Default::default() },
            )
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.schedule, "0 * * * * *");
    }
}
