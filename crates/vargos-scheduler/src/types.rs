// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`CronTask`] — a persisted schedule-driven trigger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single scheduled task. `schedule` is a standard 5- or 6-field cron
/// expression understood by the `cron` crate. `session_key` is typically
/// `cron:<taskId>` (matching the `cron:` session-key root) but callers may
/// point a task at any session root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronTask {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub schedule: String,
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    /// The instruction text delivered as `cron.trigger.task`.
    pub task: String,
    /// Optional delivery targets (e.g. channel user ids to notify in
    /// addition to the session's own reply path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<Vec<String>>,
    #[serde(default = "CronTask::default_enabled")]
    pub enabled: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    /// The last instant this task actually fired, used to avoid re-firing a
    /// slot the scheduler already processed across a restart.
    #[serde(default, rename = "lastFiredAt", skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl CronTask {
    fn default_enabled() -> bool {
        true
    }
}

/// Patch applied by `cron.update`. Only `Some` fields are changed.
#[derive(Debug, Default, Deserialize)]
pub struct CronTaskPatch {
    pub schedule: Option<String>,
    #[serde(rename = "sessionKey")]
    pub session_key: Option<String>,
    pub task: Option<String>,
    pub notify: Option<Option<Vec<String>>>,
    pub enabled: Option<bool>,
}
