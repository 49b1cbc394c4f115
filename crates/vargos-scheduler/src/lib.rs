// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `vargos-scheduler` — the Cron Service: schedule-driven
//! triggers emitted as `cron.trigger` events, over a JSON-file task store
//! that survives restarts.
//!
//! An optional *heartbeat* task can be registered at
//! boot from [`vargos_config::CronConfig`]: it fires on its own schedule
//! against a dedicated session, and a `HEARTBEAT_OK`-only reply is
//! suppressed by the Channel Service before delivery — the scheduler itself
//! has no opinion on the reply text.

pub mod error;
pub mod service;
pub mod store;
pub mod types;

pub use error::CronError;
pub use service::{registration, CronService};
pub use store::CronStore;
pub use types::{CronTask, CronTaskPatch};

use std::sync::Arc;

/// Ensure the configured heartbeat task exists in `store`, creating it if
/// absent. Idempotent across restarts — an existing heartbeat task (matched
/// by session key) is left untouched so `last_fired_at` survives.
pub async fn ensure_heartbeat_task(
    store: &Arc<CronStore>,
    config: &vargos_config::CronConfig,
) -> Result<(), CronError> {
    if !config.heartbeat_enabled {
        return Ok(());
    }
    let already_present = store
        .list()
        .await
        .iter()
        .any(|t| t.session_key == config.heartbeat_session_key);
    if already_present {
        return Ok(());
    }
    store
        .add(
            config.heartbeat_schedule.clone(),
            config.heartbeat_session_key.clone(),
            "Read pending items from the workspace heartbeat file and report anything \
             actionable. If there is nothing to report, reply with exactly HEARTBEAT_OK."
                .to_string(),
            None,
        )
        .await?;
    Ok(())
}
