// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Error kinds classified at the Cron Service boundary.

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("cron task `{0}` not found")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage error: {0}")]
    Storage(String),
}
