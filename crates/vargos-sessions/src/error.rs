// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Error kinds classified at the Session Service boundary.

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session `{0}` already exists")]
    AlreadyExists(String),
    #[error("session `{0}` not found")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage error: {0}")]
    Storage(String),
}
