// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `vargos-channels` — the Channel Service: a registry of
//! [`ChannelAdapter`]s behind the gateway's `channel.send` method, the
//! shared ingress pipeline (dedup, debounce, media) in front of every
//! adapter, outbound chunking, typing indicators, and reconnection policy.

pub mod adapter;
pub mod chunker;
pub mod cli_adapter;
pub mod debounce;
pub mod dedup;
pub mod heartbeat;
pub mod media;
pub mod reconnect;
pub mod service;
pub mod webhook_adapter;

pub use adapter::{ChannelAdapter, InboundMessage, InboundSink};
pub use chunker::chunk;
pub use cli_adapter::CliAdapter;
pub use debounce::Debouncer;
pub use dedup::DedupCache;
pub use heartbeat::{is_suppressed, strip_heartbeat_token};
pub use media::{MediaKind, NormalizedMedia};
pub use reconnect::{DisconnectCause, ReconnectDecision, Reconnector};
pub use service::{registration, ChannelsService};
pub use webhook_adapter::{WebhookAdapter, WebhookVerifyError};
