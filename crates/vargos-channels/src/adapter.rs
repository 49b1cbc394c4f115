// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`ChannelAdapter`] — the trait every channel implementation satisfies:
//! initialize/start/stop, outbound send and typing control, plus an inbound
//! callback invoked per message.

use async_trait::async_trait;

/// One inbound message as an adapter observed it, before the shared ingress
/// pipeline (filters, dedup, debounce, media path) has touched it.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Provider-assigned message id, used for deduplication.
    pub msg_id: String,
    /// Provider-assigned sender id within the channel.
    pub sender_id: String,
    /// `true` if this message was sent by the bot's own account.
    pub is_self: bool,
    /// `true` if this arrived in a group/non-private context.
    pub is_group: bool,
    pub text: Option<String>,
    /// `(mime_type, raw_bytes, caption)` when the message carries media.
    pub media: Option<(String, Vec<u8>, Option<String>)>,
}

/// Callback target an adapter invokes for every inbound message it accepts.
/// Implemented by [`crate::service::ChannelsService`]; split out as its own
/// trait so adapters don't need to depend on the gateway client directly.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn on_inbound(&self, channel: &str, message: InboundMessage);
}

/// A channel implementation: `initialize/start/stop/send/startTyping/
/// stopTyping` plus the inbound callback wired in at construction.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// The channel name this adapter answers to, e.g. `"cli"` or `"webhook"`.
    fn name(&self) -> &str;

    /// One-time setup (load credentials, validate configuration). Called
    /// once before `start`.
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Begin accepting inbound traffic and/or establish the provider
    /// connection.
    async fn start(&self) -> anyhow::Result<()>;

    /// Cancel all pending debouncers and reconnect timers, close the
    /// provider connection, clear typing intervals.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Deliver one already-chunked piece of text to `user_id`.
    async fn send(&self, user_id: &str, text: &str) -> anyhow::Result<()>;

    async fn start_typing(&self, user_id: &str) -> anyhow::Result<()> {
        let _ = user_id;
        Ok(())
    }

    async fn stop_typing(&self, user_id: &str) -> anyhow::Result<()> {
        let _ = user_id;
        Ok(())
    }
}
