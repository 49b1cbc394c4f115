// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`WebhookAdapter`] — a generic HMAC-verified HTTP webhook channel,
//! provider-agnostic: the signature scheme
//! (`HMAC-SHA256(secret, "v0:" + timestamp + ":" + body)`, constant-time
//! comparison, 5-minute replay window) matches the shape most chat-platform
//! webhook signing schemes use.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adapter::{ChannelAdapter, InboundMessage, InboundSink};

/// Requests older than this (by their `X-Webhook-Timestamp` header) are
/// rejected as replays.
const REPLAY_WINDOW_SECS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum WebhookVerifyError {
    #[error("missing or invalid timestamp")]
    InvalidTimestamp,
    #[error("request timestamp is too old (replay protection)")]
    StaleTimestamp,
    #[error("HMAC signature does not match")]
    InvalidSignature,
    #[error("internal HMAC error")]
    Internal,
}

/// Verify an inbound webhook signature.
///
/// Computes `HMAC-SHA256(signing_secret, "v0:" + timestamp + ":" + body)`
/// and compares it against `provided_sig` (expected form `v0=<hex>`) in
/// constant time. Rejects timestamps more than five minutes old.
pub fn verify_signature(
    signing_secret: &[u8],
    timestamp: &str,
    body: &[u8],
    provided_sig: &str,
) -> Result<(), WebhookVerifyError> {
    let ts: i64 = timestamp.parse().map_err(|_| WebhookVerifyError::InvalidTimestamp)?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    if (now - ts).unsigned_abs() as i64 > REPLAY_WINDOW_SECS {
        return Err(WebhookVerifyError::StaleTimestamp);
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(signing_secret).map_err(|_| WebhookVerifyError::Internal)?;
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    let expected = format!("v0={}", hex::encode(mac.finalize().into_bytes()));

    if expected.as_bytes().ct_eq(provided_sig.as_bytes()).unwrap_u8() != 1 {
        return Err(WebhookVerifyError::InvalidSignature);
    }
    Ok(())
}

/// Configuration for one [`WebhookAdapter`] instance.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub channel_name: String,
    pub signing_secret: Vec<u8>,
    pub bind_addr: SocketAddr,
    pub webhook_path: String,
    /// Where outbound replies are POSTed, e.g. a provider's "send message" endpoint.
    pub deliver_url: String,
}

#[derive(Clone)]
struct WebhookState {
    signing_secret: Arc<Vec<u8>>,
    sink: Arc<dyn InboundSink>,
    channel_name: Arc<str>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(rename = "msgId")]
    msg_id: String,
    #[serde(rename = "senderId")]
    sender_id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "isSelf")]
    is_self: bool,
    #[serde(default, rename = "isGroup")]
    is_group: bool,
    #[serde(default, rename = "mimeType")]
    mime_type: Option<String>,
    #[serde(default, rename = "mediaBase64")]
    media_base64: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

async fn webhook_handler(State(state): State<WebhookState>, headers: HeaderMap, body: Bytes) -> Response {
    let timestamp = headers.get("x-webhook-timestamp").and_then(|v| v.to_str().ok()).unwrap_or("");
    let provided_sig = headers.get("x-webhook-signature").and_then(|v| v.to_str().ok()).unwrap_or("");

    if let Err(e) = verify_signature(&state.signing_secret, timestamp, &body, provided_sig) {
        warn!(error = %e, "webhook signature verification failed");
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "failed to parse webhook payload");
            return (StatusCode::BAD_REQUEST, "invalid JSON").into_response();
        }
    };

    let media = match (payload.mime_type, payload.media_base64) {
        (Some(mime), Some(b64)) => match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64) {
            Ok(bytes) => Some((mime, bytes, payload.caption.clone())),
            Err(e) => {
                warn!(error = %e, "failed to decode webhook media payload");
                None
            }
        },
        _ => None,
    };

    debug!(sender = %payload.sender_id, "webhook adapter: inbound message");
    state
        .sink
        .on_inbound(
            &state.channel_name,
            InboundMessage {
                msg_id: payload.msg_id,
                sender_id: payload.sender_id,
                is_self: payload.is_self,
                is_group: payload.is_group,
                text: payload.text,
                media,
            },
        )
        .await;

    StatusCode::OK.into_response()
}

fn router(state: WebhookState, path: &str) -> Router {
    Router::new().route(path, post(webhook_handler)).with_state(state)
}

pub struct WebhookAdapter {
    config: WebhookConfig,
    sink: Arc<dyn InboundSink>,
    http: reqwest::Client,
    server_task: Mutex<Option<JoinHandle<()>>>,
}

impl WebhookAdapter {
    pub fn new(config: WebhookConfig, sink: Arc<dyn InboundSink>) -> Self {
        Self { config, sink, http: reqwest::Client::new(), server_task: Mutex::new(None) }
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn name(&self) -> &str {
        &self.config.channel_name
    }

    async fn start(&self) -> anyhow::Result<()> {
        let state = WebhookState {
            signing_secret: Arc::new(self.config.signing_secret.clone()),
            sink: self.sink.clone(),
            channel_name: Arc::from(self.config.channel_name.as_str()),
        };
        let app = router(state, &self.config.webhook_path);
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!(error = %err, "webhook adapter server stopped with error");
            }
        });
        *self.server_task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.server_task.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    async fn send(&self, user_id: &str, text: &str) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(&self.config.deliver_url)
            .json(&serde_json::json!({ "userId": user_id, "text": text }))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("webhook delivery failed: HTTP {}", resp.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-signing-secret";

    fn make_valid_sig(secret: &[u8], timestamp: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(b"v0:");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn recent_ts() -> String {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs().to_string()
    }

    #[test]
    fn valid_signature_is_accepted() {
        let ts = recent_ts();
        let body = b"test body";
        let sig = make_valid_sig(SECRET, &ts, body);
        assert!(verify_signature(SECRET, &ts, body, &sig).is_ok());
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let ts = recent_ts();
        let body = b"test body";
        let sig = make_valid_sig(SECRET, &ts, body);
        let wrong_sig = sig.replace('a', "b");
        assert!(verify_signature(SECRET, &ts, body, &wrong_sig).is_err());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let old_ts = (SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() - 400).to_string();
        let body = b"body";
        let sig = make_valid_sig(SECRET, &old_ts, body);
        assert!(matches!(verify_signature(SECRET, &old_ts, body, &sig), Err(WebhookVerifyError::StaleTimestamp)));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let ts = recent_ts();
        let sig = make_valid_sig(SECRET, &ts, b"original");
        assert!(verify_signature(SECRET, &ts, b"tampered", &sig).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let ts = recent_ts();
        let body = b"body";
        let sig = make_valid_sig(b"correct-secret", &ts, body);
        assert!(verify_signature(b"wrong-secret", &ts, body, &sig).is_err());
    }
}
