// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`ChannelsService`] — wraps a registry of [`ChannelAdapter`]s behind the
//! gateway's `channel.send` method, runs the shared ingress pipeline in
//! front of every adapter, and manages the typing-indicator re-assert loop
//! by subscribing to `run.started`/`run.completed`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;
use vargos_config::ChannelsConfig;
use vargos_gateway::{ErrorKind, GatewayClient, Registration, RpcError, ServiceHandler};

use crate::adapter::{ChannelAdapter, InboundMessage, InboundSink};
use crate::chunker;
use crate::debounce::Debouncer;
use crate::dedup::DedupCache;
use crate::heartbeat::strip_heartbeat_token;
use crate::media;

/// The Channel Service's self-description.
pub fn registration() -> Registration {
    Registration::new("channels", "1")
        .methods(["channel.send"])
        .events(["message.received"])
        .subscriptions(["run.started", "run.completed"])
}

struct TypingState {
    channel: String,
    user_id: String,
    handle: JoinHandle<()>,
}

/// Gateway-facing wrapper over a set of [`ChannelAdapter`]s.
pub struct ChannelsService {
    adapters: Mutex<HashMap<String, Arc<dyn ChannelAdapter>>>,
    dedup: DedupCache,
    debouncer: Mutex<Option<Arc<Debouncer>>>,
    typing: Mutex<HashMap<String, TypingState>>,
    client: tokio::sync::OnceCell<Arc<GatewayClient>>,
    config: ChannelsConfig,
    data_dir: PathBuf,
}

impl ChannelsService {
    pub fn new(config: ChannelsConfig, data_dir: PathBuf) -> Arc<Self> {
        let dedup = DedupCache::new(Duration::from_millis(config.dedup_ttl_ms));
        Arc::new(Self {
            adapters: Mutex::new(HashMap::new()),
            dedup,
            debouncer: Mutex::new(None),
            typing: Mutex::new(HashMap::new()),
            client: tokio::sync::OnceCell::new(),
            config,
            data_dir,
        })
    }

    pub fn attach_client(self: &Arc<Self>, client: Arc<GatewayClient>) {
        let _ = self.client.set(client);
        let this = self.clone();
        let debounce_delay = Duration::from_millis(this.config.debounce_ms);
        let debouncer = Debouncer::new(debounce_delay, move |key, text| {
            let this = this.clone();
            tokio::spawn(async move {
                let Some((channel, sender)) = key.split_once('\u{1}') else { return };
                this.ingest_text(channel, sender, text).await;
            });
        });
        // Can only be set once `attach_client` has run; safe to overwrite a
        // prior `None` set at construction.
        if let Ok(mut slot) = self.debouncer.try_lock() {
            *slot = Some(debouncer);
        }
    }

    /// Register an adapter under its own [`ChannelAdapter::name`]. Callers
    /// (`vargos`'s wiring code) own starting/stopping each adapter.
    pub async fn register_adapter(&self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.lock().await.insert(adapter.name().to_string(), adapter);
    }

    async fn adapter(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.lock().await.get(channel).cloned()
    }

    fn allowed(&self, channel: &str, sender_id: &str) -> bool {
        match self.config.allowlist.get(channel) {
            Some(list) if !list.is_empty() => list.iter().any(|id| id == sender_id),
            _ => true,
        }
    }

    async fn ingest_text(&self, channel: &str, sender_id: &str, text: String) {
        let Some(client) = self.client.get() else {
            warn!(channel, "channels service not yet attached to a gateway client");
            return;
        };
        let session_key = format!("{channel}:{sender_id}");
        // Idempotent: session may already exist from a prior message.
        let _ = client
            .call::<_, Value>("session.create", json!({ "sessionKey": session_key, "kind": "main" }), None)
            .await;
        let appended = client
            .call::<_, Value>(
                "session.addMessage",
                json!({ "sessionKey": session_key, "role": "user", "content": text }),
                None,
            )
            .await;
        if let Err(err) = appended {
            warn!(session_key, error = %err, "failed to append inbound channel message");
            return;
        }
        client.emit("message.received", json!({ "sessionKey": session_key, "content": text }));
    }

    async fn ingest_media(
        &self,
        channel: &str,
        sender_id: &str,
        mime_type: &str,
        bytes: &[u8],
        caption: Option<String>,
    ) {
        let Some(client) = self.client.get() else {
            warn!(channel, "channels service not yet attached to a gateway client");
            return;
        };
        let session_key = format!("{channel}:{sender_id}");
        let saved = match media::save_media(&self.data_dir, &session_key, mime_type, bytes, caption.clone()) {
            Ok(m) => m,
            Err(err) => {
                warn!(session_key, error = %err, "failed to save inbound media");
                return;
            }
        };

        // No transform profile is wired up yet ("configured
        // transform" is an external model profile this build doesn't carry
        // a config surface for); images forward raw, everything else falls
        // back to a text descriptor.
        let disposition = media::decide_disposition(&saved, false, true);
        let (content, images) = match disposition {
            media::MediaDisposition::ForwardToVision => {
                let data_url = format!(
                    "data:{};base64,{}",
                    saved.mime_type,
                    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &saved.content)
                );
                (caption.unwrap_or_default(), vec![data_url])
            }
            media::MediaDisposition::TextFallback(descriptor) => (descriptor, Vec::new()),
            media::MediaDisposition::Transform => (caption.unwrap_or_default(), Vec::new()),
        };

        let _ = client
            .call::<_, Value>("session.create", json!({ "sessionKey": session_key, "kind": "main" }), None)
            .await;
        let appended = client
            .call::<_, Value>(
                "session.addMessage",
                json!({ "sessionKey": session_key, "role": "user", "content": content }),
                None,
            )
            .await;
        if let Err(err) = appended {
            warn!(session_key, error = %err, "failed to append inbound media message");
            return;
        }
        client.emit(
            "message.received",
            json!({ "sessionKey": session_key, "content": content, "images": images }),
        );
    }

    async fn start_typing_loop(&self, run_id: &str, channel: &str, user_id: &str) {
        let Some(adapter) = self.adapter(channel).await else { return };
        let _ = adapter.start_typing(user_id).await;

        let adapter2 = adapter.clone();
        let user_id2 = user_id.to_string();
        let interval = Duration::from_secs(self.config.typing_reassert_secs);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if adapter2.start_typing(&user_id2).await.is_err() {
                    break;
                }
            }
        });

        self.typing.lock().await.insert(
            run_id.to_string(),
            TypingState { channel: channel.to_string(), user_id: user_id.to_string(), handle },
        );
    }

    async fn stop_typing_loop(&self, run_id: &str) {
        let Some(state) = self.typing.lock().await.remove(run_id) else { return };
        state.handle.abort();
        if let Some(adapter) = self.adapter(&state.channel).await {
            let _ = adapter.stop_typing(&state.user_id).await;
        }
    }

    /// Derive `(channel, userId)` from a session key, or `None` for roots
    /// the Channel Service has no adapter for (`cli:`, `cron:`, sub-agents).
    fn channel_target(session_key: &str) -> Option<(&str, &str)> {
        if vargos_sessions::is_subagent_key(session_key)
            || session_key.starts_with("cli:")
            || session_key.starts_with("cron:")
        {
            return None;
        }
        session_key.split_once(':')
    }
}

#[async_trait]
impl InboundSink for ChannelsService {
    async fn on_inbound(&self, channel: &str, message: InboundMessage) {
        // Rule 1: drop self-sent and group/non-private messages.
        if message.is_self || message.is_group {
            return;
        }
        // Rule 2: allowlist.
        if !self.allowed(channel, &message.sender_id) {
            return;
        }
        // Rule 3: nothing to process.
        if message.text.is_none() && message.media.is_none() {
            return;
        }
        // Rule 4: dedup by provider message id.
        if !self.dedup.insert(&message.msg_id) {
            return;
        }
        // Rule 5: media bypasses the debouncer.
        if let Some((mime_type, bytes, caption)) = message.media {
            self.ingest_media(channel, &message.sender_id, &mime_type, &bytes, caption).await;
            return;
        }
        // Rule 6: text goes through the debouncer.
        if let Some(text) = message.text {
            let debouncer = self.debouncer.lock().await.clone();
            if let Some(debouncer) = debouncer {
                let key = format!("{channel}\u{1}{}", message.sender_id);
                debouncer.push(&key, &text);
            } else {
                // Not yet attached to a gateway client (construction race);
                // fall straight through rather than drop the message.
                self.ingest_text(channel, &message.sender_id, text).await;
            }
        }
    }
}

#[derive(Deserialize)]
struct SendParams {
    channel: String,
    #[serde(rename = "userId")]
    user_id: String,
    text: String,
}

#[async_trait]
impl ServiceHandler for ChannelsService {
    async fn handle_method(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "channel.send" => {
                let p: SendParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                let stripped = strip_heartbeat_token(&p.text);
                if stripped.is_empty() {
                    return Ok(json!({ "delivered": false }));
                }
                let adapter = self
                    .adapter(&p.channel)
                    .await
                    .ok_or_else(|| RpcError::new(ErrorKind::NotFound, format!("no adapter registered for channel `{}`", p.channel)))?;

                let chunks = chunker::chunk(&stripped, self.config.chunk_max_chars);
                for chunk in &chunks {
                    adapter
                        .send(&p.user_id, chunk)
                        .await
                        .map_err(|e| RpcError::new(ErrorKind::ProviderFailure, e.to_string()))?;
                }
                Ok(json!({ "delivered": true, "chunks": chunks.len() }))
            }
            other => Err(RpcError::no_route(other)),
        }
    }

    async fn handle_event(&self, name: &str, payload: Value) {
        match name {
            "run.started" => {
                let Some(session_key) = payload.get("sessionKey").and_then(|v| v.as_str()) else { return };
                let Some(run_id) = payload.get("runId").and_then(|v| v.as_str()) else { return };
                let Some((channel, user_id)) = Self::channel_target(session_key) else { return };
                self.start_typing_loop(run_id, channel, user_id).await;
            }
            "run.completed" => {
                let Some(run_id) = payload.get("runId").and_then(|v| v.as_str()) else { return };
                self.stop_typing_loop(run_id).await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ChannelAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vargos_gateway::{connect_in_process, GatewayHub, NullHandler};

    struct RecordingAdapter {
        name: String,
        sent: Arc<std::sync::Mutex<Vec<(String, String)>>>,
        typing_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        fn name(&self) -> &str {
            &self.name
        }
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send(&self, user_id: &str, text: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((user_id.to_string(), text.to_string()));
            Ok(())
        }
        async fn start_typing(&self, _user_id: &str) -> anyhow::Result<()> {
            self.typing_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn service_on_hub() -> (GatewayHub, Arc<ChannelsService>, Arc<std::sync::Mutex<Vec<(String, String)>>>) {
        let hub = GatewayHub::new();
        let tmp = tempfile::tempdir().unwrap();
        let service = ChannelsService::new(ChannelsConfig::default(), tmp.path().to_path_buf());
        let client = connect_in_process(&hub, registration(), service.clone()).await.unwrap();
        service.attach_client(client);

        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let adapter = Arc::new(RecordingAdapter {
            name: "cli".to_string(),
            sent: sent.clone(),
            typing_calls: Arc::new(AtomicUsize::new(0)),
        });
        service.register_adapter(adapter).await;
        std::mem::forget(tmp);
        (hub, service, sent)
    }

    #[tokio::test]
    async fn send_strips_heartbeat_and_chunks_then_delivers() {
        let (hub, service, sent) = service_on_hub().await;
        let caller = connect_in_process(&hub, Registration::new("caller", "1"), Arc::new(NullHandler)).await.unwrap();

        let result: Value = caller
            .call("channel.send", json!({ "channel": "cli", "userId": "u1", "text": "hello there" }), None)
            .await
            .unwrap();
        assert_eq!(result["delivered"], json!(true));
        assert_eq!(sent.lock().unwrap().as_slice(), &[("u1".to_string(), "hello there".to_string())]);
        let _ = service;
    }

    #[tokio::test]
    async fn send_of_bare_heartbeat_token_delivers_nothing() {
        let (hub, _service, sent) = service_on_hub().await;
        let caller = connect_in_process(&hub, Registration::new("caller", "1"), Arc::new(NullHandler)).await.unwrap();

        let result: Value = caller
            .call("channel.send", json!({ "channel": "cli", "userId": "u1", "text": "HEARTBEAT_OK" }), None)
            .await
            .unwrap();
        assert_eq!(result["delivered"], json!(false));
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_to_unknown_channel_is_not_found() {
        let (hub, _service, _sent) = service_on_hub().await;
        let caller = connect_in_process(&hub, Registration::new("caller", "1"), Arc::new(NullHandler)).await.unwrap();

        let err = caller
            .call_raw("channel.send", json!({ "channel": "ghost", "userId": "u1", "text": "hi" }), None)
            .await
            .unwrap_err();
        match err {
            vargos_gateway::ClientError::Rpc(e) => assert_eq!(e.code, ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_burst_produces_one_message_received_event() {
        let (hub, service, _sent) = service_on_hub().await;

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        struct Counter(Arc<AtomicUsize>);
        #[async_trait]
        impl ServiceHandler for Counter {
            async fn handle_method(&self, m: &str, _p: Value) -> Result<Value, RpcError> {
                Err(RpcError::no_route(m))
            }
            async fn handle_event(&self, _name: &str, _payload: Value) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let _subscriber = connect_in_process(
            &hub,
            Registration::new("watcher", "1").subscriptions(["message.received"]),
            Arc::new(Counter(count2)),
        )
        .await
        .unwrap();

        service
            .on_inbound(
                "cli",
                InboundMessage {
                    msg_id: "m1".to_string(),
                    sender_id: "u1".to_string(),
                    is_self: false,
                    is_group: false,
                    text: Some("hello".to_string()),
                    media: None,
                },
            )
            .await;
        service
            .on_inbound(
                "cli",
                InboundMessage {
                    msg_id: "m2".to_string(),
                    sender_id: "u1".to_string(),
                    is_self: false,
                    is_group: false,
                    text: Some("world".to_string()),
                    media: None,
                },
            )
            .await;

        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_message_id_is_dropped() {
        let (_hub, service, _sent) = service_on_hub().await;
        assert!(service.dedup.insert("m1"));
        assert!(!service.dedup.insert("m1"));
    }
}
