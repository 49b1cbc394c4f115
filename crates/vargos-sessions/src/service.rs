// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`SessionsService`] — wraps a [`SessionStore`] behind the gateway's
//! `session.*` methods and publishes `session.*` events.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use vargos_gateway::{ErrorKind, GatewayClient, Registration, RpcError, ServiceHandler};

use crate::error::SessionError;
use crate::store::{NewMessage, SessionPatch, SessionStore};
use crate::types::{Session, SessionKind};

fn kind_of(err: &SessionError) -> ErrorKind {
    match err {
        SessionError::AlreadyExists(_) => ErrorKind::AlreadyExists,
        SessionError::NotFound(_) => ErrorKind::NotFound,
        SessionError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        SessionError::Storage(_) => ErrorKind::Fatal,
    }
}

fn rpc_err(err: SessionError) -> RpcError {
    RpcError::new(kind_of(&err), err.to_string())
}

/// The Session Service's self-description, used when wiring it onto a
/// [`GatewayClient`] via [`vargos_gateway::connect_in_process`] or
/// [`vargos_gateway::connect_ws`].
pub fn registration() -> Registration {
    Registration::new("sessions", "1")
        .methods([
            "session.create",
            "session.get",
            "session.update",
            "session.delete",
            "session.list",
            "session.addMessage",
            "session.getMessages",
        ])
        .events(["session.created", "session.updated", "session.deleted", "session.message"])
}

/// Gateway-facing wrapper over a [`SessionStore`]. `session.*` events are
/// published through the [`GatewayClient`] handed to [`SessionsService::attach_client`]
/// — until attached, mutating methods still succeed but no event fires (the
/// in-process construction order requires the client before it can register,
/// so this is only ever observed transiently during boot).
pub struct SessionsService {
    store: Arc<dyn SessionStore>,
    client: tokio::sync::OnceCell<Arc<GatewayClient>>,
}

impl SessionsService {
    pub fn new(store: Arc<dyn SessionStore>) -> Arc<Self> {
        Arc::new(Self { store, client: tokio::sync::OnceCell::new() })
    }

    /// Supply the connected client once it exists, so handlers can `emit`.
    /// Gateway client construction takes this handler by `Arc<dyn ServiceHandler>`
    /// before the client itself exists, so this is set right after connect.
    pub fn attach_client(&self, client: Arc<GatewayClient>) {
        let _ = self.client.set(client);
    }

    fn emit(&self, name: &str, payload: Value) {
        if let Some(client) = self.client.get() {
            client.emit(name, payload);
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }
}

#[derive(Deserialize)]
struct CreateParams {
    #[serde(rename = "sessionKey")]
    session_key: String,
    kind: SessionKind,
    label: Option<String>,
    #[serde(rename = "agentId")]
    agent_id: Option<String>,
    #[serde(default)]
    metadata: Value,
}

#[derive(Deserialize)]
struct KeyParams {
    #[serde(rename = "sessionKey")]
    session_key: String,
}

#[derive(Deserialize)]
struct UpdateParams {
    #[serde(rename = "sessionKey")]
    session_key: String,
    label: Option<Option<String>>,
    #[serde(rename = "agentId")]
    agent_id: Option<Option<String>>,
    metadata: Option<Value>,
}

#[derive(Deserialize, Default)]
struct ListParams {
    kind: Option<SessionKind>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct AddMessageParams {
    #[serde(rename = "sessionKey")]
    session_key: String,
    role: vargos_model::Role,
    content: vargos_model::MessageContent,
    metadata: Option<Value>,
}

#[derive(Deserialize, Default)]
struct GetMessagesParams {
    #[serde(rename = "sessionKey")]
    session_key: String,
    limit: Option<usize>,
    before: Option<DateTime<Utc>>,
}

#[async_trait]
impl ServiceHandler for SessionsService {
    async fn handle_method(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "session.create" => {
                let p: CreateParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                let mut session = Session::new(p.session_key, p.kind);
                session.label = p.label;
                session.agent_id = p.agent_id;
                if !p.metadata.is_null() {
                    session.metadata = p.metadata;
                }
                let created = self.store.create(session).await.map_err(rpc_err)?;
                self.emit("session.created", json!(created));
                Ok(json!(created))
            }
            "session.get" => {
                let p: KeyParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                let session = self.store.get(&p.session_key).await.map_err(rpc_err)?;
                Ok(json!(session))
            }
            "session.update" => {
                let p: UpdateParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                let patch = SessionPatch { label: p.label, agent_id: p.agent_id, metadata: p.metadata };
                let updated = self.store.update(&p.session_key, patch).await.map_err(rpc_err)?;
                self.emit("session.updated", json!(updated));
                Ok(json!(updated))
            }
            "session.delete" => {
                let p: KeyParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                self.store.delete(&p.session_key).await.map_err(rpc_err)?;
                self.emit("session.deleted", json!({"sessionKey": p.session_key}));
                Ok(Value::Null)
            }
            "session.list" => {
                let p: ListParams = if params.is_null() {
                    ListParams::default()
                } else {
                    serde_json::from_value(params)
                        .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?
                };
                let sessions = self.store.list(p.kind, p.limit).await.map_err(rpc_err)?;
                Ok(json!(sessions))
            }
            "session.addMessage" => {
                let p: AddMessageParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                let input = NewMessage { role: p.role, content: p.content, metadata: p.metadata };
                let message = self.store.add_message(&p.session_key, input).await.map_err(rpc_err)?;
                self.emit("session.message", json!(message));
                Ok(json!(message))
            }
            "session.getMessages" => {
                let p: GetMessagesParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                let messages = self
                    .store
                    .get_messages(&p.session_key, p.limit, p.before)
                    .await
                    .map_err(rpc_err)?;
                Ok(json!(messages))
            }
            other => Err(RpcError::no_route(other)),
        }
    }

    async fn handle_event(&self, name: &str, _payload: Value) {
        warn!(name, "sessions service does not subscribe to any events — ignoring");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_store::FileSessionStore;
    use vargos_gateway::{connect_in_process, GatewayHub, NullHandler};

    async fn service_on_hub() -> (GatewayHub, Arc<GatewayClient>) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(dir.path()));
        let service = SessionsService::new(store);
        let hub = GatewayHub::new();
        let client = connect_in_process(&hub, registration(), service.clone()).await.unwrap();
        service.attach_client(client.clone());
        std::mem::forget(dir); // keep tempdir alive for the test's duration
        (hub, client)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (hub, sessions) = service_on_hub().await;
        let caller = connect_in_process(&hub, Registration::new("caller", "1"), Arc::new(NullHandler))
            .await
            .unwrap();

        let created: Session = caller
            .call("session.create", json!({"sessionKey": "cli:1", "kind": "main"}), None)
            .await
            .unwrap();
        assert_eq!(created.session_key, "cli:1");

        let fetched: Option<Session> =
            caller.call("session.get", json!({"sessionKey": "cli:1"}), None).await.unwrap();
        assert_eq!(fetched.unwrap().session_key, "cli:1");
        let _ = sessions;
    }

    #[tokio::test]
    async fn create_duplicate_fails_already_exists() {
        let (hub, _sessions) = service_on_hub().await;
        let caller = connect_in_process(&hub, Registration::new("caller", "1"), Arc::new(NullHandler))
            .await
            .unwrap();
        let _: Session = caller
            .call("session.create", json!({"sessionKey": "cli:1", "kind": "main"}), None)
            .await
            .unwrap();
        let err = caller
            .call_raw("session.create", json!({"sessionKey": "cli:1", "kind": "main"}), None)
            .await
            .unwrap_err();
        match err {
            vargos_gateway::ClientError::Rpc(e) => assert_eq!(e.code, ErrorKind::AlreadyExists),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn add_message_to_missing_session_fails_not_found() {
        let (hub, _sessions) = service_on_hub().await;
        let caller = connect_in_process(&hub, Registration::new("caller", "1"), Arc::new(NullHandler))
            .await
            .unwrap();
        let err = caller
            .call_raw(
                "session.addMessage",
                json!({"sessionKey": "cli:ghost", "role": "user", "content": "hi"}),
                None,
            )
            .await
            .unwrap_err();
        match err {
            vargos_gateway::ClientError::Rpc(e) => assert_eq!(e.code, ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn add_message_emits_session_message_event() {
        let (hub, _sessions) = service_on_hub().await;
        let caller = connect_in_process(&hub, Registration::new("caller", "1"), Arc::new(NullHandler))
            .await
            .unwrap();
        let _: Session = caller
            .call("session.create", json!({"sessionKey": "cli:1", "kind": "main"}), None)
            .await
            .unwrap();

        use std::sync::atomic::{AtomicUsize, Ordering};
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
        let count = Arc::new(AtomicUsize::new(0));
        let _subscriber = connect_in_process(
            &hub,
            Registration::new("watcher", "1").subscriptions(["session.message"]),
            Arc::new(Counter(count.clone())),
        )
        .await
        .unwrap();

        let _: vargos_model::Role = vargos_model::Role::User; // keep import used
        let _: Value = caller
            .call(
                "session.addMessage",
                json!({"sessionKey": "cli:1", "role": "user", "content": "hi"}),
                None,
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
