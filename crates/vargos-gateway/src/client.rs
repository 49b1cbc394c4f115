// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Service Client base.
//!
//! Every subsystem — Session Service, Tools Service, Agent Service, Channel
//! Service, Cron Service, the MCP bridge — wraps a [`GatewayClient`] and
//! implements [`ServiceHandler`] to answer the methods it registers and react
//! to the events it subscribes to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, warn};
use uuid::Uuid;

use crate::protocol::{ErrorKind, Frame, RpcError};
use crate::transport::Transport;

/// A service's self-description, sent as a `Register` frame on connect and
/// re-sent on every reconnect.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub service: String,
    pub version: String,
    pub methods: Vec<String>,
    pub events: Vec<String>,
    pub subscriptions: Vec<String>,
}

impl Registration {
    pub fn new(service: impl Into<String>, version: impl Into<String>) -> Self {
        Self { service: service.into(), version: version.into(), ..Default::default() }
    }

    pub fn methods(mut self, methods: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn events(mut self, events: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn subscriptions(mut self, subs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.subscriptions = subs.into_iter().map(Into::into).collect();
        self
    }
}

/// Implemented by every service client to answer inbound RPC methods and
/// react to subscribed events. Handler exceptions never crash the client:
/// `handle_method` failures become classified `Response.error`s, and
/// `handle_event` is fire-and-forget — its errors are logged only.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle_method(&self, method: &str, params: Value) -> Result<Value, RpcError>;

    async fn handle_event(&self, _name: &str, _payload: Value) {}
}

/// A no-op handler for service clients that only ever call out and never
/// answer inbound methods (e.g. a CLI one-shot invocation).
pub struct NullHandler;

#[async_trait]
impl ServiceHandler for NullHandler {
    async fn handle_method(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        Err(RpcError::new(ErrorKind::NotFound, format!("no handler for `{method}`")))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("client is shutting down")]
    Closed,
}

struct ClientState {
    pending_calls: Mutex<HashMap<String, oneshot::Sender<Result<Value, RpcError>>>>,
    outbound: mpsc::UnboundedSender<Frame>,
}

/// The running client connection. Call [`GatewayClient::connect`] to spawn
/// the I/O loop; use [`GatewayClient::call`] / [`GatewayClient::emit`] to
/// talk to the hub.
pub struct GatewayClient {
    state: Arc<ClientState>,
    registration: Registration,
}

impl GatewayClient {
    /// Connect `transport` to the hub, send `Register`, and spawn the
    /// dispatch loop. Returns once the initial registration has been
    /// acknowledged (or rejected).
    pub async fn connect(
        mut transport: Box<dyn Transport>,
        registration: Registration,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<Arc<Self>, ClientError> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let state = Arc::new(ClientState {
            pending_calls: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
        });

        transport
            .send(Frame::Register {
                service: registration.service.clone(),
                version: registration.version.clone(),
                methods: registration.methods.clone(),
                events: registration.events.clone(),
                subscriptions: registration.subscriptions.clone(),
            })
            .await
            .map_err(|_| ClientError::Closed)?;

        // Block until the hub acknowledges (or rejects) registration so
        // callers can fail fast on e.g. AlreadyExists method collisions.
        let ack = transport.recv().await.map_err(|_| ClientError::Closed)?;
        match ack {
            Some(Frame::Response { id, error: None, .. }) if id == "gateway.register" => {}
            Some(Frame::Response { error: Some(e), .. }) => return Err(e.into()),
            _ => return Err(ClientError::Closed),
        }

        let client = Arc::new(Self { state: state.clone(), registration });

        let dispatch_state = state.clone();
        let dispatch_handler = handler;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    inbound = transport.recv() => {
                        match inbound {
                            Ok(Some(frame)) => {
                                dispatch_inbound(frame, &dispatch_state, &dispatch_handler).await;
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(error = %e, "gateway client transport error");
                                break;
                            }
                        }
                    }
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(frame) => {
                                if transport.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            // Fail every in-flight call once the transport is gone.
            let mut pending = dispatch_state.pending_calls.lock().await;
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(RpcError::disconnected()));
            }
        });

        Ok(client)
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Call `method` on whichever service registered it, waiting up to
    /// `timeout` (default 300s) for a response.
    pub async fn call_raw(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.state.pending_calls.lock().await.insert(id.clone(), tx);

        let timeout_ms = timeout.map(|d| d.as_millis() as u64);
        self.state
            .outbound
            .send(Frame::Request { id: id.clone(), method: method.to_string(), params, timeout_ms })
            .map_err(|_| ClientError::Closed)?;

        match rx.await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                self.state.pending_calls.lock().await.remove(&id);
                Err(ClientError::Closed)
            }
        }
    }

    /// Typed convenience wrapper over [`call_raw`].
    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
        timeout: Option<Duration>,
    ) -> Result<R, ClientError> {
        let params = serde_json::to_value(params)?;
        let result = self.call_raw(method, params, timeout).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Publish an event to every subscriber. Never fails locally — delivery
    /// is the hub's responsibility (best-effort per subscriber).
    pub fn emit(&self, name: &str, payload: impl Serialize) {
        let payload = serde_json::to_value(payload).unwrap_or(Value::Null);
        let _ = self.state.outbound.send(Frame::Event { name: name.to_string(), payload });
    }
}

async fn dispatch_inbound(frame: Frame, state: &Arc<ClientState>, handler: &Arc<dyn ServiceHandler>) {
    match frame {
        Frame::Request { id, method, params, .. } => {
            let result = handler.handle_method(&method, params).await;
            let response = match result {
                Ok(v) => Frame::response_ok(id, v),
                Err(e) => Frame::response_err(id, e),
            };
            let _ = state.outbound.send(response);
        }
        Frame::Response { id, result, error } => {
            if let Some(tx) = state.pending_calls.lock().await.remove(&id) {
                let _ = tx.send(match error {
                    Some(e) => Err(e),
                    None => Ok(result.unwrap_or(Value::Null)),
                });
            }
        }
        Frame::Event { name, payload } => {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler.handle_event(&name, payload).await;
            });
        }
        Frame::Ping { nonce } => {
            let _ = state.outbound.send(Frame::Pong { nonce });
        }
        Frame::Pong { .. } | Frame::Register { .. } => {
            // Registration is handled once during connect(); a peer should
            // never re-send it mid-session.
            error!("unexpected frame after handshake");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::GatewayHub;
    use crate::transport::LoopbackTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler {
        event_count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ServiceHandler for EchoHandler {
        async fn handle_method(&self, method: &str, params: Value) -> Result<Value, RpcError> {
            if method == "echo.say" {
                Ok(params)
            } else {
                Err(RpcError::new(ErrorKind::NotFound, "no such method"))
            }
        }

        async fn handle_event(&self, _name: &str, _payload: Value) {
            self.event_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn connect_client(hub: &GatewayHub, reg: Registration, handler: Arc<dyn ServiceHandler>) -> Arc<GatewayClient> {
        let (hub_side, client_side) = LoopbackTransport::pair();
        let hub = hub.clone();
        tokio::spawn(async move { hub.accept(Box::new(hub_side)).await });
        GatewayClient::connect(Box::new(client_side), reg, handler).await.unwrap()
    }

    #[tokio::test]
    async fn call_reaches_handler_and_returns_result() {
        let hub = GatewayHub::new();
        let events = Arc::new(AtomicUsize::new(0));
        let echo = Arc::new(EchoHandler { event_count: events.clone() });
        let _server = connect_client(
            &hub,
            Registration::new("echo", "1").methods(["echo.say"]),
            echo,
        )
        .await;

        let caller = connect_client(&hub, Registration::new("caller", "1"), Arc::new(NullHandler)).await;

        let result: Value = caller
            .call("echo.say", json!({"text": "hi"}), None)
            .await
            .unwrap();
        assert_eq!(result["text"], "hi");
    }

    #[tokio::test]
    async fn call_to_unknown_method_yields_no_route() {
        let hub = GatewayHub::new();
        let caller = connect_client(&hub, Registration::new("caller", "1"), Arc::new(NullHandler)).await;
        let err = caller
            .call_raw("ghost.call", json!({}), None)
            .await
            .unwrap_err();
        match err {
            ClientError::Rpc(e) => assert_eq!(e.code, ErrorKind::NoRoute),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn emitted_event_reaches_subscriber_handler() {
        let hub = GatewayHub::new();
        let events = Arc::new(AtomicUsize::new(0));
        let subscriber = Arc::new(EchoHandler { event_count: events.clone() });
        let _sub_client = connect_client(
            &hub,
            Registration::new("agent", "1").subscriptions(["message.received"]),
            subscriber,
        )
        .await;

        let publisher = connect_client(&hub, Registration::new("channels", "1"), Arc::new(NullHandler)).await;
        publisher.emit("message.received", json!({"text": "hi"}));

        // Give the dispatch loop a tick to deliver + spawn the handler.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registering_colliding_method_fails_connect() {
        let hub = GatewayHub::new();
        let _first = connect_client(&hub, Registration::new("a", "1").methods(["dup.op"]), Arc::new(NullHandler)).await;

        let (hub_side, client_side) = LoopbackTransport::pair();
        let hub2 = hub.clone();
        tokio::spawn(async move { hub2.accept(Box::new(hub_side)).await });
        let err = GatewayClient::connect(
            Box::new(client_side),
            Registration::new("b", "1").methods(["dup.op"]),
            Arc::new(NullHandler),
        )
        .await
        .unwrap_err();
        match err {
            ClientError::Rpc(e) => assert_eq!(e.code, ErrorKind::AlreadyExists),
            other => panic!("unexpected {other:?}"),
        }
    }
}
