// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Gateway Hub — service registry, method router, event bus, and
//! request-timeout manager.
//!
//! One [`GatewayHub`] lives per process. Every service client — whether it
//! runs in-process over a [`crate::transport::LoopbackTransport`] or in a
//! separate process over a [`crate::transport::WsTransport`] — connects to
//! it by spawning [`GatewayHub::accept`] against its transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{ErrorKind, Frame, RpcError, DEFAULT_TIMEOUT_MS};
use crate::transport::Transport;

pub type ConnId = u64;

/// How many missed pings before a connection is considered dead.
pub const MAX_MISSED_PINGS: u32 = 3;
pub const PING_INTERVAL: Duration = Duration::from_secs(20);

struct ConnState {
    service: Option<String>,
    methods: Vec<String>,
    events: Vec<String>,
    subscriptions: Vec<String>,
    outbound: mpsc::UnboundedSender<Frame>,
}

struct PendingRequest {
    /// Connection id of the original caller.
    origin_conn: ConnId,
    /// Request id as issued by the original caller — translated back on response.
    origin_id: String,
    deadline: Instant,
}

#[derive(Default)]
struct HubState {
    next_conn_id: std::sync::atomic::AtomicU64,
    connections: Mutex<HashMap<ConnId, ConnState>>,
    /// method name -> owning connection
    methods: Mutex<HashMap<String, ConnId>>,
    /// event name -> subscriber connections
    subscriptions: Mutex<HashMap<String, Vec<ConnId>>>,
    /// hub-issued correlation id -> pending caller bookkeeping
    pending: Mutex<HashMap<String, PendingRequest>>,
}

/// Handle to the running hub. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct GatewayHub {
    state: Arc<HubState>,
}

impl Default for GatewayHub {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayHub {
    pub fn new() -> Self {
        let hub = Self { state: Arc::new(HubState::default()) };
        hub.spawn_timeout_reaper();
        hub
    }

    fn spawn_timeout_reaper(&self) {
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(250));
            loop {
                tick.tick().await;
                let now = Instant::now();
                let mut expired = Vec::new();
                {
                    let mut pending = state.pending.lock().await;
                    let keys: Vec<String> = pending
                        .iter()
                        .filter(|(_, p)| p.deadline <= now)
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in keys {
                        if let Some(p) = pending.remove(&k) {
                            expired.push(p);
                        }
                    }
                }
                for p in expired {
                    let conns = state.connections.lock().await;
                    if let Some(conn) = conns.get(&p.origin_conn) {
                        let _ = conn
                            .outbound
                            .send(Frame::response_err(p.origin_id, RpcError::timeout()));
                    }
                }
            }
        });
    }

    /// Accept a new connection over `transport`, running until the peer
    /// disconnects. Call this once per connecting service client — typically
    /// spawned onto its own task.
    pub async fn accept(&self, mut transport: Box<dyn Transport>) {
        let conn_id = self
            .state
            .next_conn_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

        self.state.connections.lock().await.insert(
            conn_id,
            ConnState {
                service: None,
                methods: Vec::new(),
                events: Vec::new(),
                subscriptions: Vec::new(),
                outbound: outbound_tx,
            },
        );

        loop {
            tokio::select! {
                inbound = transport.recv() => {
                    match inbound {
                        Ok(Some(frame)) => {
                            if !self.handle_inbound(conn_id, frame).await {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(conn_id, error = %e, "transport error, closing connection");
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

        self.unregister(conn_id).await;
    }

    async fn unregister(&self, conn_id: ConnId) {
        let removed = self.state.connections.lock().await.remove(&conn_id);
        let Some(conn) = removed else { return };

        {
            let mut methods = self.state.methods.lock().await;
            methods.retain(|_, owner| *owner != conn_id);
        }
        {
            let mut subs = self.state.subscriptions.lock().await;
            for subscribers in subs.values_mut() {
                subscribers.retain(|c| *c != conn_id);
            }
        }
        // Reject any pending requests this connection originated.
        let mut pending = self.state.pending.lock().await;
        pending.retain(|_, p| p.origin_conn != conn_id);

        if let Some(service) = conn.service {
            info!(service, conn_id, "service client disconnected");
        }
    }

    /// Returns `false` if the connection should be closed.
    async fn handle_inbound(&self, conn_id: ConnId, frame: Frame) -> bool {
        match frame {
            Frame::Register { service, version, methods, events, subscriptions } => {
                self.handle_register(conn_id, service, version, methods, events, subscriptions)
                    .await;
            }
            Frame::Request { id, method, params, timeout_ms } => {
                self.handle_request(conn_id, id, method, params, timeout_ms).await;
            }
            Frame::Response { id, result, error } => {
                self.handle_response(id, result, error).await;
            }
            Frame::Event { name, payload } => {
                self.handle_event(name, payload).await;
            }
            Frame::Pong { .. } => {}
            Frame::Ping { nonce } => {
                let conns = self.state.connections.lock().await;
                if let Some(conn) = conns.get(&conn_id) {
                    let _ = conn.outbound.send(Frame::Pong { nonce });
                }
            }
        }
        true
    }

    async fn handle_register(
        &self,
        conn_id: ConnId,
        service: String,
        version: String,
        methods: Vec<String>,
        events: Vec<String>,
        subscriptions: Vec<String>,
    ) {
        // Reject methods already claimed by another live connection.
        {
            let method_table = self.state.methods.lock().await;
            for m in &methods {
                if let Some(owner) = method_table.get(m) {
                    if *owner != conn_id {
                        let conns = self.state.connections.lock().await;
                        if let Some(conn) = conns.get(&conn_id) {
                            let _ = conn.outbound.send(Frame::response_err(
                                "gateway.register",
                                RpcError::new(
                                    ErrorKind::AlreadyExists,
                                    format!("method `{m}` already registered by another service"),
                                ),
                            ));
                        }
                        return;
                    }
                }
            }
        }

        {
            let mut method_table = self.state.methods.lock().await;
            for m in &methods {
                method_table.insert(m.clone(), conn_id);
            }
        }
        {
            let mut subs = self.state.subscriptions.lock().await;
            for e in &subscriptions {
                subs.entry(e.clone()).or_default().push(conn_id);
            }
        }

        let mut conns = self.state.connections.lock().await;
        if let Some(conn) = conns.get_mut(&conn_id) {
            conn.service = Some(service.clone());
            conn.methods = methods;
            conn.events = events;
            conn.subscriptions = subscriptions;
            let _ = conn
                .outbound
                .send(Frame::response_ok("gateway.register", serde_json::json!({"ok": true})));
        }
        info!(service, version, conn_id, "service client registered");
    }

    async fn handle_request(
        &self,
        origin_conn: ConnId,
        origin_id: String,
        method: String,
        params: Value,
        timeout_ms: Option<u64>,
    ) {
        // gateway.* is the hub's own control namespace.
        if let Some(sub) = method.strip_prefix("gateway.") {
            self.handle_gateway_method(origin_conn, origin_id, sub, params)
                .await;
            return;
        }

        let target = { self.state.methods.lock().await.get(&method).copied() };
        let Some(target_conn) = target else {
            let conns = self.state.connections.lock().await;
            if let Some(conn) = conns.get(&origin_conn) {
                let _ = conn
                    .outbound
                    .send(Frame::response_err(origin_id, RpcError::no_route(&method)));
            }
            return;
        };

        let corr_id = Uuid::new_v4().to_string();
        let deadline = Instant::now()
            + Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        self.state.pending.lock().await.insert(
            corr_id.clone(),
            PendingRequest { origin_conn, origin_id, deadline },
        );

        let conns = self.state.connections.lock().await;
        if let Some(conn) = conns.get(&target_conn) {
            let _ = conn.outbound.send(Frame::Request {
                id: corr_id.clone(),
                method,
                params,
                timeout_ms,
            });
        } else {
            drop(conns);
            // Target vanished between lookup and send; fail fast.
            if let Some(p) = self.state.pending.lock().await.remove(&corr_id) {
                let conns = self.state.connections.lock().await;
                if let Some(conn) = conns.get(&p.origin_conn) {
                    let _ = conn
                        .outbound
                        .send(Frame::response_err(p.origin_id, RpcError::disconnected()));
                }
            }
        }
    }

    async fn handle_gateway_method(
        &self,
        origin_conn: ConnId,
        origin_id: String,
        sub: &str,
        _params: Value,
    ) {
        let result = match sub {
            "inspect" => {
                let conns = self.state.connections.lock().await;
                let services: Vec<Value> = conns
                    .values()
                    .filter_map(|c| {
                        c.service.as_ref().map(|s| {
                            serde_json::json!({
                                "service": s,
                                "methods": c.methods,
                                "events": c.events,
                                "subscriptions": c.subscriptions,
                            })
                        })
                    })
                    .collect();
                Ok(serde_json::json!({ "services": services }))
            }
            _ => Err(RpcError::new(ErrorKind::NotFound, format!("unknown gateway method `{sub}`"))),
        };

        let conns = self.state.connections.lock().await;
        if let Some(conn) = conns.get(&origin_conn) {
            let frame = match result {
                Ok(v) => Frame::response_ok(origin_id, v),
                Err(e) => Frame::response_err(origin_id, e),
            };
            let _ = conn.outbound.send(frame);
        }
    }

    async fn handle_response(&self, corr_id: String, result: Option<Value>, error: Option<RpcError>) {
        let Some(pending) = self.state.pending.lock().await.remove(&corr_id) else {
            debug!(corr_id, "late or unknown response discarded");
            return;
        };
        let conns = self.state.connections.lock().await;
        if let Some(conn) = conns.get(&pending.origin_conn) {
            let _ = conn
                .outbound
                .send(Frame::Response { id: pending.origin_id, result, error });
        }
    }

    async fn handle_event(&self, name: String, payload: Value) {
        let subscribers = {
            let subs = self.state.subscriptions.lock().await;
            subs.get(&name).cloned().unwrap_or_default()
        };
        let conns = self.state.connections.lock().await;
        for sub_id in subscribers {
            if let Some(conn) = conns.get(&sub_id) {
                // Best-effort: one subscriber's failure never affects others.
                let _ = conn.outbound.send(Frame::Event { name: name.clone(), payload: payload.clone() });
            }
        }
    }

    /// Number of currently connected service clients. Used by `inspect`/health.
    pub async fn connection_count(&self) -> usize {
        self.state.connections.lock().await.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
