// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `vargos-gateway` — the frame protocol, Gateway Hub, and Service Client
//! base.
//!
//! Every other service crate (`vargos-sessions`, `vargos-tools`,
//! `vargos-core`, `vargos-channels`, `vargos-scheduler`, `vargos-mcp`) is a
//! [`client::ServiceHandler`] wired to a [`client::GatewayClient`] connected
//! to one shared [`hub::GatewayHub`].

pub mod client;
pub mod hub;
pub mod lock;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{ClientError, GatewayClient, NullHandler, Registration, ServiceHandler};
pub use hub::GatewayHub;
pub use lock::{GatewayLock, LockError};
pub use protocol::{ErrorKind, Frame, RpcError};
pub use transport::{LoopbackTransport, Transport, TransportError, WsTransport};

/// Connect a service client to `hub` over an in-process loopback transport —
/// the common case when the hub and the service share a process.
pub async fn connect_in_process(
    hub: &GatewayHub,
    registration: Registration,
    handler: std::sync::Arc<dyn ServiceHandler>,
) -> Result<std::sync::Arc<GatewayClient>, ClientError> {
    let (hub_side, client_side) = LoopbackTransport::pair();
    let hub = hub.clone();
    tokio::spawn(async move { hub.accept(Box::new(hub_side)).await });
    GatewayClient::connect(Box::new(client_side), registration, handler).await
}

/// Connect a service client to a hub running in another process, over
/// WebSocket at `url` (e.g. `ws://127.0.0.1:9000/ws`).
pub async fn connect_ws(
    url: &str,
    registration: Registration,
    handler: std::sync::Arc<dyn ServiceHandler>,
) -> Result<std::sync::Arc<GatewayClient>, ClientError> {
    let (stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|_| ClientError::Closed)?;
    let transport = WsTransport::new(stream);
    GatewayClient::connect(Box::new(transport), registration, handler).await
}
