// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Hosts a [`GatewayHub`] over WebSocket so out-of-process service clients
//! can connect ("WebSockets over TCP on a configurable local port,
//! default 9000"). In-process clients skip this entirely and connect via
//! [`crate::transport::LoopbackTransport`] instead.

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use crate::hub::GatewayHub;
use crate::protocol::Frame;
use crate::transport::{Transport, TransportError};

pub const DEFAULT_PORT: u16 = 9000;

/// Build the Axum router exposing `/ws` for frame connections. Bind and
/// serve it from the caller (typically the `vargos gateway start` command).
pub fn router(hub: GatewayHub) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(hub)
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<GatewayHub>) -> Response {
    ws.on_upgrade(move |socket| async move {
        hub.accept(Box::new(AxumWsTransport { socket })).await;
    })
}

/// Adapts Axum's native [`WebSocket`] (distinct message/error types from
/// `tokio-tungstenite`) to the [`Transport`] trait.
struct AxumWsTransport {
    socket: WebSocket,
}

#[async_trait::async_trait]
impl Transport for AxumWsTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let text = frame.to_line()?;
        self.socket
            .send(AxumWsMessage::Text(text))
            .await
            .map_err(|e| TransportError::Ws(to_tungstenite_error(e)))
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.socket.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::Ws(to_tungstenite_error(e))),
                Some(Ok(AxumWsMessage::Text(text))) => return Ok(Some(Frame::from_line(&text)?)),
                Some(Ok(AxumWsMessage::Close(_))) => return Ok(None),
                Some(Ok(AxumWsMessage::Ping(_))) | Some(Ok(AxumWsMessage::Pong(_))) => continue,
                Some(Ok(AxumWsMessage::Binary(_))) => continue,
            }
        }
    }
}

/// Axum's WebSocket error type differs from `tokio-tungstenite`'s; both
/// ultimately wrap the same underlying protocol violations, so this just
/// carries the message through.
fn to_tungstenite_error(e: axum::Error) -> tokio_tungstenite::tungstenite::Error {
    tokio_tungstenite::tungstenite::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
}

/// Serve the hub, blocking until the listener is closed or an error occurs.
pub async fn serve(hub: GatewayHub, bind: std::net::SocketAddr) -> anyhow::Result<()> {
    debug!(%bind, "starting gateway WebSocket listener");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router(hub)).await?;
    Ok(())
}
