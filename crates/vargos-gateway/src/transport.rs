// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Transports a [`crate::client::GatewayClient`] can speak frames over.
//!
//! The hub and the client protocol logic are transport-agnostic: a service
//! running in the same process as the hub uses [`LoopbackTransport`] (plain
//! `tokio::mpsc`, no serialization overhead), while a service in another
//! process — or another host — uses [`WsTransport`] (newline-delimited JSON
//! over WebSocket). Swapping one for the other never touches call sites —
//! any service can move across process boundaries without a code change.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::Frame;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

/// A duplex channel of [`Frame`]s. Implementations need not be `Clone`; the
/// client owns exactly one transport for the lifetime of a connection.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;
    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// In-memory transport used when a service client lives in the same process
/// as the [`crate::hub::GatewayHub`]. Avoids JSON round-tripping entirely.
pub struct LoopbackTransport {
    pub(crate) tx: mpsc::UnboundedSender<Frame>,
    pub(crate) rx: mpsc::UnboundedReceiver<Frame>,
}

impl LoopbackTransport {
    /// Returns `(hub_side, client_side)` — each end sees the other's sends.
    pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (LoopbackTransport { tx: a_tx, rx: b_rx }, LoopbackTransport { tx: b_tx, rx: a_rx })
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// WebSocket transport — the reference wire transport for cross-process
/// service clients ("WebSockets over TCP on a configurable local
/// port, default 9000"). Frames are newline-agnostic: each WS text frame
/// carries exactly one JSON [`Frame`].
pub struct WsTransport<S> {
    socket: S,
}

impl<S> WsTransport<S> {
    pub fn new(socket: S) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send,
{
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let text = frame.to_line()?;
        self.socket.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.socket.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(WsMessage::Text(text))) => return Ok(Some(Frame::from_line(&text)?)),
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Binary(_))) | Some(Ok(WsMessage::Frame(_))) => continue,
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
