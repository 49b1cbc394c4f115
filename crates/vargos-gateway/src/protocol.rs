// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Frame wire format — newline-delimited JSON records exchanged between a
//! [`crate::client::GatewayClient`] and the [`crate::hub::GatewayHub`].
//!
//! Every connection belongs to exactly one service client. The four frame
//! kinds form a method-routed RPC + pub/sub bus so any number of services
//! can sit behind the hub, rather than a single fixed command/event pair
//! wired to one agent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default request timeout when a caller does not override it.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: String,
        method: String,
        params: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        #[serde(rename = "timeoutMs")]
        timeout_ms: Option<u64>,
    },
    Response {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },
    Event {
        name: String,
        payload: Value,
    },
    Register {
        service: String,
        version: String,
        #[serde(default)]
        methods: Vec<String>,
        #[serde(default)]
        events: Vec<String>,
        #[serde(default)]
        subscriptions: Vec<String>,
    },
    /// Hub → client liveness probe; client answers with the same nonce.
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}

impl Frame {
    pub fn response_ok(id: impl Into<String>, result: Value) -> Self {
        Frame::Response { id: id.into(), result: Some(result), error: None }
    }

    pub fn response_err(id: impl Into<String>, error: RpcError) -> Self {
        Frame::Response { id: id.into(), result: None, error: Some(error) }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// Error kinds classified at the hub and client boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    NoRoute,
    Timeout,
    Disconnected,
    ToolFailure,
    ProviderFailure,
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorKind, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn no_route(method: &str) -> Self {
        Self::new(ErrorKind::NoRoute, format!("no service handles method `{method}`"))
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "request deadline exceeded")
    }

    pub fn disconnected() -> Self {
        Self::new(ErrorKind::Disconnected, "transport closed mid-call")
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips_through_json() {
        let f = Frame::Request {
            id: "r-1".into(),
            method: "agent.run".into(),
            params: json!({"sessionKey": "cli:1"}),
            timeout_ms: Some(300_000),
        };
        let line = f.to_line().unwrap();
        assert!(line.contains("\"kind\":\"request\""));
        assert!(line.contains("\"timeoutMs\":300000"));
        let back = Frame::from_line(&line).unwrap();
        match back {
            Frame::Request { id, method, .. } => {
                assert_eq!(id, "r-1");
                assert_eq!(method, "agent.run");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn response_error_round_trips() {
        let f = Frame::response_err("r-2", RpcError::timeout());
        let line = f.to_line().unwrap();
        let back = Frame::from_line(&line).unwrap();
        match back {
            Frame::Response { id, error: Some(e), result: None } => {
                assert_eq!(id, "r-2");
                assert_eq!(e.code, ErrorKind::Timeout);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn register_frame_has_expected_fields() {
        let f = Frame::Register {
            service: "agent".into(),
            version: "1".into(),
            methods: vec!["agent.run".into()],
            events: vec!["run.started".into()],
            subscriptions: vec!["message.received".into()],
        };
        let line = f.to_line().unwrap();
        let back: Frame = Frame::from_line(&line).unwrap();
        match back {
            Frame::Register { service, methods, events, subscriptions, .. } => {
                assert_eq!(service, "agent");
                assert_eq!(methods, vec!["agent.run"]);
                assert_eq!(events, vec!["run.started"]);
                assert_eq!(subscriptions, vec!["message.received"]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn event_frame_round_trips() {
        let f = Frame::Event { name: "run.delta".into(), payload: json!({"delta": "hi"}) };
        let line = f.to_line().unwrap();
        let back = Frame::from_line(&line).unwrap();
        match back {
            Frame::Event { name, payload } => {
                assert_eq!(name, "run.delta");
                assert_eq!(payload["delta"], "hi");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn no_route_error_message_names_method() {
        let e = RpcError::no_route("agent.run");
        assert_eq!(e.code, ErrorKind::NoRoute);
        assert!(e.message.contains("agent.run"));
    }

    #[test]
    fn malformed_json_fails_to_parse() {
        assert!(Frame::from_line("not json").is_err());
    }
}
