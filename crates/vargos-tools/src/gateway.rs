// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`ToolsService`] — wraps a [`ToolRegistry`] behind the gateway's
//! `tool.*` methods. A failed tool invocation is never an RPC
//! error: it comes back as a normal `tool.execute` result with `isError:
//! true`, exactly as it would be fed back to the model as a tool result.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use vargos_config::AgentMode;
use vargos_gateway::{ErrorKind, Registration, RpcError, ServiceHandler};

use crate::registry::ToolRegistry;
use crate::tool::{ToolCall, ToolOutput, ToolOutputPart};

/// The Tools Service's self-description.
pub fn registration() -> Registration {
    Registration::new("tools", "1").methods(["tool.list", "tool.describe", "tool.execute"])
}

fn output_to_json(output: &ToolOutput) -> Value {
    let parts: Vec<Value> = output
        .parts
        .iter()
        .map(|p| match p {
            ToolOutputPart::Text(t) => json!({"type": "text", "text": t}),
            ToolOutputPart::Image(data_url) => json!({"type": "image", "image": data_url}),
        })
        .collect();
    json!({
        "callId": output.call_id,
        "content": output.content,
        "parts": parts,
        "isError": output.is_error,
    })
}

/// Gateway-facing wrapper over a [`ToolRegistry`]. Stateless beyond the
/// registry itself — no event subscriptions, no emitted events.
pub struct ToolsService {
    registry: ToolRegistry,
}

impl ToolsService {
    pub fn new(registry: ToolRegistry) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self { registry })
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

#[derive(Deserialize, Default)]
struct ListParams {
    mode: Option<AgentMode>,
}

#[derive(Deserialize)]
struct DescribeParams {
    name: String,
}

#[derive(Deserialize)]
struct ExecuteParams {
    #[serde(rename = "callId", default)]
    call_id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[async_trait]
impl ServiceHandler for ToolsService {
    async fn handle_method(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "tool.list" => {
                let p: ListParams = if params.is_null() {
                    ListParams::default()
                } else {
                    serde_json::from_value(params)
                        .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?
                };
                let schemas = match p.mode {
                    Some(mode) => self.registry.schemas_for_mode(mode),
                    None => self.registry.schemas(),
                };
                let schemas: Vec<Value> = schemas
                    .into_iter()
                    .map(|s| json!({"name": s.name, "description": s.description, "parameters": s.parameters}))
                    .collect();
                Ok(json!(schemas))
            }
            "tool.describe" => {
                let p: DescribeParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                let tool = self
                    .registry
                    .get(&p.name)
                    .ok_or_else(|| RpcError::new(ErrorKind::NotFound, format!("tool `{}` not found", p.name)))?;
                Ok(json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": tool.parameters_schema(),
                }))
            }
            "tool.execute" => {
                let p: ExecuteParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::new(ErrorKind::InvalidArgument, e.to_string()))?;
                let call = ToolCall {
                    id: p.call_id.unwrap_or_default(),
                    name: p.name,
                    args: p.args,
                };
                let output = self.registry.execute(&call).await;
                Ok(output_to_json(&output))
            }
            other => Err(RpcError::no_route(other)),
        }
    }

    async fn handle_event(&self, _name: &str, _payload: Value) {}
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{OutputCategory, Tool};
    use crate::policy::ApprovalPolicy;
    use vargos_gateway::{connect_in_process, GatewayClient, GatewayHub, NullHandler};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        fn default_policy(&self) -> ApprovalPolicy {
            ApprovalPolicy::Auto
        }
        fn output_category(&self) -> OutputCategory {
            OutputCategory::Generic
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            match call.args.get("text").and_then(Value::as_str) {
                Some(text) => ToolOutput::ok(&call.id, text),
                None => ToolOutput::err(&call.id, "missing `text`"),
            }
        }
    }

    async fn service_on_hub() -> (GatewayHub, std::sync::Arc<GatewayClient>) {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let service = ToolsService::new(registry);
        let hub = GatewayHub::new();
        let client = connect_in_process(&hub, registration(), service).await.unwrap();
        (hub, client)
    }

    #[tokio::test]
    async fn list_includes_registered_tool() {
        let (hub, _tools) = service_on_hub().await;
        let caller = connect_in_process(&hub, Registration::new("caller", "1"), std::sync::Arc::new(NullHandler))
            .await
            .unwrap();
        let schemas: Vec<Value> = caller.call("tool.list", Value::Null, None).await.unwrap();
        assert!(schemas.iter().any(|s| s["name"] == "echo"));
    }

    #[tokio::test]
    async fn describe_unknown_tool_fails_not_found() {
        let (hub, _tools) = service_on_hub().await;
        let caller = connect_in_process(&hub, Registration::new("caller", "1"), std::sync::Arc::new(NullHandler))
            .await
            .unwrap();
        let err = caller
            .call_raw("tool.describe", json!({"name": "missing"}), None)
            .await
            .unwrap_err();
        match err {
            vargos_gateway::ClientError::Rpc(e) => assert_eq!(e.code, ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_success_comes_back_as_content_not_rpc_error() {
        let (hub, _tools) = service_on_hub().await;
        let caller = connect_in_process(&hub, Registration::new("caller", "1"), std::sync::Arc::new(NullHandler))
            .await
            .unwrap();
        let result: Value = caller
            .call("tool.execute", json!({"name": "echo", "args": {"text": "hi"}}), None)
            .await
            .unwrap();
        assert_eq!(result["isError"], false);
        assert_eq!(result["content"], "hi");
    }

    #[tokio::test]
    async fn execute_failure_comes_back_as_content_not_rpc_error() {
        let (hub, _tools) = service_on_hub().await;
        let caller = connect_in_process(&hub, Registration::new("caller", "1"), std::sync::Arc::new(NullHandler))
            .await
            .unwrap();
        let result: Value = caller
            .call("tool.execute", json!({"name": "echo", "args": {}}), None)
            .await
            .unwrap();
        assert_eq!(result["isError"], true);
    }

    #[tokio::test]
    async fn execute_unknown_tool_is_error_content_not_rpc_error() {
        let (hub, _tools) = service_on_hub().await;
        let caller = connect_in_process(&hub, Registration::new("caller", "1"), std::sync::Arc::new(NullHandler))
            .await
            .unwrap();
        let result: Value = caller
            .call("tool.execute", json!({"name": "nonexistent", "args": {}}), None)
            .await
            .unwrap();
        assert_eq!(result["isError"], true);
        assert!(result["content"].as_str().unwrap().contains("unknown tool"));
    }
}
