// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! [`DefaultAgentFactory`] — the [`vargos_core::AgentFactory`] implementation
//! [`vargos_core::AgentRuntime`] calls to build (or resume) the agent behind
//! each live `sessionKey`.
//!
//! Resuming means: ensure the durable [`vargos_sessions::Session`] record
//! exists ("a session exists before any message references it"),
//! load its history through the Session Service, run it through the history
//! sanitizer, and seed it into a freshly built [`Agent`].

use std::sync::{atomic::AtomicUsize, Arc};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use vargos_config::Config;
use vargos_core::{sanitize_history, turn_limit_for_session_key, Agent, AgentFactory};
use vargos_gateway::{ErrorKind, GatewayClient};
use vargos_model::{Message, ModelProvider};
use vargos_sessions::{is_subagent_key, SessionKind};
use vargos_tools::events::TodoItem;

use crate::agent::AgentBuilder;
use crate::context::{RuntimeContext, ToolSetProfile};

fn session_kind_for(session_key: &str) -> SessionKind {
    if is_subagent_key(session_key) {
        SessionKind::Subagent
    } else if session_key.starts_with("cron:") {
        SessionKind::Cron
    } else {
        SessionKind::Main
    }
}

/// Builds a fully wired [`Agent`] per `sessionKey`, backed by the Session
/// Service for durable history and by the `ModelProvider` resolved once at
/// construction ("`agent.run{..., model?, provider?, ...}`" is
/// accepted for forward compatibility but a single configured model serves
/// every session in this implementation, matching `vargos-bootstrap`'s
/// existing single-model-per-process design).
pub struct DefaultAgentFactory {
    config: Arc<Config>,
    model: Arc<dyn ModelProvider>,
    client: Arc<GatewayClient>,
    runtime_ctx_template: Arc<RuntimeContext>,
}

impl DefaultAgentFactory {
    pub fn new(config: Arc<Config>, model: Arc<dyn ModelProvider>, client: Arc<GatewayClient>) -> Self {
        Self {
            config,
            model,
            client,
            runtime_ctx_template: Arc::new(RuntimeContext::auto_detect()),
        }
    }

    async fn ensure_session(&self, session_key: &str) -> anyhow::Result<()> {
        let kind = session_kind_for(session_key);
        let result = self
            .client
            .call::<_, serde_json::Value>(
                "session.create",
                json!({ "sessionKey": session_key, "kind": kind }),
                None,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(vargos_gateway::ClientError::Rpc(e)) if e.code == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_history(&self, session_key: &str) -> anyhow::Result<Vec<Message>> {
        #[derive(serde::Deserialize)]
        struct Messages {
            messages: Vec<vargos_sessions::SessionMessage>,
        }
        let resp: Messages = self
            .client
            .call("session.getMessages", json!({ "sessionKey": session_key }), None)
            .await?;
        let raw: Vec<Message> = resp
            .messages
            .into_iter()
            .map(|m| Message { role: m.role, content: m.content })
            .collect();
        Ok(sanitize_history(raw, turn_limit_for_session_key(session_key)))
    }

    /// Copy the shared auto-detected context (project root, git, CI) for one
    /// session's [`AgentBuilder`] call. Sub-agents inherit it unmodified; the
    /// prompt-mode derivation downstream decides what of it
    /// surfaces in the final prompt.
    fn runtime_context_for(&self, _session_key: &str) -> RuntimeContext {
        RuntimeContext {
            project_root: self.runtime_ctx_template.project_root.clone(),
            git_context: self.runtime_ctx_template.git_context.clone(),
            ci_context: self.runtime_ctx_template.ci_context.clone(),
            project_context_file: self.runtime_ctx_template.project_context_file.clone(),
            append_system_prompt: self.runtime_ctx_template.append_system_prompt.clone(),
            system_prompt_override: self.runtime_ctx_template.system_prompt_override.clone(),
        }
    }
}

#[async_trait]
impl AgentFactory for DefaultAgentFactory {
    async fn build_agent(&self, session_key: &str) -> anyhow::Result<Agent> {
        debug!(session_key, "building agent");
        self.ensure_session(session_key).await?;
        let history = self.load_history(session_key).await?;

        let profile = if is_subagent_key(session_key) {
            ToolSetProfile::SubAgent { todos: Arc::new(Mutex::new(Vec::<TodoItem>::new())) }
        } else {
            ToolSetProfile::Full {
                question_tx: None,
                todos: Arc::new(Mutex::new(Vec::<TodoItem>::new())),
                task_depth: Arc::new(AtomicUsize::new(0)),
            }
        };

        let mode = self.config.agent.default_mode;
        let mut agent = AgentBuilder::new(self.config.clone())
            .with_runtime_context(self.runtime_context_for(session_key))
            .build(
                mode,
                self.model.clone(),
                profile,
                session_key,
                Some(self.client.clone()),
            );

        if !history.is_empty() {
            agent.seed_history(history).await;
        }

        Ok(agent)
    }
}
