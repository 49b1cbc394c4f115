// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`AgentBuilder`] — single entry point for constructing a fully wired Agent.
//!
//! Callers pass a [`Config`], an optional [`RuntimeContext`], the desired
//! mode and model, and a [`ToolSetProfile`].  The builder handles registry
//! construction and [`AgentRuntimeContext`] population internally.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use vargos_config::{AgentMode, Config};
use vargos_core::{Agent, AgentRuntimeContext, SUBAGENT_DENIED_TOOLS};
use vargos_gateway::GatewayClient;
use vargos_model::ModelProvider;
use vargos_sessions::is_subagent_key;
use vargos_tools::events::ToolEvent;

use crate::context::{RuntimeContext, ToolSetProfile};
use crate::registry::{build_tool_registry, SessionBridge};

/// Constructs a fully wired [`Agent`] from configuration and runtime context.
///
/// # Example
/// ```rust,ignore
/// let agent = AgentBuilder::new(config)
///     .with_runtime_context(RuntimeContext::auto_detect())
///     .build(mode, model, ToolSetProfile::Full { .. }, "cli:1", Some(client));
/// ```
pub struct AgentBuilder {
    config: Arc<Config>,
    runtime_ctx: RuntimeContext,
}

impl AgentBuilder {
    /// Create a builder with the given configuration.
    /// Runtime context defaults to empty (no project/git/CI detection).
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            runtime_ctx: RuntimeContext::empty(),
        }
    }

    /// Set the runtime context (project root, git, CI environment).
    pub fn with_runtime_context(mut self, ctx: RuntimeContext) -> Self {
        self.runtime_ctx = ctx;
        self
    }

    /// Build the [`Agent`] with the given mode, model, and tool-set profile
    /// for the given `session_key`.
    ///
    /// This method owns the creation of the shared mode lock and tool-event
    /// channel so that `SwitchModeTool` / `TodoWriteTool` and the agent loop
    /// operate on **the same** instances:
    ///
    /// 1. Creates `mode_lock` (same Arc for both the registry and the Agent).
    /// 2. Creates `(tool_event_tx, tool_event_rx)` (tx → tools, rx → Agent).
    /// 3. Converts [`RuntimeContext`] → [`AgentRuntimeContext`].
    /// 4. Builds a [`ToolRegistry`] via `build_tool_registry`, registering the
    ///    `sessions_*` bridge tools when `gateway_client` is given.
    /// 5. If `session_key` matches `:subagent:`, denies the `sessions_*`
    ///    bridge tools — sub-agents cannot spawn further sub-agents or
    ///    rummage through sibling sessions — via `ToolRegistry::with_denylist`.
    /// 6. Constructs `Agent::new(...)`.
    pub fn build(
        self,
        mode: AgentMode,
        model: Arc<dyn ModelProvider>,
        profile: ToolSetProfile,
        session_key: &str,
        gateway_client: Option<Arc<GatewayClient>>,
    ) -> Agent {
        // Shared mode lock: SwitchModeTool holds a clone; the agent owns it.
        let mode_lock = Arc::new(Mutex::new(mode));
        // Shared event channel: tools send, agent drains.
        let (tool_event_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(64);

        // Discover skills, subagents, and knowledge docs from the standard
        // search hierarchy rooted at the detected project root.
        let skills = vargos_runtime::SharedSkills::new(vargos_runtime::discover_skills(
            self.runtime_ctx.project_root.as_deref(),
        ));
        let agents = vargos_runtime::SharedAgents::new(vargos_runtime::discover_agents(
            self.runtime_ctx.project_root.as_deref(),
        ));
        let knowledge_docs = vargos_runtime::discover_knowledge(self.runtime_ctx.project_root.as_deref());
        let knowledge_drift_note = self
            .runtime_ctx
            .project_root
            .as_deref()
            .map(|root| vargos_runtime::check_knowledge_drift(root, &knowledge_docs))
            .filter(|warnings| !warnings.is_empty())
            .and_then(|warnings| vargos_runtime::format_drift_warnings(&warnings));
        let knowledge = vargos_runtime::SharedKnowledge::new(knowledge_docs);

        // Convert RuntimeContext → AgentRuntimeContext (the vargos-core type).
        let runtime = AgentRuntimeContext {
            project_root: self.runtime_ctx.project_root,
            git_context_note: self.runtime_ctx.git_context
                .and_then(|g| g.to_prompt_section()),
            ci_context_note: self.runtime_ctx.ci_context
                .and_then(|c| c.to_prompt_section()),
            project_context_file: self.runtime_ctx.project_context_file,
            append_system_prompt: self.runtime_ctx.append_system_prompt,
            system_prompt_override: self.runtime_ctx.system_prompt_override,
            skills,
            agents,
            knowledge,
            knowledge_drift_note,
        };

        let session_bridge = gateway_client.map(|client| SessionBridge {
            client,
            owner_session_key: session_key.to_string(),
        });

        // Pass runtime.clone() as sub_agent_runtime so TaskTool sub-agents
        // inherit the parent's project root, AGENTS.md, CI/git context.
        let registry = build_tool_registry(
            &self.config,
            model.clone(),
            profile,
            mode_lock.clone(),
            tool_event_tx,
            runtime.clone(),
            session_bridge,
        );
        let registry = if is_subagent_key(session_key) {
            registry.with_denylist(SUBAGENT_DENIED_TOOLS)
        } else {
            registry
        };

        // Resolve context window from the static catalog; fall back to 128 000.
        let context_window = model.catalog_context_window().unwrap_or(128_000) as usize;

        Agent::new(
            model,
            Arc::new(registry),
            Arc::new(self.config.agent.clone()),
            runtime,
            mode_lock,
            tool_event_rx,
            context_window,
        )
    }
}
