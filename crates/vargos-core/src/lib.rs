// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod compact;
mod events;
mod prompts;
mod runtime;
mod runtime_context;
mod sanitize;
mod session;

pub use agent::Agent;
pub use compact::{
    compact_session, compact_session_with_strategy, emergency_compact, smart_truncate,
};
pub use events::{AgentEvent, CompactionStrategyUsed};
pub use prompts::system_prompt;
pub use runtime::{
    AgentFactory, AgentRunInfo, AgentRuntime, RunStatus, SUBAGENT_DENIED_TOOLS,
};
pub use runtime_context::AgentRuntimeContext;
pub use sanitize::{
    limit_turns, merge_turns, repair_tool_pairing, sanitize_history, turn_limit_for_session_key,
};
pub use session::{Session, TurnRecord};
