// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

/// `vargos gateway` subcommands.
#[derive(Subcommand, Debug)]
pub enum GatewayCommands {
    /// Start the gateway: boots every service client (sessions, tools,
    /// agent, channels, cron), acquires the process-wide lock, and serves
    /// the WebSocket transport until interrupted.
    Start {
        /// Path to the config file.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Stop a running gateway by sending it a termination signal.
    ///
    /// Reads the host/pid recorded in `gateway.lock`; refuses to act on a
    /// lock held by a different host.
    Stop {
        /// Path to the config file (used to locate the data directory).
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Report whether a gateway is running and, if so, since when.
    Status {
        /// Path to the config file (used to locate the data directory).
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
        /// Output as JSON instead of a human-readable line.
        #[arg(long)]
        json: bool,
    },
}

/// `vargos sessions` subcommands — thin wrappers over the gateway's
/// `session.*` methods.
#[derive(Subcommand, Debug)]
pub enum SessionsCommands {
    /// List known sessions.
    List {
        /// Filter by session kind ("main", "subagent", "cron").
        #[arg(long)]
        kind: Option<String>,
    },
    /// Show one session's metadata.
    Get {
        /// Session key, e.g. `cli:local` or `slack:u123`.
        session_key: String,
    },
    /// Print a session's message history.
    History {
        /// Session key, e.g. `cli:local` or `slack:u123`.
        session_key: String,
        /// Maximum number of messages to show (most recent first).
        #[arg(long, short = 'n')]
        limit: Option<usize>,
    },
    /// Delete a session and its history.
    Delete {
        /// Session key to delete.
        session_key: String,
    },
}

/// `vargos cron` subcommands — thin wrappers over the gateway's `cron.*` methods.
#[derive(Subcommand, Debug)]
pub enum CronCommands {
    /// List scheduled tasks.
    List,
    /// Add a new scheduled task.
    Add {
        /// Standard 5- or 6-field cron expression.
        schedule: String,
        /// Session key the task runs against, e.g. `cron:standup`.
        session_key: String,
        /// Instruction text sent to the agent when the task fires.
        instruction: String,
    },
    /// Remove a scheduled task by id.
    Remove {
        /// Task id, as shown by `vargos cron list`.
        task_id: String,
    },
    /// Trigger a scheduled task immediately, bypassing its schedule.
    Run {
        /// Task id, as shown by `vargos cron list`.
        task_id: String,
    },
}

#[derive(Parser, Debug)]
#[command(
    name = "vargos",
    about = "A self-hosted agent server: gateway hub, agent runtime, and channel ingress",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Initial task to submit to the local CLI session when no subcommand is given.
    /// If omitted, an interactive stdin/stdout session is started.
    #[arg(value_name = "PROMPT")]
    pub prompt: Option<String>,

    /// Path to config file (overrides auto-discovery)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Gateway: start the hub and every service client, or manage a running one.
    Gateway {
        #[command(subcommand)]
        command: GatewayCommands,
    },

    /// Print the effective configuration and exit.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Inspect and manage durable sessions via the Session Service.
    Sessions {
        #[command(subcommand)]
        command: SessionsCommands,
    },

    /// Inspect and manage scheduled tasks via the Cron Service.
    Cron {
        #[command(subcommand)]
        command: CronCommands,
    },

    /// Check whether a gateway is reachable on the configured port.
    Health {
        /// Path to the config file (used to locate the port).
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Print a session's metadata and recent history in one view.
    Inspect {
        /// Session key to inspect.
        session_key: String,
        /// Path to the config file (used to locate the port).
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Run the standalone Model Context Protocol server over stdio.
    Mcp {
        #[command(subcommand)]
        command: McpCommands,
    },

    /// Generate shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective (merged) configuration as YAML.
    Show {
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum McpCommands {
    /// Serve the built-in tool registry over stdio for an MCP client.
    Serve {
        /// Comma-separated subset of tool names to expose (default: all).
        #[arg(long)]
        tools: Option<String>,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "vargos", &mut std::io::stdout());
}
