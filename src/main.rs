// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, ConfigCommands, CronCommands, GatewayCommands, McpCommands, SessionsCommands};

use vargos_bootstrap::{build_tool_registry, DefaultAgentFactory, ToolSetProfile};
use vargos_channels::{ChannelAdapter, ChannelsService, CliAdapter};
use vargos_config::Config;
use vargos_core::{AgentRuntime, AgentRuntimeContext};
use vargos_gateway::{
    connect_in_process, connect_ws, ErrorKind, GatewayClient, GatewayHub, GatewayLock, NullHandler,
    Registration, RpcError, ServiceHandler,
};
use vargos_scheduler::{ensure_heartbeat_task, CronService, CronStore};
use vargos_sessions::{FileSessionStore, Session, SessionStore, SessionsService, SqliteSessionStore};
use vargos_tools::ToolsService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_logging(args.verbose);

    match args.command {
        Some(Commands::Gateway { command }) => run_gateway_command(command).await,
        Some(Commands::Config { command: ConfigCommands::Show { config } }) => config_show(config.as_deref()),
        Some(Commands::Sessions { command }) => run_sessions_command(command, args.config.as_deref()).await,
        Some(Commands::Cron { command }) => run_cron_command(command, args.config.as_deref()).await,
        Some(Commands::Health { config }) => run_health(config.as_deref()).await,
        Some(Commands::Inspect { session_key, config }) => {
            run_inspect(&session_key, config.as_deref()).await
        }
        Some(Commands::Mcp { command: McpCommands::Serve { tools } }) => run_mcp_serve(tools).await,
        Some(Commands::Completions { shell }) => {
            cli::print_completions(shell);
            Ok(())
        }
        None => run_local_cli(args.prompt, args.config.as_deref()).await,
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    vargos_config::load(path).context("loading configuration")
}

fn data_dir(config: &Config) -> PathBuf {
    match &config.gateway.data_dir {
        Some(dir) => expand_home(dir),
        None => dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vargos"),
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn gateway_addr(config: &Config) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], config.gateway.port))
}

fn gateway_ws_url(config: &Config) -> String {
    format!("ws://127.0.0.1:{}/ws", config.gateway.port)
}

/// Reads the machine hostname via a raw syscall. `vargos-gateway::lock` keeps
/// an identical helper private to its own crate; duplicated here rather than
/// exposed, since it's a one-syscall primitive not worth a new public API.
fn current_hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = vec![0u8; 256];
        let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if ret == 0 {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            buf.truncate(len);
            return String::from_utf8_lossy(&buf).into_owned();
        }
    }
    "unknown-host".to_string()
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

// ── Shared service bootstrap ──────────────────────────────────────────────────

/// Service clients every boot path needs: durable sessions, the tool
/// registry, and the per-session agent dispatcher. `gateway start` layers
/// channels and cron on top of this; the local CLI path uses it as-is.
struct CoreServices {
    hub: GatewayHub,
    agent_client: Arc<GatewayClient>,
}

fn session_store(config: &Config, dir: &Path) -> anyhow::Result<Arc<dyn SessionStore>> {
    Ok(match config.gateway.session_backend.as_str() {
        "sqlite" => Arc::new(SqliteSessionStore::open(dir.join("sessions.sqlite3"))?),
        _ => Arc::new(FileSessionStore::new(dir.join("sessions"))),
    })
}

/// Builds the general-purpose registry the Tool Service exposes over
/// `tool.*`: the full profile, no session bridge (no single owning session
/// here), and a throwaway mode lock/event channel since no [`vargos_core::Agent`]
/// drains the latter.
fn general_tool_registry(
    config: &Config,
    model: Arc<dyn vargos_model::ModelProvider>,
) -> vargos_tools::ToolRegistry {
    let mode_lock = Arc::new(Mutex::new(config.agent.default_mode));
    let (tool_event_tx, _tool_event_rx) = mpsc::channel::<vargos_tools::events::ToolEvent>(1);
    let profile = ToolSetProfile::Full {
        question_tx: None,
        todos: Arc::new(Mutex::new(Vec::new())),
        task_depth: Arc::new(AtomicUsize::new(0)),
    };
    build_tool_registry(
        config,
        model,
        profile,
        mode_lock,
        tool_event_tx,
        AgentRuntimeContext::default(),
        None,
    )
}

async fn boot_core_services(config: Arc<Config>, dir: &Path) -> anyhow::Result<CoreServices> {
    std::fs::create_dir_all(dir)?;
    let hub = GatewayHub::new();

    let store = session_store(&config, dir)?;
    let sessions = SessionsService::new(store);
    let sessions_client =
        connect_in_process(&hub, vargos_sessions::service::registration(), sessions.clone()).await?;
    sessions.attach_client(sessions_client);

    let model: Arc<dyn vargos_model::ModelProvider> = Arc::from(vargos_model::from_config(&config.model)?);

    let registry = general_tool_registry(&config, model.clone());
    let tools = ToolsService::new(registry);
    connect_in_process(&hub, vargos_tools::gateway::registration(), tools).await?;

    // The agent factory needs its own connected client to answer nothing but
    // to let `AgentBuilder` wire the `sessions_*` bridge tools for each agent
    // it builds — distinct from the Agent Service's own client below.
    let factory_client = connect_in_process(
        &hub,
        Registration::new("agent-factory", "1"),
        Arc::new(NullHandler),
    )
    .await?;
    let factory = Arc::new(DefaultAgentFactory::new(config.clone(), model, factory_client));

    let agent_runtime = Arc::new(AgentRuntime::new(factory));
    let agent_client = connect_in_process(&hub, AgentRuntime::registration(), agent_runtime.clone()).await?;
    agent_runtime.attach_client(agent_client.clone());

    Ok(CoreServices { hub, agent_client })
}

// ── `vargos gateway` ──────────────────────────────────────────────────────────

async fn run_gateway_command(cmd: GatewayCommands) -> anyhow::Result<()> {
    match cmd {
        GatewayCommands::Start { config } => gateway_start(config.as_deref()).await,
        GatewayCommands::Stop { config } => gateway_stop(config.as_deref()).await,
        GatewayCommands::Status { config, json } => gateway_status(config.as_deref(), json).await,
    }
}

async fn gateway_start(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = Arc::new(load_config(config_path)?);
    let dir = data_dir(&config);
    std::fs::create_dir_all(&dir)?;

    let lock = GatewayLock::acquire(&dir).await.map_err(|e| match e {
        vargos_gateway::LockError::Contended { host, pid } => {
            anyhow::anyhow!("a gateway is already running on {host} (pid {pid})")
        }
        other => other.into(),
    })?;

    let core = boot_core_services(config.clone(), &dir).await?;

    let channels = ChannelsService::new(config.channels.clone(), dir.clone());
    let channels_client =
        connect_in_process(&core.hub, vargos_channels::registration(), channels.clone()).await?;
    channels.attach_client(channels_client);
    let cli_adapter: Arc<dyn ChannelAdapter> = Arc::new(CliAdapter::new(channels.clone()));
    cli_adapter.initialize().await?;
    cli_adapter.start().await?;
    channels.register_adapter(cli_adapter).await;

    let cron_store = Arc::new(CronStore::load(dir.join("cron-tasks.json")).await?);
    ensure_heartbeat_task(&cron_store, &config.cron).await?;
    let cron = CronService::new(cron_store);
    let cron_client = connect_in_process(&core.hub, vargos_scheduler::registration(), cron.clone()).await?;
    cron.attach_client(cron_client);

    let addr = gateway_addr(&config);
    tracing::info!(%addr, data_dir = %dir.display(), "vargos gateway listening");

    tokio::select! {
        result = vargos_gateway::server::serve(core.hub.clone(), addr) => {
            result.context("gateway WebSocket listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, shutting down");
        }
    }

    drop(lock);
    Ok(())
}

async fn gateway_stop(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let dir = data_dir(&config);
    let record = read_lock_record(&dir.join("gateway.lock"))?;

    let host = current_hostname();
    if record.host != host {
        bail!(
            "gateway lock is held by `{}`, not this host (`{host}`) — refusing to signal a foreign process",
            record.host
        );
    }

    #[cfg(unix)]
    {
        let pid = record.pid as libc::pid_t;
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            bail!("failed to signal pid {pid}: {}", std::io::Error::last_os_error());
        }
    }
    #[cfg(not(unix))]
    {
        bail!("stopping a gateway by pid is only supported on unix");
    }

    println!("sent SIGTERM to gateway (pid {})", record.pid);
    Ok(())
}

async fn gateway_status(config_path: Option<&Path>, as_json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let dir = data_dir(&config);
    let lock_path = dir.join("gateway.lock");

    let status = match read_lock_record(&lock_path) {
        Ok(record) => {
            let alive = if record.host == current_hostname() {
                pid_alive(record.pid)
            } else {
                // No cheap liveness check across hosts; trust the lock record.
                true
            };
            json!({
                "running": alive,
                "host": record.host,
                "pid": record.pid,
                "startedAt": record.started_at,
                "heartbeat": record.heartbeat,
            })
        }
        Err(_) => json!({ "running": false }),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else if status["running"].as_bool().unwrap_or(false) {
        println!(
            "gateway running on {} (pid {}), started {}",
            status["host"], status["pid"], status["startedAt"]
        );
    } else {
        println!("no gateway running for data dir {}", dir.display());
    }
    Ok(())
}

fn read_lock_record(path: &Path) -> anyhow::Result<vargos_gateway::lock::LockRecord> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("no gateway lock found at {}", path.display()))?;
    Ok(serde_json::from_str(&data)?)
}

// ── `vargos config show` ──────────────────────────────────────────────────────

fn config_show(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

// ── RPC callers against a running gateway ─────────────────────────────────────

async fn rpc_client(config: &Config) -> anyhow::Result<Arc<GatewayClient>> {
    let url = gateway_ws_url(config);
    connect_ws(&url, Registration::new("vargos-cli", "1"), Arc::new(NullHandler))
        .await
        .with_context(|| format!("connecting to gateway at {url} — is `vargos gateway start` running?"))
}

async fn run_sessions_command(cmd: SessionsCommands, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let client = rpc_client(&config).await?;

    match cmd {
        SessionsCommands::List { kind } => {
            let params = match kind {
                Some(k) => json!({ "kind": k }),
                None => Value::Null,
            };
            let sessions: Vec<Session> = client.call("session.list", params, None).await?;
            if sessions.is_empty() {
                println!("no sessions");
            }
            for s in sessions {
                println!(
                    "{:<10} {:<32} updated {}",
                    format!("{:?}", s.kind).to_lowercase(),
                    s.session_key,
                    s.updated_at
                );
            }
        }
        SessionsCommands::Get { session_key } => {
            let session: Option<Session> = client
                .call("session.get", json!({ "sessionKey": session_key }), None)
                .await?;
            match session {
                Some(s) => println!("{}", serde_json::to_string_pretty(&s)?),
                None => bail!("no such session `{session_key}`"),
            }
        }
        SessionsCommands::History { session_key, limit } => {
            let messages: Vec<MessageView> = client
                .call(
                    "session.getMessages",
                    json!({ "sessionKey": session_key, "limit": limit }),
                    None,
                )
                .await?;
            for m in messages {
                println!("[{}] {:?}: {}", m.timestamp, m.role, summarize_content(&m.content));
            }
        }
        SessionsCommands::Delete { session_key } => {
            client
                .call::<_, Value>("session.delete", json!({ "sessionKey": session_key }), None)
                .await?;
            println!("deleted `{session_key}`");
        }
    }
    Ok(())
}

#[derive(Deserialize)]
struct MessageView {
    role: vargos_model::Role,
    content: vargos_model::MessageContent,
    timestamp: chrono::DateTime<chrono::Utc>,
}

fn summarize_content(content: &vargos_model::MessageContent) -> String {
    use vargos_model::{MessageContent, ToolResultContent};
    match content {
        MessageContent::Text(t) => t.clone(),
        MessageContent::ContentParts(parts) => format!("<{} content part(s)>", parts.len()),
        MessageContent::ToolCall { function, .. } => {
            format!("<tool call {}({})>", function.name, function.arguments)
        }
        MessageContent::ToolResult { content, .. } => match content {
            ToolResultContent::Text(t) => format!("<tool result {t}>"),
            other => format!("<tool result {other:?}>"),
        },
    }
}

async fn run_cron_command(cmd: CronCommands, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let client = rpc_client(&config).await?;

    match cmd {
        CronCommands::List => {
            #[derive(Deserialize)]
            struct ListResult {
                tasks: Vec<vargos_scheduler::CronTask>,
            }
            let result: ListResult = client.call("cron.list", Value::Null, None).await?;
            if result.tasks.is_empty() {
                println!("no scheduled tasks");
            }
            for t in result.tasks {
                println!(
                    "{:<20} {:<10} {:<24} {}",
                    t.task_id,
                    if t.enabled { "enabled" } else { "disabled" },
                    t.schedule,
                    t.session_key
                );
            }
        }
        CronCommands::Add { schedule, session_key, instruction } => {
            let task: vargos_scheduler::CronTask = client
                .call(
                    "cron.add",
                    json!({ "schedule": schedule, "sessionKey": session_key, "task": instruction }),
                    None,
                )
                .await?;
            println!("added task {}", task.task_id);
        }
        CronCommands::Remove { task_id } => {
            client
                .call::<_, Value>("cron.remove", json!({ "taskId": task_id }), None)
                .await?;
            println!("removed task {task_id}");
        }
        CronCommands::Run { task_id } => {
            client
                .call::<_, Value>("cron.run", json!({ "taskId": task_id }), None)
                .await?;
            println!("triggered task {task_id}");
        }
    }
    Ok(())
}

async fn run_health(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    match rpc_client(&config).await {
        Ok(client) => {
            let inspect: Value = client.call("gateway.inspect", Value::Null, None).await?;
            let count = inspect["services"].as_array().map(|a| a.len()).unwrap_or(0);
            println!(
                "gateway reachable at {} — {count} services registered",
                gateway_ws_url(&config)
            );
        }
        Err(err) => {
            bail!("gateway not reachable at {}: {err}", gateway_ws_url(&config));
        }
    }
    Ok(())
}

async fn run_inspect(session_key: &str, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let client = rpc_client(&config).await?;

    let session: Option<Session> = client
        .call("session.get", json!({ "sessionKey": session_key }), None)
        .await?;
    let Some(session) = session else {
        bail!("no such session `{session_key}`");
    };
    println!("{}", serde_json::to_string_pretty(&session)?);

    let messages: Vec<MessageView> = client
        .call(
            "session.getMessages",
            json!({ "sessionKey": session_key, "limit": 20u32 }),
            None,
        )
        .await?;
    println!("\nrecent history:");
    for m in messages {
        println!("[{}] {:?}: {}", m.timestamp, m.role, summarize_content(&m.content));
    }
    Ok(())
}

// ── `vargos mcp serve` ─────────────────────────────────────────────────────────

async fn run_mcp_serve(tools: Option<String>) -> anyhow::Result<()> {
    let registry = vargos_mcp::build_mcp_registry(std::env::var("BRAVE_API_KEY").ok(), tools.as_deref());
    vargos_mcp::serve_stdio(Arc::new(registry)).await
}

// ── Default (no-subcommand) local CLI session ─────────────────────────────────

/// Subscribes directly to `run.delta`/`run.completed` and prints them.
///
/// `AgentRuntime`'s `run.completed` handler deliberately skips `channel.send`
/// routing for `cli:`/`cron:`-rooted sessions — only channel-rooted sessions
/// get delivered there. The CLI is the "channel" for a `cli:` session, so it
/// has to watch these events itself rather than lean on `ChannelsService`.
struct CliFrontend {
    stream: bool,
    waiters: Mutex<std::collections::HashMap<String, oneshot::Sender<(bool, Option<String>)>>>,
}

impl CliFrontend {
    fn new(stream: bool) -> Arc<Self> {
        Arc::new(Self { stream, waiters: Mutex::new(std::collections::HashMap::new()) })
    }

    async fn wait_for(&self, run_id: &str) -> (bool, Option<String>) {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(run_id.to_string(), tx);
        rx.await.unwrap_or((false, None))
    }
}

#[async_trait]
impl ServiceHandler for CliFrontend {
    async fn handle_method(&self, method: &str, _params: Value) -> Result<Value, RpcError> {
        Err(RpcError::new(ErrorKind::NotFound, format!("cli frontend answers no methods (`{method}`)")))
    }

    async fn handle_event(&self, name: &str, payload: Value) {
        match name {
            "run.delta" if self.stream => {
                if let Some(delta) = payload.get("delta").and_then(Value::as_str) {
                    use std::io::Write;
                    print!("{delta}");
                    let _ = std::io::stdout().flush();
                }
            }
            "run.completed" => {
                let Some(run_id) = payload.get("runId").and_then(Value::as_str) else { return };
                if let Some(tx) = self.waiters.lock().await.remove(run_id) {
                    let success = payload.get("success").and_then(Value::as_bool).unwrap_or(false);
                    let response = payload.get("response").and_then(Value::as_str).map(String::from);
                    let _ = tx.send((success, response));
                }
            }
            _ => {}
        }
    }
}

const LOCAL_CLI_SESSION_KEY: &str = "cli:local";

async fn run_local_cli(prompt: Option<String>, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = Arc::new(load_config(config_path)?);
    let dir = data_dir(&config);
    let core = boot_core_services(config.clone(), &dir).await?;

    let stream = prompt.is_none();
    let frontend = CliFrontend::new(stream);
    connect_in_process(
        &core.hub,
        Registration::new("cli-frontend", "1").subscriptions(["run.delta", "run.completed"]),
        frontend.clone(),
    )
    .await?;

    match prompt {
        Some(task) => run_one_shot(&core, &frontend, &task).await,
        None => run_interactive(&core, &frontend).await,
    }
}

#[derive(Deserialize)]
struct RunAck {
    #[serde(rename = "runId")]
    run_id: String,
}

async fn submit_and_wait(
    client: &GatewayClient,
    frontend: &CliFrontend,
    session_key: &str,
    task: &str,
) -> anyhow::Result<(bool, Option<String>)> {
    let ack: RunAck = client
        .call("agent.run", json!({ "sessionKey": session_key, "task": task }), None)
        .await?;
    Ok(frontend.wait_for(&ack.run_id).await)
}

async fn run_one_shot(core: &CoreServices, frontend: &CliFrontend, task: &str) -> anyhow::Result<()> {
    let (success, response) = submit_and_wait(&core.agent_client, frontend, LOCAL_CLI_SESSION_KEY, task).await?;
    if let Some(text) = response {
        println!("{text}");
    }
    if !success {
        bail!("run did not complete successfully");
    }
    Ok(())
}

async fn run_interactive(core: &CoreServices, frontend: &CliFrontend) -> anyhow::Result<()> {
    use tokio::io::{AsyncBufReadExt, BufReader};

    println!("vargos — interactive session (session key `{LOCAL_CLI_SESSION_KEY}`). Ctrl-D to exit.");
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        print!("> ");
        {
            use std::io::Write;
            let _ = std::io::stdout().flush();
        }
        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (success, response) = submit_and_wait(&core.agent_client, frontend, LOCAL_CLI_SESSION_KEY, line).await?;
        println!();
        if !success {
            match response {
                Some(text) => eprintln!("(run failed) {text}"),
                None => eprintln!("(run failed)"),
            }
        }
    }

    Ok(())
}
