//! CLI entry point: starting the server, firing a one-shot task at a
//! running instance, checking status, and doctoring the local environment
//! (`adb` on PATH, config parses, port reachable).

mod action;
mod agent;
mod apps;
mod callbacks;
mod config;
mod device;
mod errors;
mod model;
mod server;
mod session;
mod store;
mod tracker;
mod types;

use crate::callbacks::{AutoApprove, AutoCancelTakeover};
use crate::config::Config;
use crate::device::connection::ConnectionManager;
use crate::device::DeviceIO;
use crate::model::ModelClient;
use crate::server::{build_router, AppState};
use crate::session::{Collaborators, SessionManager};
use crate::store::{FsBlobStore, InMemoryTaskStore};
use crate::types::AgentEvent;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "droidstep", version, about = "Drives an Android device through natural-language tasks")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP/WS server (default if no subcommand given).
    Run,
    /// Fire a one-shot task against a running instance and print its task id.
    Task {
        /// The natural-language instruction to run.
        description: Vec<String>,
    },
    /// Query a running instance's reachability and report nothing else.
    Status,
    /// Check the local environment: config parses, adb on PATH, port free.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "droidstep=info".into()))
        .init();

    let cli = Cli::parse();
    let config_path = Path::new(&cli.config);

    if matches!(cli.command, Some(Command::Doctor)) {
        return run_doctor(config_path);
    }

    let config = Config::load(config_path)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Status => run_status(&config).await,
        Command::Task { description } => run_task(&config, description.join(" ")).await,
        Command::Run | Command::Doctor => run_server(config).await,
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    info!(port = config.server.port, "starting droidstep");

    let spill_dir = std::env::temp_dir().join("droidstep-spill");
    std::fs::create_dir_all(&spill_dir)?;
    let blob_root = PathBuf::from("./screenshots");

    let collaborators = Collaborators {
        task_store: Arc::new(InMemoryTaskStore::new()),
        blob_store: Arc::new(FsBlobStore::new(blob_root)),
        model: Arc::new(ModelClient::new(config.model.clone())),
        apps: Arc::new(crate::apps::AppRegistry::new(&config.apps)),
        connections: Arc::new(ConnectionManager::new()),
        device: Arc::new(DeviceIO::new()),
        confirmation: Arc::new(AutoApprove),
        takeover: Arc::new(AutoCancelTakeover),
        spill_dir,
        default_agent_config: config.agent.clone(),
    };

    let sessions = SessionManager::new(collaborators);
    let state = AppState { sessions };
    let router = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn run_status(config: &Config) -> anyhow::Result<()> {
    let url = format!("http://127.0.0.1:{}/tasks", config.server.port);
    match reqwest::Client::new().get(&url).timeout(Duration::from_secs(2)).send().await {
        Ok(resp) if resp.status().is_success() => println!("droidstep: running on port {}", config.server.port),
        _ => println!("droidstep: not reachable on port {}", config.server.port),
    }
    Ok(())
}

/// Creates a session, subscribes to its event stream, fires the task, then
/// prints every `StepEvent` as it arrives until a `Terminal` event closes
/// the task out. Subscribing before `/start` avoids a race where the first
/// steps fire before the socket is open.
async fn run_task(config: &Config, description: String) -> anyhow::Result<()> {
    if description.is_empty() {
        println!("usage: droidstep task <description>");
        return Ok(());
    }
    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}", config.server.port);

    let session: serde_json::Value = client.post(format!("{base}/sessions")).send().await?.json().await?;
    let session_id = session["data"]["session_id"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("unexpected response creating session"))?
        .to_string();

    let ws_url = format!("ws://127.0.0.1:{}/sessions/{session_id}/ws", config.server.port);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url).await?;
    let (_, mut events) = ws_stream.split();

    let started: serde_json::Value = client
        .post(format!("{base}/sessions/{session_id}/start"))
        .json(&serde_json::json!({"description": description}))
        .send()
        .await?
        .json()
        .await?;

    let task_id = match started["data"]["task_id"].as_str() {
        Some(task_id) => task_id.to_string(),
        None => {
            println!("failed to start task: {}", started["error"].as_str().unwrap_or("unknown error"));
            return Ok(());
        }
    };
    println!("task started: {task_id}");

    while let Some(msg) = events.next().await {
        let Ok(WsMessage::Text(text)) = msg else { continue };
        let Ok(event) = serde_json::from_str::<AgentEvent>(&text) else { continue };
        let is_terminal = matches!(&event, AgentEvent::Terminal { task_id: t, .. } if *t == task_id);
        let is_disconnect = matches!(&event, AgentEvent::Disconnected { .. });
        print_event(&event);
        if is_terminal || is_disconnect {
            break;
        }
    }
    Ok(())
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::StepUpdate { step_number, thought, action, outcome, success, finished, .. } => {
            if let Some(thought) = thought {
                println!("[step {step_number}] thought: {thought}");
            }
            println!("[step {step_number}] {action} -> {outcome:?} (success={success}, finished={finished})");
        }
        AgentEvent::Overflow { dropped_count, .. } => {
            println!("[overflow] {dropped_count} step(s) dropped from the in-memory buffer");
        }
        AgentEvent::Terminal { status, message, .. } => {
            println!("[terminal] {status:?}: {message}");
        }
        AgentEvent::Disconnected { .. } => {
            println!("[disconnected] event stream closed before the task finished");
        }
    }
}

fn run_doctor(config_path: &Path) -> anyhow::Result<()> {
    println!("droidstep doctor\n");

    match Config::load(config_path) {
        Ok(config) => {
            println!("config: ok ({})", config_path.display());
            println!("  model endpoint: {}", config.model.endpoint);
            println!("  server: {}:{}", config.server.host, config.server.port);

            match std::net::TcpStream::connect_timeout(&format!("127.0.0.1:{}", config.server.port).parse()?, Duration::from_secs(1)) {
                Ok(_) => println!("server: listening on port {}", config.server.port),
                Err(_) => println!("server: not running on port {}", config.server.port),
            }
        }
        Err(e) => warn!("config: failed to load {}: {e}", config_path.display()),
    }

    match std::process::Command::new("adb").args(["devices"]).output() {
        Ok(out) => {
            let devices = String::from_utf8_lossy(&out.stdout);
            let connected = devices.lines().filter(|l| l.contains("\tdevice")).count();
            if connected > 0 {
                println!("adb: {connected} device(s) connected");
            } else {
                println!("adb: on PATH, no devices connected");
            }
        }
        Err(_) => error!("adb: not found in PATH"),
    }

    println!("\ndoctor complete");
    Ok(())
}
