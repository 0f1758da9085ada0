// ABOUTME: Operator CLI for the elemental orchestrator gateway.
// ABOUTME: Exit codes: 0 ok, 1 general, 2 invalid arguments (clap), 3 not found, 4 validation.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;

const DEFAULT_GATEWAY: &str = "http://127.0.0.1:7420";
const DEFAULT_STORE: &str = "http://127.0.0.1:7410";

const EXIT_OK: i32 = 0;
const EXIT_GENERAL: i32 = 1;
const EXIT_NOT_FOUND: i32 = 3;
const EXIT_VALIDATION: i32 = 4;

#[derive(Parser)]
#[command(name = "elemental")]
#[command(about = "Operator CLI for the elemental agent orchestrator")]
#[command(version)]
struct Cli {
    /// Gateway base URL
    #[arg(long, global = true, env = "ELEMENTAL_GATEWAY", default_value = DEFAULT_GATEWAY)]
    gateway: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server
    Serve {
        /// HTTP bind address
        #[arg(long, default_value = "127.0.0.1:7420")]
        addr: String,

        /// Element store service URL
        #[arg(long, env = "ELEMENTAL_STORE", default_value = DEFAULT_STORE)]
        store_url: String,

        /// Path to orchestrator.toml
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Agent session commands
    #[command(subcommand)]
    Agent(AgentCommands),

    /// Dispatch daemon commands
    #[command(subcommand)]
    Dispatch(DispatchCommands),

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Start (or resume) a session for an agent
    Start {
        agent_id: String,

        /// Initial prompt for the first user turn
        #[arg(short, long)]
        prompt: Option<String>,

        /// Resume the most recent resumable session
        #[arg(long)]
        resume: bool,

        /// Agent role: director, worker, or steward
        #[arg(long, default_value = "worker")]
        role: String,
    },

    /// Stop an agent's current session
    Stop {
        agent_id: String,

        /// Kill immediately instead of a graceful shutdown
        #[arg(long)]
        force: bool,
    },

    /// Send a message to an agent's current session
    Message { agent_id: String, content: String },

    /// Follow an agent's event stream (SSE) on stdout
    Stream { agent_id: String },
}

#[derive(Subcommand)]
enum DispatchCommands {
    /// Kick the dispatch loop ahead of its next tick
    PollNow,
}

#[tokio::main]
async fn main() {
    elemental_log::init();
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    match cli.command {
        Commands::Serve {
            addr,
            store_url,
            config,
        } => serve(addr, store_url, config).await,
        Commands::Agent(cmd) => agent(&cli.gateway, cmd).await,
        Commands::Dispatch(DispatchCommands::PollNow) => {
            post_json(
                &cli.gateway,
                "/dispatch/poll-now",
                "dispatch poll-now",
                serde_json::json!({}),
            )
            .await
        }
        Commands::Version => {
            println!("elemental {}", env!("CARGO_PKG_VERSION"));
            EXIT_OK
        }
    }
}

async fn serve(addr: String, store_url: String, config: Option<PathBuf>) -> i32 {
    let orchestrator = match elemental_core::OrchestratorConfig::load(config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: serve failed: config: {e:#}");
            return EXIT_VALIDATION;
        }
    };
    let store = match elemental_serve::HttpTaskStore::new(&store_url) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("error: serve failed: {}: {e}", e.kind());
            return EXIT_GENERAL;
        }
    };
    let serve_config = elemental_serve::ServeConfig {
        http_addr: addr,
        orchestrator,
    };
    match elemental_serve::run(serve_config, store).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("error: serve failed: {e:#}");
            EXIT_GENERAL
        }
    }
}

async fn agent(gateway: &str, cmd: AgentCommands) -> i32 {
    match cmd {
        AgentCommands::Start {
            agent_id,
            prompt,
            resume,
            role,
        } => {
            let body = serde_json::json!({
                "initial_prompt": prompt,
                "resume": resume,
                "role": role,
            });
            post_json(
                gateway,
                &format!("/agents/{agent_id}/start"),
                "agent start",
                body,
            )
            .await
        }
        AgentCommands::Stop { agent_id, force } => {
            let body = serde_json::json!({ "graceful": !force });
            post_json(
                gateway,
                &format!("/agents/{agent_id}/stop"),
                "agent stop",
                body,
            )
            .await
        }
        AgentCommands::Message { agent_id, content } => {
            let body = serde_json::json!({ "content": content });
            post_json(
                gateway,
                &format!("/agents/{agent_id}/message"),
                "agent message",
                body,
            )
            .await
        }
        AgentCommands::Stream { agent_id } => stream(gateway, &agent_id).await,
    }
}

/// POST a JSON body, print the response, and map the outcome to an exit code.
async fn post_json(gateway: &str, path: &str, operation: &str, body: serde_json::Value) -> i32 {
    let client = reqwest::Client::new();
    let response = match client
        .post(format!("{gateway}{path}"))
        .json(&body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            eprintln!("error: {operation} failed: upstream_unavailable: {e}");
            return EXIT_GENERAL;
        }
    };

    let status = response.status();
    let payload: serde_json::Value = response.json().await.unwrap_or_default();
    if status.is_success() {
        if !payload.is_null() && payload != serde_json::json!({}) {
            println!("{payload}");
        }
        return EXIT_OK;
    }

    let kind = payload["error"]["kind"].as_str().unwrap_or("internal");
    let message = payload["error"]["message"].as_str().unwrap_or("unknown error");
    eprintln!("error: {operation} failed: {kind}: {message}");
    exit_code_for(status.as_u16())
}

/// Follow an SSE stream, writing records to stdout as they arrive.
async fn stream(gateway: &str, agent_id: &str) -> i32 {
    let client = reqwest::Client::new();
    let response = match client
        .get(format!("{gateway}/agents/{agent_id}/stream"))
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            eprintln!("error: agent stream failed: upstream_unavailable: {e}");
            return EXIT_GENERAL;
        }
    };
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let payload: serde_json::Value = response.json().await.unwrap_or_default();
        let kind = payload["error"]["kind"].as_str().unwrap_or("internal");
        eprintln!("error: agent stream failed: {kind}");
        return exit_code_for(status);
    }

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => print!("{}", String::from_utf8_lossy(&bytes)),
            Err(e) => {
                eprintln!("error: agent stream interrupted: {e}");
                return EXIT_GENERAL;
            }
        }
    }
    EXIT_OK
}

fn exit_code_for(status: u16) -> i32 {
    match status {
        404 => EXIT_NOT_FOUND,
        409 | 422 => EXIT_VALIDATION,
        _ => EXIT_GENERAL,
    }
}
