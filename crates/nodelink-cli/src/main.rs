//! nodelink: run a Node.js project behind the bridge from a terminal.
//!
//! Inbound engine events are printed to stdout as one JSON object per line.
//! Each stdin line `<event> [json-args]` is sent to the engine as an application event.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use nodelink::{
    ChannelEvent, ChannelNotifier, EngineConfig, EngineSpawner, NodeEngine, NodeIpcSpawner,
    StdioSpawner,
};

#[derive(Debug, Parser)]
#[command(name = "nodelink", version, about = "Run a Node.js engine behind the nodelink bridge")]
struct Cli {
    /// Project directory, relative to `<APP_PATH>/app`.
    project_dir: String,

    /// Application root containing the `app` directory.
    #[arg(long, env = "NODELINK_APP_PATH", default_value = ".")]
    app_path: PathBuf,

    /// Node.js binary.
    #[arg(long, env = "NODELINK_NODE", default_value = "node")]
    node: String,

    /// Extra argument passed to node before the entry file (repeatable).
    #[arg(long = "node-arg", allow_hyphen_values = true)]
    node_args: Vec<String>,

    /// Extra module search directory appended to NODE_PATH (repeatable).
    #[arg(long = "module-path")]
    module_paths: Vec<PathBuf>,

    /// Run PROGRAM with the entry file as its last argument and talk over its
    /// stdin/stdout instead of a Node IPC channel.
    #[arg(long, value_name = "PROGRAM")]
    stdio: Option<String>,

    /// Give up if the engine is not ready after this many seconds.
    #[arg(long, value_name = "SECS")]
    ready_timeout: Option<u64>,
}

/// Initialize tracing with NODELINK_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("NODELINK_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "nodelink={level},nodelink::bridge::codec=warn",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    // stdout carries engine events, so logs go to stderr.
    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn build_spawner(cli: &Cli) -> Arc<dyn EngineSpawner> {
    match &cli.stdio {
        Some(program) => Arc::new(StdioSpawner::new(program)),
        None => Arc::new(
            NodeIpcSpawner::new()
                .with_node_binary(&cli.node)
                .with_args(&cli.node_args),
        ),
    }
}

/// Parse `<event> [json-args]`. Args default to an empty array.
fn parse_command(line: &str) -> Result<Option<(String, Value)>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (event, args) = match line.split_once(char::is_whitespace) {
        Some((event, rest)) => {
            let args: Value = serde_json::from_str(rest.trim())
                .with_context(|| format!("invalid JSON args for {event:?}"))?;
            (event, args)
        }
        None => (line, json!([])),
    };
    Ok(Some((event.to_string(), args)))
}

fn print_event(event: &ChannelEvent) {
    println!(
        "{}",
        json!({"event": event.event_name, "args": event.args})
    );
}

async fn wait_ready(engine: &NodeEngine, timeout: Option<u64>) -> Result<()> {
    let ready = engine.resolve_when_ready();
    match timeout {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), ready).await {
            Ok(result) => result.context("engine failed to become ready"),
            Err(_) => bail!("engine not ready after {secs}s"),
        },
        None => ready.await.context("engine failed to become ready"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    info!("nodelink {}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::new(&cli.app_path)
        .with_module_paths(cli.module_paths.iter().cloned())
        .with_spawner(build_spawner(&cli));
    let (notifier, mut events) = ChannelNotifier::new();
    let engine = NodeEngine::new(config, notifier);

    engine
        .start_engine(&cli.project_dir)
        .await
        .with_context(|| format!("failed to start engine for project {:?}", cli.project_dir))?;

    tokio::select! {
        result = wait_ready(&engine, cli.ready_timeout) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted before the engine became ready");
            return Ok(());
        }
    }
    info!(pid = ?engine.pid(), "Engine ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event),
            line = lines.next_line(), if stdin_open => match line.context("failed to read stdin")? {
                Some(line) => match parse_command(&line) {
                    Ok(Some((event, args))) => {
                        if let Err(e) = engine.emit(event, args) {
                            warn!(error = %e, "Failed to send event");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Ignoring input line"),
                },
                None => {
                    info!("stdin closed, still relaying engine events");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping engine");
                break;
            }
        }
    }

    Ok(())
}
