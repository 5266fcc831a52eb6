//! sharplet: serve scene prediction over HTTP or MCP.

use std::process;
use std::sync::Arc;

use anyhow::Context;
use sharplet::transport::mcp::serve_stdio;
use sharplet::{
    ArtifactStore, Config, ResourceManager, SceneService, VersionInfo, WorkerLoader, WorkerModel,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Http,
    Mcp,
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    mode: Mode,
    host: Option<String>,
    port: Option<u16>,
}

fn usage() {
    eprintln!("Usage: sharplet [serve|mcp] [--host <addr>] [--port <port>]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  serve            HTTP API (default)");
    eprintln!("  mcp              MCP tool server on stdin/stdout");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --host <addr>    Bind address [env: HOST, default: 0.0.0.0]");
    eprintln!("  --port <port>    Bind port [env: PORT, default: 8080]");
    eprintln!();
    eprintln!("Model residency is configured through GPU_IDLE_TIMEOUT, GPU_IDLE_POLL_INTERVAL,");
    eprintln!("MODEL_PATH, OUTPUT_DIR, SHARPLET_WORKER_CMD and SHARPLET_DEVICE.");
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut mode = None;
    let mut host = None;
    let mut port = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                host = Some(args.get(i).ok_or("--host requires a value")?.clone());
            }
            "--port" => {
                i += 1;
                let value = args.get(i).ok_or("--port requires a value")?;
                port = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid port: {value}"))?,
                );
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if mode.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                mode = Some(match arg {
                    "serve" => Mode::Http,
                    "mcp" => Mode::Mcp,
                    other => return Err(format!("unknown command: {other}")),
                });
            }
        }
        i += 1;
    }

    Ok(Args {
        mode: mode.unwrap_or(Mode::Http),
        host,
        port,
    })
}

/// Logs always go to stderr; stdout carries the MCP session.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("SHARPLET_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("sharplet={level},sharplet_server={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

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

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let artifacts = ArtifactStore::new(&config.output_dir);
    artifacts.ensure_root().await.with_context(|| {
        format!(
            "failed to create output directory {}",
            config.output_dir.display()
        )
    })?;

    let manager = ResourceManager::<WorkerModel>::new(config.manager_config());
    let loader = Arc::new(WorkerLoader::new(config.worker_loader_config()?));
    let service = Arc::new(
        SceneService::new(manager, loader, artifacts)
            .with_version(VersionInfo::new().with_worker(&config.worker_command)),
    );

    info!(
        mode = ?args.mode,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        poll_interval_secs = config.poll_interval.as_secs(),
        output_dir = %config.output_dir.display(),
        worker = %config.worker_command,
        device = ?config.device,
        "Starting sharplet"
    );

    match args.mode {
        Mode::Http => sharplet::transport::serve(config.server_config(), service).await,
        Mode::Mcp => {
            let result = serve_stdio(service.clone()).await;
            service.shutdown().await;
            result
        }
    }
}

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            usage();
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "sharplet exited with an error");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}
