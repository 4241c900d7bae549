//! botlink daemon.
//!
//! Hosts a botlink server configured from a TOML file and serves a snapshot
//! file to authenticated clients.
//!
//! Run:
//!   botlink-daemon --config botlink.toml
//!   tail -F status.jsonl | botlink-daemon --config botlink.toml --broadcast-stdin

use anyhow::Context;
use botlink_daemon::forward::run_forwarder;
use botlink_daemon::{DaemonConfig, FileSource};
use botlink_server::{ConfigSource, Server};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "botlink-daemon", version, about = "Authenticated WebSocket broadcast server")]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "botlink.toml")]
    config: PathBuf,

    /// Override `server.host`.
    #[arg(long)]
    host: Option<String>,

    /// Override `server.port`.
    #[arg(long)]
    port: Option<u16>,

    /// Shared secret; takes precedence over `auth.shared_secret`.
    #[arg(long, env = "BOTLINK_SHARED_SECRET", hide_env_values = true)]
    shared_secret: Option<String>,

    /// Broadcast every JSON object read from stdin (one per line).
    #[arg(long)]
    broadcast_stdin: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("botlink_daemon=info".parse()?)
                .add_directive("botlink_server=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = DaemonConfig::load(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let settings = config.settings().await?;
    let credential = config.credential(args.shared_secret)?;
    let source = config.snapshot.path.clone().map(|path| {
        tracing::info!("serving configuration snapshot from {}", path.display());
        Arc::new(FileSource::new(path)) as Arc<dyn ConfigSource>
    });
    if source.is_none() {
        tracing::warn!("no snapshot.path configured; get_config requests will fail");
    }

    let server = Server::bind(settings, credential, source)
        .await
        .context("failed to start server")?;

    let forwarder = args
        .broadcast_stdin
        .then(|| {
            let stdin = BufReader::new(tokio::io::stdin());
            tokio::spawn(run_forwarder(stdin, server.broadcaster()))
        });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    server.stop().await?;
    Ok(())
}
