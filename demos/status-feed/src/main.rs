//! Status feed example.
//!
//! Embeds a botlink server in a host process that publishes a status update
//! every second to every authenticated client, and answers `get_config`
//! from an in-memory snapshot.
//!
//! Run:
//!   cargo run -p botlink-demo-status-feed -- --port 8765
//!
//! Then, from another terminal:
//!   botlink --secret demo-secret --identifier demo listen

use botlink_server::{Credential, Server, ServerSettings, StaticSource};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("botlink_demo_status_feed=info".parse()?)
                .add_directive("botlink_server=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port = parse_arg(&args, "--port").unwrap_or(ServerSettings::DEFAULT_PORT);

    let snapshot = json!({
        "live": {"leverage": 5, "approved_coins": ["BTC", "ETH", "SOL"]},
        "interval_secs": 1,
    });
    let server = Server::bind(
        ServerSettings::new(([127, 0, 0, 1], port).into()),
        Credential::new("demo-secret", "demo"),
        Some(Arc::new(StaticSource(snapshot))),
    )
    .await?;

    let broadcaster = server.broadcaster();
    let registry = server.registry().clone();
    let feed = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut tick: u64 = 0;
        loop {
            interval.tick().await;
            tick += 1;
            let clients = registry.len().await;
            let status = json!({"type": "status", "tick": tick, "clients": clients});
            match broadcaster.broadcast(&status).await {
                Ok(report) if !report.failures.is_empty() => {
                    tracing::info!(tick, failed = report.failures.len(), "some clients missed the update");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "status broadcast failed"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    feed.abort();
    server.stop().await?;
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<u16> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}
