//! botlink CLI.
//!
//! Talks to a running botlink server:
//!   botlink --identifier my-bot token
//!   BOTLINK_SHARED_SECRET=... botlink --identifier my-bot config
//!   BOTLINK_SHARED_SECRET=... botlink --url ws://host:8765 --identifier my-bot listen

use anyhow::Context;
use botlink_client::Client;
use botlink_core::generate_token;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "botlink", version, about = "Client for a botlink server")]
struct Cli {
    /// Server URL.
    #[arg(long, default_value = "ws://127.0.0.1:8765", env = "BOTLINK_URL")]
    url: String,

    /// Shared secret.
    #[arg(long, env = "BOTLINK_SHARED_SECRET", hide_env_values = true)]
    secret: String,

    /// Identifier ("public key part") the server expects.
    #[arg(long, env = "BOTLINK_IDENTIFIER")]
    identifier: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the handshake token for the secret and identifier.
    Token,
    /// Authenticate and ping the server.
    Ping,
    /// Print the server's configuration snapshot.
    Config,
    /// Print every broadcast until the server closes the connection.
    Listen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("botlink=warn".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Token => {
            println!("{}", generate_token(&cli.secret, &cli.identifier));
        }
        Command::Ping => {
            let mut client = connect(&cli).await?;
            let started = std::time::Instant::now();
            client.ping().await?;
            println!("pong in {:?}", started.elapsed());
            client.close().await?;
        }
        Command::Config => {
            let mut client = connect(&cli).await?;
            let config = client.get_config().await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            client.close().await?;
        }
        Command::Listen => {
            let mut client = connect(&cli).await?;
            while let Some(message) = client.recv_value().await? {
                println!("{message}");
            }
            tracing::info!("server closed the connection");
        }
    }
    Ok(())
}

async fn connect(cli: &Cli) -> anyhow::Result<Client> {
    Client::connect(&cli.url, &cli.secret, &cli.identifier)
        .await
        .with_context(|| format!("failed to connect to {}", cli.url))
}
