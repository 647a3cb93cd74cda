//! Bellows server binary.
//!
//! Usage:
//!     bellows-server --bind 0.0.0.0:8440 --public-url https://ci.example.com

use bellows_logging::{init_logging, LogConfig};
use bellows_server::{Server, ServerConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bellows-server", about = "Bellows CI control plane")]
struct Args {
    /// Listen address for HTTP and WebSocket traffic
    #[arg(long, default_value = "127.0.0.1:8440")]
    bind: SocketAddr,

    /// Data directory (database, job logs); defaults to ~/.bellows/data
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// SQLite database file; defaults to <data-dir>/bellows.db
    #[arg(long)]
    database: Option<PathBuf>,

    /// Externally reachable base URL used in relay ingress prefixes
    #[arg(long)]
    public_url: Option<String>,

    /// HS256 secret for user-signed connection tokens
    #[arg(long, env = "BELLOWS_TOKEN_SECRET")]
    token_secret: Option<String>,

    /// Raise logging to debug level for the bellows crates
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(LogConfig {
        app_name: "bellows-server",
        verbose: args.verbose,
    })?;

    let data_dir = args.data_dir.unwrap_or_else(bellows_logging::data_dir);
    let mut config = ServerConfig::with_defaults(args.bind, data_dir);
    if let Some(database) = args.database {
        config.database_path = database;
    }
    if let Some(public_url) = args.public_url {
        config.public_url = public_url.trim_end_matches('/').to_string();
    }
    config.token_secret = args.token_secret;

    tracing::info!("Starting Bellows control plane");
    tracing::info!("  Bind: {}", config.bind_addr);
    tracing::info!("  Database: {}", config.database_path.display());
    tracing::info!("  Public URL: {}", config.public_url);

    let server = Server::bind(config).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown.send(true);
        }
    });

    server.run().await
}
