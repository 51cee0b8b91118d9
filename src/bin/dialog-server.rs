//! Broker entry point.

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dialog::{Server, ServerConfig, SqliteStore};

#[derive(Debug, Parser)]
#[command(name = "dialog-server", about = "Dialog messaging broker")]
struct Args {
    /// TOML configuration file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listener address, e.g. 127.0.0.1:5555.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// SQLite database path.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(db) = args.db {
        config.db_path = db;
    }

    info!(db = %config.db_path.display(), "opening store");
    let store = Arc::new(SqliteStore::open_with_ttl(
        &config.db_path,
        config.session_ttl(),
    )?);

    let server = Server::new(config, store.clone(), store);
    let listener = server.bind().await?;
    server.run(listener).await?;
    Ok(())
}
