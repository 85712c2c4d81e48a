//! acld - ACL daemon running the deferred fixup worker

use std::path::PathBuf;

use anyhow::Result;
use acld::{Config, Server};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Shared ACL daemon
#[derive(Parser, Debug)]
#[command(name = "acld", version, about = "Run the ACL fixup daemon")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database file, overriding the configuration
    #[arg(short, long)]
    database: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "acld=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let mut config = Config::load(args.config.as_deref())?;
    if args.database.is_some() {
        config.db_path = args.database;
    }

    let server = Server::new(config).await?;
    let run = server.run();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            server.shutdown();
            run.await?;
        }
    }

    Ok(())
}
