//! acld_patch - One-shot conversion of legacy ACLs
//!
//! Converts OLD ACLs and unset nodes in every tree and layered store to the
//! shared model, then prints the per-kind counts.

use std::path::PathBuf;

use anyhow::{bail, Result};
use acld::acl::{AclCaches, AclTxn};
use acld::db::Database;
use acld::permissions::PermissionManager;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Legacy ACL migration tool
#[derive(Parser, Debug)]
#[command(
    name = "acld_patch",
    version,
    about = "Convert legacy ACLs to shared inheritance"
)]
struct Args {
    /// Path to the SQLite database to patch (must exist)
    #[arg(short, long)]
    database: PathBuf,

    /// Report the counts without committing
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "acld=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if !args.database.exists() {
        bail!("Database not found: {}", args.database.display());
    }
    let path = args
        .database
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid database path: {}", args.database.display()))?;

    let db = Database::new(Some(path)).await?;
    let mut txn = AclTxn::begin(db.pool(), AclCaches::shared()).await?;
    let counters = PermissionManager::new().patch_acls(&mut txn).await?;

    if args.dry_run {
        txn.rollback().await?;
        info!("Dry run, changes rolled back");
    } else {
        txn.commit().await?;
    }

    for (kind, count) in counters.iter() {
        println!("{:<10} {}", kind.as_str(), count);
    }
    println!("{:<10} {}", "TOTAL", counters.total());
    Ok(())
}
