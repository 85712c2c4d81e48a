//! acld - shared ACL inheritance and copy-on-write versioning daemon
//!
//! ACLs are versioned entities whose entries are copied down inheritance
//! chains at increasing depth. Nodes in a tree store or a layered store point
//! at ACL ids; the per-backend DAOs keep those pointers in step as ACLs are
//! rewritten, and a background worker finishes propagation that ran out of
//! transaction budget.

pub mod acl;
pub mod dao;
pub mod db;
pub mod error;
pub mod fixup;
pub mod layered;
pub mod locks;
pub mod migration;
pub mod nodes;
pub mod permissions;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use acl::{AclCaches, AclTxn};
use db::Database;
use fixup::{FixupHandle, FixupSettings, FixupWorker};
use locks::{InMemoryJobLocks, JobLocks};
use permissions::PermissionManager;

/// Boxed future for recursive async walks
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Environment variable prefix; nested keys are separated by `__`
pub const ENV_PREFIX: &str = "ACLD_";

/// Daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file; None = in-memory
    pub db_path: Option<String>,
    pub fixup: FixupSettings,
}

impl Config {
    /// Layer defaults, then the TOML file at `path` if given, then `ACLD_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract()
    }
}

/// The acld server instance
pub struct Server {
    config: Config,
    db: Arc<Database>,
    caches: Arc<AclCaches>,
    locks: Arc<dyn JobLocks>,
    permissions: Arc<PermissionManager>,
    fixup: Mutex<Option<FixupHandle>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Create a new server instance
    pub async fn new(config: Config) -> Result<Self> {
        let db = Database::new(config.db_path.as_deref()).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            db: Arc::new(db),
            caches: AclCaches::shared(),
            locks: InMemoryJobLocks::shared(),
            permissions: PermissionManager::shared(),
            fixup: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Get the database handle
    pub fn db(&self) -> Arc<Database> {
        self.db.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn permissions(&self) -> Arc<PermissionManager> {
        self.permissions.clone()
    }

    pub fn caches(&self) -> Arc<AclCaches> {
        self.caches.clone()
    }

    pub fn locks(&self) -> Arc<dyn JobLocks> {
        self.locks.clone()
    }

    /// Begin a transaction on the server's pool and caches
    ///
    /// With `async_call`, propagation that outlives the configured budget
    /// is handed to the fixup worker.
    pub async fn begin(&self, async_call: bool) -> Result<AclTxn> {
        let txn = AclTxn::begin(self.db.pool(), self.caches.clone())
            .await?
            .with_budget(self.config.fixup.budget())
            .allow_async(async_call);
        Ok(txn)
    }

    /// Commit `txn`, waking the fixup worker if work was deferred
    pub async fn commit(&self, txn: AclTxn) -> Result<acl::txn::CommitOutcome> {
        let outcome = txn.commit().await?;
        if outcome.async_required {
            if let Some(handle) = self.fixup.lock().as_ref() {
                handle.trigger();
            }
        }
        Ok(outcome)
    }

    /// Build a fixup worker over this server's pool, caches and locks
    pub fn fixup_worker(&self) -> FixupWorker {
        FixupWorker::new(
            self.db.pool().clone(),
            self.caches.clone(),
            self.locks.clone(),
            self.config.fixup.clone(),
        )
    }

    /// Run the fixup worker until shutdown
    pub async fn run(&self) -> Result<()> {
        let handle = Arc::new(self.fixup_worker()).spawn();
        *self.fixup.lock() = Some(handle);
        info!(
            interval_ms = self.config.fixup.interval_ms,
            budget_ms = self.config.fixup.budget_ms,
            "acld running"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        let handle = self.fixup.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        info!("acld shutdown complete");
        Ok(())
    }

    /// Signal the server to shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
