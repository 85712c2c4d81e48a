//! Deferred ACL fixup worker
//!
//! When inheritance propagation runs out of budget, the tree DAO tags the
//! unfinished subtrees with the pending-fix aspect. This worker picks those
//! nodes up under a cluster lock and finishes the propagation, one node per
//! transaction:
//! - scheduled on a fixed interval, or woken early by [`FixupHandle::trigger`]
//! - skips the cycle when another worker holds the lock
//! - stops as soon as its lock refresher reports the lock lost

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::acl::txn::CommitOutcome;
use crate::acl::{AclCaches, AclId, AclTxn};
use crate::dao::{AccessControlListDao, TreeAclDao};
use crate::error::AclError;
use crate::locks::{JobLocks, LockCallback, LockError};
use crate::nodes::{
    inherit_from_property, pending_fix_acl_aspect, shared_acl_to_replace_property, NodeId,
    NodeStore,
};

/// Cluster lock guarding the worker
pub const LOCK_RESOURCE: &str = "AclFixup";

/// Worker tuning, read from the `fixup` config section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixupSettings {
    /// Wall-clock budget per transaction before propagation is deferred
    pub budget_ms: u64,
    /// Pending nodes fetched per query
    pub batch_size: i64,
    pub lock_ttl_ms: u64,
    pub lock_refresh_ms: u64,
    pub lock_wait_ms: u64,
    pub lock_retries: u32,
    /// Delay between scheduled runs
    pub interval_ms: u64,
}

impl Default for FixupSettings {
    fn default() -> Self {
        Self {
            budget_ms: 10_000,
            batch_size: 100,
            lock_ttl_ms: 10_000,
            lock_refresh_ms: 5_000,
            lock_wait_ms: 0,
            lock_retries: 0,
            interval_ms: 60_000,
        }
    }
}

impl FixupSettings {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_refresh(&self) -> Duration {
        Duration::from_millis(self.lock_refresh_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Outcome of one worker run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixupReport {
    /// Nodes whose pending fix was completed
    pub processed: usize,
    /// Nodes left tagged after an error
    pub failed: usize,
    /// Another worker held the lock
    pub skipped: bool,
    /// The lock was lost mid-run
    pub lock_lost: bool,
}

/// Refresher state shared with the lock implementation
#[derive(Debug, Default)]
struct RefreshState {
    done: AtomicBool,
    lost: AtomicBool,
}

impl RefreshState {
    fn lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn finish(&self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

impl LockCallback for RefreshState {
    fn is_active(&self) -> bool {
        !self.done.load(Ordering::SeqCst) && !self.lost()
    }

    fn lock_released(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }
}

/// Finishes deferred inheritance propagation
pub struct FixupWorker {
    pool: SqlitePool,
    caches: Arc<AclCaches>,
    locks: Arc<dyn JobLocks>,
    dao: TreeAclDao,
    nodes: NodeStore,
    settings: FixupSettings,
}

impl std::fmt::Debug for FixupWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixupWorker")
            .field("settings", &self.settings)
            .finish()
    }
}

impl FixupWorker {
    pub fn new(
        pool: SqlitePool,
        caches: Arc<AclCaches>,
        locks: Arc<dyn JobLocks>,
        settings: FixupSettings,
    ) -> Self {
        Self {
            pool,
            caches,
            locks,
            dao: TreeAclDao::new(),
            nodes: NodeStore::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &FixupSettings {
        &self.settings
    }

    /// Process pending nodes until none are left, the lock is lost, or only failures remain
    pub async fn run_once(&self) -> Result<FixupReport, AclError> {
        let token = match self
            .locks
            .get_lock(
                LOCK_RESOURCE,
                self.settings.lock_ttl(),
                self.settings.lock_wait(),
                self.settings.lock_retries,
            )
            .await
        {
            Ok(token) => token,
            Err(LockError::Held { .. }) => {
                debug!("ACL fixup lock held elsewhere, skipping run");
                return Ok(FixupReport {
                    skipped: true,
                    ..FixupReport::default()
                });
            }
            Err(e) => return Err(e.into()),
        };

        let state = Arc::new(RefreshState::default());
        if let Err(e) = self
            .locks
            .refresh_lock(
                &token,
                LOCK_RESOURCE,
                self.settings.lock_refresh(),
                state.clone(),
            )
            .await
        {
            self.locks.release_lock(&token, LOCK_RESOURCE).await?;
            return Err(e.into());
        }

        let result = self.fix_pending(&state).await;
        state.finish();
        if !state.lost() {
            self.locks.release_lock(&token, LOCK_RESOURCE).await?;
        }

        let report = result?;
        if report.processed > 0 || report.failed > 0 || report.lock_lost {
            info!(
                processed = report.processed,
                failed = report.failed,
                lock_lost = report.lock_lost,
                "ACL fixup run complete"
            );
        }
        Ok(report)
    }

    async fn fix_pending(&self, state: &RefreshState) -> Result<FixupReport, AclError> {
        let mut report = FixupReport::default();
        let mut failed: HashSet<NodeId> = HashSet::new();

        loop {
            if state.lost() {
                report.lock_lost = true;
                break;
            }
            let batch = self.pending_batch(&failed).await?;
            if batch.is_empty() {
                break;
            }

            for node in batch {
                if state.lost() {
                    warn!("ACL fixup lock lost, stopping");
                    report.lock_lost = true;
                    return Ok(report);
                }
                match self.fix_node(node, state).await {
                    Ok(Some(outcome)) => {
                        report.processed += 1;
                        debug!(node, deferred = outcome.async_required, "Fixed pending ACL node");
                    }
                    Ok(None) => {
                        report.lock_lost = true;
                        return Ok(report);
                    }
                    Err(e) => {
                        warn!(node, error = %e, "Failed to fix pending ACL node");
                        failed.insert(node);
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Next batch of tagged nodes, skipping those that already failed this run
    async fn pending_batch(&self, failed: &HashSet<NodeId>) -> Result<Vec<NodeId>, AclError> {
        let aspect = pending_fix_acl_aspect();
        let limit = self.settings.batch_size.max(1);
        let mut txn = AclTxn::begin(&self.pool, self.caches.clone()).await?;

        let mut batch = Vec::new();
        let mut after = 0;
        loop {
            let page = self
                .nodes
                .nodes_with_aspect(&mut txn, &aspect, after, limit)
                .await?;
            let exhausted = (page.len() as i64) < limit;
            if let Some(last) = page.last() {
                after = *last;
            }
            batch.extend(page.into_iter().filter(|node| !failed.contains(node)));
            if exhausted || batch.len() as i64 >= limit {
                break;
            }
        }
        txn.commit().await?;
        batch.truncate(limit as usize);
        Ok(batch)
    }

    /// Resume propagation below one tagged node in its own transaction
    ///
    /// Returns `None` without committing when the lock was lost while the
    /// node was being fixed.
    async fn fix_node(
        &self,
        node: NodeId,
        state: &RefreshState,
    ) -> Result<Option<CommitOutcome>, AclError> {
        let mut txn = AclTxn::begin(&self.pool, self.caches.clone())
            .await?
            .with_budget(self.settings.budget())
            .allow_async(true);

        match self.fix_node_in(&mut txn, node).await {
            Ok(()) if state.lost() => {
                warn!(node, "ACL fixup lock lost, rolling back");
                txn.rollback().await?;
                Ok(None)
            }
            Ok(()) => txn.commit().await.map(Some),
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    warn!(node, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn fix_node_in(&self, txn: &mut AclTxn, node: NodeId) -> Result<(), AclError> {
        let inherit_from: Option<AclId> = self
            .nodes
            .get_property(txn, node, &inherit_from_property())
            .await?
            .and_then(|v| v.as_i64());
        let shared_to_replace: Option<AclId> = self
            .nodes
            .get_property(txn, node, &shared_acl_to_replace_property())
            .await?
            .and_then(|v| v.as_i64());

        match inherit_from {
            Some(inherit_from) => {
                let node_ref = self.nodes.node_ref(txn, node).await?;
                self.dao
                    .set_inheritance_for_children(txn, &node_ref, inherit_from, shared_to_replace)
                    .await?;
            }
            None => warn!(node, "Pending ACL node has no inheritFrom, clearing"),
        }

        self.nodes
            .remove_aspect(txn, node, &pending_fix_acl_aspect())
            .await?;
        self.nodes
            .remove_property(txn, node, &inherit_from_property())
            .await?;
        self.nodes
            .remove_property(txn, node, &shared_acl_to_replace_property())
            .await
    }

    /// Run on `settings.interval` until shut down
    pub fn spawn(self: Arc<Self>) -> FixupHandle {
        let trigger = Arc::new(Notify::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.settings.interval();
        let notify = trigger.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = notify.notified() => {}
                    _ = shutdown_rx.changed() => break,
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                if let Err(e) = self.run_once().await {
                    warn!(error = %e, "ACL fixup run failed");
                }
            }
            debug!("ACL fixup worker stopped");
        });

        FixupHandle {
            trigger,
            shutdown_tx,
            join,
        }
    }
}

/// Control handle for a spawned [`FixupWorker`]
#[derive(Debug)]
pub struct FixupHandle {
    trigger: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl FixupHandle {
    /// Wake the worker now, e.g. after a commit that deferred propagation
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop the worker and wait for the current run to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "ACL fixup worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AclEngine, AclProperties, AclType};
    use crate::db::test_utils::{test_pool, test_txn};
    use crate::locks::InMemoryJobLocks;
    use crate::nodes::StoreRef;

    #[tokio::test]
    async fn test_run_without_pending_nodes() {
        let pool = test_pool().await;
        let locks = InMemoryJobLocks::shared();
        let worker = FixupWorker::new(pool, AclCaches::shared(), locks.clone(), FixupSettings::default());

        let report = worker.run_once().await.unwrap();
        assert_eq!(report, FixupReport::default());
        assert!(!locks.is_locked(LOCK_RESOURCE));
    }

    #[tokio::test]
    async fn test_skips_when_lock_held() {
        let pool = test_pool().await;
        let locks = InMemoryJobLocks::shared();
        locks
            .get_lock(LOCK_RESOURCE, Duration::from_secs(30), Duration::ZERO, 0)
            .await
            .unwrap();
        let worker = FixupWorker::new(pool, AclCaches::shared(), locks, FixupSettings::default());

        let report = worker.run_once().await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn test_lost_lock_rolls_back_node() {
        let pool = test_pool().await;
        let engine = AclEngine::new();
        let nodes = NodeStore::new();
        let dao = TreeAclDao::new();

        let mut txn = test_txn(&pool)
            .await
            .with_budget(Duration::ZERO)
            .allow_async(true);
        let root = nodes
            .create_store(&mut txn, &StoreRef::workspace("SpacesStore"))
            .await
            .unwrap();
        let a = nodes.create_node(&mut txn, root, "a").await.unwrap();
        let b = nodes.create_node(&mut txn, a, "b").await.unwrap();
        let acl = engine
            .create_acl(&mut txn, AclProperties::new(AclType::Defining), &[], None)
            .await
            .unwrap();
        nodes.set_node_acl_id(&mut txn, root, Some(acl.id)).await.unwrap();
        let root_ref = nodes.node_ref(&mut txn, root).await.unwrap();
        dao.set_inheritance_for_children(&mut txn, &root_ref, acl.id, None)
            .await
            .unwrap();
        assert!(txn.async_required());
        txn.commit().await.unwrap();

        let worker = FixupWorker::new(
            pool.clone(),
            AclCaches::shared(),
            InMemoryJobLocks::shared(),
            FixupSettings::default(),
        );
        let state = RefreshState::default();
        state.lock_released();
        assert!(worker.fix_node(a, &state).await.unwrap().is_none());

        let mut txn = test_txn(&pool).await;
        let pending = nodes
            .nodes_with_aspect(&mut txn, &pending_fix_acl_aspect(), 0, 10)
            .await
            .unwrap();
        assert_eq!(pending, vec![a]);
        assert_eq!(nodes.get_node_acl_id(&mut txn, b).await.unwrap(), None);
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawned_worker_shuts_down() {
        let pool = test_pool().await;
        let settings = FixupSettings {
            interval_ms: 10,
            ..FixupSettings::default()
        };
        let worker = Arc::new(FixupWorker::new(
            pool,
            AclCaches::shared(),
            InMemoryJobLocks::shared(),
            settings,
        ));
        let handle = worker.spawn();
        handle.trigger();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown().await;
    }
}
