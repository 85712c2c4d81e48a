//! Deferred propagation and the fixup worker

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use acld::acl::{AclProperties, AclTxn, AclType};
use acld::dao::AccessControlListDao;
use acld::fixup::{FixupSettings, FixupWorker};
use acld::locks::{InMemoryJobLocks, JobLocks, LockCallback, LockError};
use acld::nodes::{pending_fix_acl_aspect, NodeId};
use acld::Config;
use common::{allow, AclTest, TestTree};

fn zero_budget() -> Config {
    Config {
        fixup: FixupSettings {
            budget_ms: 0,
            interval_ms: 10,
            ..FixupSettings::default()
        },
        ..Config::default()
    }
}

async fn pending(t: &AclTest) -> Vec<NodeId> {
    let mut txn = t.txn().await;
    let nodes = t
        .nodes
        .nodes_with_aspect(&mut txn, &pending_fix_acl_aspect(), 0, 100)
        .await
        .unwrap();
    txn.commit().await.unwrap();
    nodes
}

/// Tree whose root ACL was pushed down in a zero-budget transaction
async fn deferred_tree(t: &AclTest) -> (TestTree, i64) {
    let mut txn = t.async_txn().await;
    let tree = t
        .build_tree(&mut txn, "SpacesStore", &["a", "a/b", "a/b/c", "d"])
        .await
        .unwrap();
    let root = t
        .engine
        .create_acl(
            &mut txn,
            AclProperties::new(AclType::Defining),
            &[allow("GROUP_EVERYONE", "Read")],
            None,
        )
        .await
        .unwrap();
    t.nodes
        .set_node_acl_id(&mut txn, tree.id(""), Some(root.id))
        .await
        .unwrap();
    t.permissions()
        .daos()
        .tree
        .set_inheritance_for_children(&mut txn, tree.root(), root.id, None)
        .await
        .unwrap();
    let shared = t
        .engine
        .get_inherited_access_control_list(&mut txn, root.id)
        .await
        .unwrap()
        .expect("root shared ACL");
    assert!(txn.async_required());
    let outcome = t.server.commit(txn).await.unwrap();
    assert!(outcome.async_required);
    (tree, shared)
}

async fn acl_of(t: &AclTest, tree: &TestTree, path: &str) -> Option<i64> {
    let mut txn: AclTxn = t.txn().await;
    let acl = t.nodes.get_node_acl_id(&mut txn, tree.id(path)).await.unwrap();
    txn.commit().await.unwrap();
    acl
}

#[tokio::test]
async fn test_zero_budget_converges_level_by_level() {
    let t = AclTest::with_config(zero_budget())
        .await
        .expect("Failed to start harness");
    let (tree, shared) = deferred_tree(&t).await;

    // Only the first level was written before the budget ran out
    assert_eq!(acl_of(&t, &tree, "a").await, Some(shared));
    assert_eq!(acl_of(&t, &tree, "a/b").await, None);
    assert_eq!(pending(&t).await, vec![tree.id("a"), tree.id("d")]);

    let report = t.server.fixup_worker().run_once().await.unwrap();
    assert_eq!(report.processed, 4);
    assert_eq!(report.failed, 0);
    assert!(!report.lock_lost);

    assert!(pending(&t).await.is_empty());
    for path in ["a", "a/b", "a/b/c", "d"] {
        assert_eq!(acl_of(&t, &tree, path).await, Some(shared), "{path}");
    }
}

#[tokio::test]
async fn test_zero_budget_defers_below_local_override() {
    let t = AclTest::with_config(zero_budget())
        .await
        .expect("Failed to start harness");
    let dao = t.permissions().daos().tree;

    // root -> a (own versioned ACL) -> a/b -> a/b/c, pushed down synchronously
    let mut txn = t.txn().await;
    let tree = t
        .build_tree(&mut txn, "SpacesStore", &["a", "a/b", "a/b/c"])
        .await
        .unwrap();
    let root = t
        .engine
        .create_acl(
            &mut txn,
            AclProperties::new(AclType::Defining),
            &[allow("GROUP_EVERYONE", "Read")],
            None,
        )
        .await
        .unwrap();
    t.nodes
        .set_node_acl_id(&mut txn, tree.id(""), Some(root.id))
        .await
        .unwrap();
    dao.set_inheritance_for_children(&mut txn, tree.root(), root.id, None)
        .await
        .unwrap();
    let root_shared = t
        .engine
        .get_inherited_access_control_list(&mut txn, root.id)
        .await
        .unwrap();
    let a = t
        .engine
        .create_acl(
            &mut txn,
            AclProperties::new(AclType::Defining).versioned(true),
            &[allow("alice", "Read")],
            Some(root.id),
        )
        .await
        .unwrap();
    t.nodes
        .set_node_acl_id(&mut txn, tree.id("a"), Some(a.id))
        .await
        .unwrap();
    dao.set_inheritance_for_children(&mut txn, tree.node("a"), a.id, root_shared)
        .await
        .unwrap();
    let old_shared = t
        .engine
        .get_inherited_access_control_list(&mut txn, a.id)
        .await
        .unwrap();
    txn.commit().await.unwrap();
    assert_eq!(acl_of(&t, &tree, "a/b/c").await, old_shared);

    // A new root ACL in a zero-budget transaction copies a's ACL on merge
    let mut txn = t.async_txn().await;
    let new_root = t
        .engine
        .create_acl(
            &mut txn,
            AclProperties::new(AclType::Defining),
            &[allow("carol", "Read")],
            None,
        )
        .await
        .unwrap();
    t.nodes
        .set_node_acl_id(&mut txn, tree.id(""), Some(new_root.id))
        .await
        .unwrap();
    dao.set_inheritance_for_children(&mut txn, tree.root(), new_root.id, root_shared)
        .await
        .unwrap();
    assert!(txn.async_required());
    t.server.commit(txn).await.unwrap();

    let merged = acl_of(&t, &tree, "a").await.expect("a keeps its own ACL");
    assert_ne!(merged, a.id);
    assert_eq!(pending(&t).await, vec![tree.id("a")]);
    assert_eq!(acl_of(&t, &tree, "a/b").await, old_shared);

    let report = t.server.fixup_worker().run_once().await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.failed, 0);
    assert!(pending(&t).await.is_empty());

    let mut txn = t.txn().await;
    let new_shared = t
        .engine
        .get_inherited_access_control_list(&mut txn, merged)
        .await
        .unwrap();
    txn.commit().await.unwrap();
    assert_ne!(new_shared, old_shared);
    for path in ["a/b", "a/b/c"] {
        assert_eq!(acl_of(&t, &tree, path).await, new_shared, "{path}");
    }

    let mut txn = t.txn().await;
    let readers = t
        .permissions()
        .get_readers(&mut txn, tree.node("a/b/c"))
        .await
        .unwrap();
    assert!(readers.contains("alice"));
    assert!(readers.contains("carol"));
    assert!(!readers.contains("GROUP_EVERYONE"));
}

/// Locks whose refresher reports the lock lost straight away
struct LosingLocks(InMemoryJobLocks);

#[async_trait]
impl JobLocks for LosingLocks {
    async fn get_lock(
        &self,
        resource: &str,
        ttl: Duration,
        wait: Duration,
        retries: u32,
    ) -> Result<String, LockError> {
        self.0.get_lock(resource, ttl, wait, retries).await
    }

    async fn refresh_lock(
        &self,
        token: &str,
        resource: &str,
        interval: Duration,
        callback: Arc<dyn LockCallback>,
    ) -> Result<(), LockError> {
        self.0.refresh_lock(token, resource, interval, callback.clone()).await?;
        callback.lock_released();
        Ok(())
    }

    async fn release_lock(&self, token: &str, resource: &str) -> Result<bool, LockError> {
        self.0.release_lock(token, resource).await
    }
}

#[tokio::test]
async fn test_lock_loss_stops_worker() {
    let t = AclTest::with_config(zero_budget())
        .await
        .expect("Failed to start harness");
    let (tree, _) = deferred_tree(&t).await;

    let worker = FixupWorker::new(
        t.server.db().pool().clone(),
        t.server.caches(),
        Arc::new(LosingLocks(InMemoryJobLocks::new())),
        t.server.config().fixup.clone(),
    );
    let report = worker.run_once().await.unwrap();
    assert!(report.lock_lost);
    assert_eq!(report.processed, 0);

    assert_eq!(pending(&t).await, vec![tree.id("a"), tree.id("d")]);
    assert_eq!(acl_of(&t, &tree, "a/b").await, None);
}

#[tokio::test]
async fn test_running_server_finishes_deferred_work() {
    // WAL file so the worker and this test can use the database concurrently
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        db_path: Some(dir.path().join("acld.db").to_string_lossy().into_owned()),
        ..zero_budget()
    };
    let t = AclTest::with_config(config)
        .await
        .expect("Failed to start harness");

    let server = t.server.clone();
    let handle = tokio::spawn(async move { server.run().await });

    let (tree, shared) = deferred_tree(&t).await;

    let mut converged = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if pending(&t).await.is_empty() && acl_of(&t, &tree, "a/b/c").await == Some(shared) {
            converged = true;
            break;
        }
    }
    assert!(converged, "fixup worker did not converge");

    t.server.shutdown();
    handle.await.unwrap().unwrap();
}
