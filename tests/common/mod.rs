//! Common test utilities - AclTest harness over an in-memory server

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use acld::acl::{
    AccessControlEntry, AccessStatus, AclEngine, AclTxn, PermissionReference, QName,
};
use acld::layered::LayeredStore;
use acld::nodes::{NodeId, NodeRef, NodeStore, StoreRef};
use acld::permissions::PermissionManager;
use acld::{Config, Server};

pub const TEST_NAMESPACE: &str = "urn:acld:test";

/// Test harness wrapping a server with its own in-memory database
pub struct AclTest {
    pub server: Arc<Server>,
    pub engine: AclEngine,
    pub nodes: NodeStore,
    pub layered: LayeredStore,
}

impl AclTest {
    /// Start a harness with default configuration
    pub async fn start() -> Result<Self> {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Result<Self> {
        let server = Arc::new(Server::new(config).await?);
        Ok(Self {
            server,
            engine: AclEngine::new(),
            nodes: NodeStore::new(),
            layered: LayeredStore::new(),
        })
    }

    pub fn permissions(&self) -> Arc<PermissionManager> {
        self.server.permissions()
    }

    /// Synchronous transaction: propagation always completes in place
    pub async fn txn(&self) -> AclTxn {
        self.server
            .begin(false)
            .await
            .expect("Failed to begin transaction")
    }

    /// Transaction that may defer propagation to the fixup worker
    pub async fn async_txn(&self) -> AclTxn {
        self.server
            .begin(true)
            .await
            .expect("Failed to begin transaction")
    }

    /// Create a workspace store and nodes for slash-separated `paths`
    ///
    /// Parents must be listed before their children; the root is keyed `""`.
    pub async fn build_tree(
        &self,
        txn: &mut AclTxn,
        store: &str,
        paths: &[&str],
    ) -> Result<TestTree> {
        let root = self
            .nodes
            .create_store(txn, &StoreRef::workspace(store))
            .await?;
        let mut ids = HashMap::from([(String::new(), root)]);
        for path in paths {
            let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
            let parent_id = *ids
                .get(parent)
                .ok_or_else(|| anyhow::anyhow!("parent of {path} not created"))?;
            let id = self.nodes.create_node(txn, parent_id, name).await?;
            ids.insert(path.to_string(), id);
        }

        let mut refs = HashMap::new();
        for (path, id) in &ids {
            refs.insert(path.clone(), self.nodes.node_ref(txn, *id).await?);
        }
        Ok(TestTree { ids, refs })
    }
}

/// Nodes created by [`AclTest::build_tree`], keyed by path
#[derive(Debug, Clone)]
pub struct TestTree {
    ids: HashMap<String, NodeId>,
    refs: HashMap<String, NodeRef>,
}

impl TestTree {
    pub fn id(&self, path: &str) -> NodeId {
        self.ids[path]
    }

    pub fn node(&self, path: &str) -> &NodeRef {
        &self.refs[path]
    }

    pub fn root(&self) -> &NodeRef {
        self.node("")
    }
}

pub fn permission(name: &str) -> PermissionReference {
    PermissionReference::new(QName::new(TEST_NAMESPACE, "base"), name)
}

pub fn read() -> PermissionReference {
    permission("Read")
}

pub fn allow(authority: &str, name: &str) -> AccessControlEntry {
    AccessControlEntry::new(authority, permission(name), AccessStatus::Allowed)
}

pub fn deny(authority: &str, name: &str) -> AccessControlEntry {
    AccessControlEntry::new(authority, permission(name), AccessStatus::Denied)
}
