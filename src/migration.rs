//! Legacy ACL migration for tree stores
//!
//! Walks every store breadth-first from its root, converting OLD ACLs into
//! DEFINING ones and bulk-assigning shared derivatives to unset children.
//! Running it again on a migrated tree changes nothing.

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::acl::{crud, AclEngine, AclId, AclProperties, AclTxn, AclType};
use crate::dao::AclCounters;
use crate::error::AclError;
use crate::layered::LayeredStore;
use crate::nodes::{NodeId, NodeStore};

#[derive(Debug, Clone, Copy, Default)]
pub struct AclMigration {
    engine: AclEngine,
    nodes: NodeStore,
}

impl AclMigration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Migrate every tree store, returning counts per ACL kind
    pub async fn run(&self, txn: &mut AclTxn) -> Result<AclCounters, AclError> {
        let mut counters = AclCounters::new();
        for (store, root) in self.nodes.stores(txn).await? {
            let migrated = self.migrate_store(txn, root).await?;
            info!(store = %store, %migrated, "Migrated store ACLs");
            counters.merge(&migrated);
        }
        Ok(counters)
    }

    async fn migrate_store(&self, txn: &mut AclTxn, root: NodeId) -> Result<AclCounters, AclError> {
        let mut counters = AclCounters::new();
        let mut queue: VecDeque<(NodeId, Option<AclId>)> = VecDeque::from([(root, None)]);

        while let Some((node, parent_shared)) = queue.pop_front() {
            let resolved = self
                .resolve_node(txn, node, node == root, parent_shared, &mut counters)
                .await?;

            let children_shared = match resolved {
                Some(acl) => {
                    self.engine
                        .get_inherited_access_control_list(txn, acl)
                        .await?
                }
                None => None,
            };

            let children = self.nodes.get_primary_children_acls(txn, node).await?;
            if let Some(shared) = children_shared {
                let unset = children.iter().filter(|(_, acl)| acl.is_none()).count() as u64;
                if unset > 0 {
                    self.nodes
                        .set_primary_children_shared_acl_id(txn, node, None, shared)
                        .await?;
                    counters.add(AclType::Shared, unset);
                }
            }
            queue.extend(children.into_iter().map(|(child, _)| (child, children_shared)));
        }
        Ok(counters)
    }

    /// Bring one node onto the shared model; returns its ACL afterwards
    async fn resolve_node(
        &self,
        txn: &mut AclTxn,
        node: NodeId,
        is_root: bool,
        parent_shared: Option<AclId>,
        counters: &mut AclCounters,
    ) -> Result<Option<AclId>, AclError> {
        let Some(existing) = self.nodes.get_node_acl_id(txn, node).await? else {
            if is_root {
                let acl = self.engine.create_default_acl(txn).await?;
                self.nodes.set_node_acl_id(txn, node, Some(acl.id)).await?;
                counters.increment(AclType::Defining);
                debug!(node, acl_id = acl.id, "Created root ACL");
                return Ok(Some(acl.id));
            }
            if let Some(shared) = parent_shared {
                self.nodes.set_node_acl_id(txn, node, Some(shared)).await?;
                counters.increment(AclType::Shared);
            }
            return Ok(parent_shared);
        };

        if Some(existing) == parent_shared {
            return Ok(Some(existing));
        }

        let old = crud::require_acl(txn.conn(), existing).await?;
        if old.acl_type != AclType::Old {
            return Ok(Some(existing));
        }

        let local: Vec<_> = self
            .engine
            .get_access_control_list(txn, existing)
            .await?
            .local_entries()
            .cloned()
            .collect();
        let inherit_from = if old.inherits { parent_shared } else { None };
        let acl = self
            .engine
            .create_acl(
                txn,
                AclProperties::new(AclType::Defining).inherits(old.inherits),
                &local,
                inherit_from,
            )
            .await?;
        self.nodes.set_node_acl_id(txn, node, Some(acl.id)).await?;
        counters.increment(AclType::Defining);
        debug!(node, old = existing, acl_id = acl.id, "Converted legacy ACL");

        if self.unreferenced(txn, existing).await? {
            crud::delete_acl(txn.conn(), &old).await?;
            txn.invalidate(existing);
            debug!(acl_id = existing, "Deleted legacy ACL");
        }
        Ok(Some(acl.id))
    }

    /// No node in either backend and no other ACL points at `acl`
    async fn unreferenced(&self, txn: &mut AclTxn, acl: AclId) -> Result<bool, AclError> {
        if !self.nodes.nodes_by_acl(txn, acl).await?.is_empty() {
            return Ok(false);
        }
        if !LayeredStore::new().nodes_by_acl(txn, acl).await?.is_empty() {
            return Ok(false);
        }
        Ok(crud::count_acl_references(txn.conn(), acl).await? == 0)
    }
}
