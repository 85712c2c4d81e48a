//! ACL DAO for tree-structured stores

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{AccessControlListDao, AclCounters};
use crate::acl::{crud, engine::change_map, AclChange, AclEngine, AclId, AclTxn, AclType};
use crate::error::AclError;
use crate::migration::AclMigration;
use crate::nodes::{
    inherit_from_property, pending_fix_acl_aspect, shared_acl_to_replace_property, NodeId,
    NodeRef, NodeStore, StoreRef,
};
use crate::BoxFuture;

const BACKEND: &str = "tree";

/// Tree-backend ACL DAO
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeAclDao {
    engine: AclEngine,
    nodes: NodeStore,
}

impl TreeAclDao {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared derivative of the ACL on `node`'s primary parent
    async fn parent_shared(&self, txn: &mut AclTxn, node: NodeId) -> Result<Option<AclId>, AclError> {
        let Some(parent) = self.nodes.get_primary_parent(txn, node).await? else {
            return Ok(None);
        };
        match self.nodes.get_node_acl_id(txn, parent).await? {
            Some(acl) => self.engine.get_inherited_access_control_list(txn, acl).await,
            None => Ok(None),
        }
    }

    /// Push `merge_from` (the shared derivative of `inherit_from`) below `node`
    ///
    /// Children holding no ACL, `shared_to_replace` or `merge_from` are updated
    /// in one statement and then recursed into. Inheriting DEFINING and
    /// LAYERED children are merged instead.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn set_fixed_acls<'a>(
        &'a self,
        txn: &'a mut AclTxn,
        node: NodeId,
        inherit_from: AclId,
        merge_from: Option<AclId>,
        shared_to_replace: Option<AclId>,
        changes: &'a mut Vec<AclChange>,
        set: bool,
    ) -> BoxFuture<'a, Result<(), AclError>> {
        Box::pin(async move {
            let merge_from = match merge_from {
                Some(id) => id,
                None => match self
                    .engine
                    .get_inherited_access_control_list(txn, inherit_from)
                    .await?
                {
                    Some(id) => id,
                    None => return Ok(()),
                },
            };

            if set {
                self.nodes.set_node_acl_id(txn, node, Some(merge_from)).await?;
            }

            let children = self.nodes.get_primary_children_acls(txn, node).await?;
            if children.is_empty() {
                return Ok(());
            }
            self.nodes
                .set_primary_children_shared_acl_id(txn, node, shared_to_replace, merge_from)
                .await?;

            for (child, acl) in children {
                let current = match acl {
                    Some(id) => self.current_version(txn, id).await?,
                    None => None,
                };
                let replaced = match acl {
                    None => true,
                    Some(id) => {
                        Some(id) == shared_to_replace
                            || id == merge_from
                            || current.is_none()
                            || current == Some(merge_from)
                    }
                };

                if replaced {
                    // Stale versions of the shared ACL are missed by the bulk update
                    if acl.is_some() && acl != shared_to_replace && acl != Some(merge_from) {
                        self.nodes.set_node_acl_id(txn, child, Some(merge_from)).await?;
                    }
                    if txn.budget_exceeded() {
                        self.mark_pending(txn, child, inherit_from, shared_to_replace)
                            .await?;
                        txn.require_async();
                        continue;
                    }
                    self.set_fixed_acls(
                        txn,
                        child,
                        inherit_from,
                        Some(merge_from),
                        shared_to_replace,
                        changes,
                        false,
                    )
                    .await?;
                    continue;
                }

                let Some(acl_id) = current else { continue };
                let acl_row = crud::require_acl(txn.conn(), acl_id).await?;
                if !(acl_row.acl_type.rules().spawns_shared && acl_row.inherits) {
                    if Some(acl_id) != acl {
                        self.nodes.set_node_acl_id(txn, child, Some(acl_id)).await?;
                    }
                    continue;
                }

                let merged = self
                    .engine
                    .merge_inherited_access_control_list(txn, Some(merge_from), acl_id)
                    .await?;
                let after = merged
                    .iter()
                    .find(|c| c.before == Some(acl_id))
                    .and_then(|c| c.after);
                if let Some(after) = after {
                    if Some(after) != acl {
                        self.nodes.set_node_acl_id(txn, child, Some(after)).await?;
                    }
                    let unset = self
                        .engine
                        .get_inherited_access_control_list(txn, after)
                        .await?;
                    let map = change_map(&merged);
                    let mut unchanged = unchanged_set(&merged);
                    unchanged.insert(after);
                    self.fix_up_acls(txn, child, &map, &unchanged, unset, true)
                        .await?;
                }
                changes.extend(merged);
            }
            Ok(())
        })
    }

    /// Tag `node` so the fixup worker finishes its subtree later
    async fn mark_pending(
        &self,
        txn: &mut AclTxn,
        node: NodeId,
        inherit_from: AclId,
        shared_to_replace: Option<AclId>,
    ) -> Result<(), AclError> {
        self.nodes
            .add_aspect(txn, node, &pending_fix_acl_aspect())
            .await?;
        self.nodes
            .set_property(txn, node, &inherit_from_property(), &serde_json::json!(inherit_from))
            .await?;
        self.nodes
            .set_property(
                txn,
                node,
                &shared_acl_to_replace_property(),
                &serde_json::json!(shared_to_replace),
            )
            .await?;
        debug!(node, inherit_from, ?shared_to_replace, "Deferred ACL propagation");
        Ok(())
    }

    /// Latest version of `acl`, or `None` if the row is gone
    async fn current_version(&self, txn: &mut AclTxn, acl: AclId) -> Result<Option<AclId>, AclError> {
        match self.engine.find_acl(txn, acl).await? {
            Some(row) if row.latest => Ok(Some(acl)),
            Some(_) => Ok(Some(self.engine.latest_version(txn, acl).await?)),
            None => Ok(None),
        }
    }

    /// Walk down from `node` applying `changes`; stop at nodes whose ACL is unrelated
    ///
    /// With `defer`, a walk that runs out of budget tags the node it reached
    /// so the fixup worker pushes its ACL down the rest of the subtree.
    #[allow(clippy::too_many_arguments)]
    fn fix_up_acls<'a>(
        &'a self,
        txn: &'a mut AclTxn,
        node: NodeId,
        changes: &'a HashMap<AclId, Option<AclId>>,
        unchanged: &'a HashSet<AclId>,
        unset: Option<AclId>,
        defer: bool,
    ) -> BoxFuture<'a, Result<(), AclError>> {
        Box::pin(async move {
            let current = match self.nodes.get_node_acl_id(txn, node).await? {
                None => {
                    if unset.is_some() {
                        self.nodes.set_node_acl_id(txn, node, unset).await?;
                    }
                    unset
                }
                Some(id) => match changes.get(&id) {
                    Some(after) => {
                        if *after != Some(id) {
                            self.nodes.set_node_acl_id(txn, node, *after).await?;
                        }
                        *after
                    }
                    None if unchanged.contains(&id) => Some(id),
                    None => return Ok(()),
                },
            };

            if defer && txn.budget_exceeded() {
                if let Some(acl) = current {
                    self.mark_pending(txn, node, acl, None).await?;
                    txn.require_async();
                    return Ok(());
                }
            }

            for (child, _) in self.nodes.get_primary_children_acls(txn, node).await? {
                self.fix_up_acls(txn, child, changes, unchanged, unset, defer)
                    .await?;
            }
            Ok(())
        })
    }
}

/// Ids that a change list left in place
fn unchanged_set(changes: &[AclChange]) -> HashSet<AclId> {
    changes
        .iter()
        .filter(|c| !c.is_remap())
        .filter_map(|c| c.before)
        .collect()
}

#[async_trait]
impl AccessControlListDao for TreeAclDao {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn get_acl_id(&self, txn: &mut AclTxn, node: &NodeRef) -> Result<Option<AclId>, AclError> {
        let id = self.nodes.node_id(txn, node).await?;
        self.nodes.get_node_acl_id(txn, id).await
    }

    async fn set_acl_id(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
        acl: Option<AclId>,
    ) -> Result<(), AclError> {
        let id = self.nodes.node_id(txn, node).await?;
        self.nodes.set_node_acl_id(txn, id, acl).await
    }

    async fn get_inherited_acl(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
    ) -> Result<Option<AclId>, AclError> {
        let id = self.nodes.node_id(txn, node).await?;
        self.parent_shared(txn, id).await
    }

    async fn get_store_acl(
        &self,
        _txn: &mut AclTxn,
        _store: &StoreRef,
    ) -> Result<Option<AclId>, AclError> {
        Err(AclError::UnsupportedForBackend {
            backend: BACKEND,
            operation: "store ACLs",
        })
    }

    async fn set_store_acl(
        &self,
        _txn: &mut AclTxn,
        _store: &StoreRef,
        _acl: Option<AclId>,
    ) -> Result<(), AclError> {
        Err(AclError::UnsupportedForBackend {
            backend: BACKEND,
            operation: "store ACLs",
        })
    }

    async fn update_changed_acls(
        &self,
        txn: &mut AclTxn,
        start: &NodeRef,
        changes: &[AclChange],
    ) -> Result<(), AclError> {
        let node = self.nodes.node_id(txn, start).await?;

        // A created ACL, or one whose kind changed, becomes the value for unset nodes
        let mut set_acl = None;
        for change in changes {
            if change.before.is_none() || change.type_before != change.type_after {
                set_acl = change.after;
            }
        }
        let inherited = match set_acl {
            Some(acl) => self.engine.get_inherited_access_control_list(txn, acl).await?,
            None => None,
        };

        let map: HashMap<AclId, Option<AclId>> = changes
            .iter()
            .filter(|c| c.is_remap())
            .filter_map(|c| c.before.map(|before| (before, c.after)))
            .collect();
        let mut unchanged = unchanged_set(changes);
        unchanged.extend(inherited);
        unchanged.extend(set_acl);

        self.fix_up_acls(txn, node, &map, &unchanged, inherited, false)
            .await
    }

    async fn set_inheritance_for_children(
        &self,
        txn: &mut AclTxn,
        parent: &NodeRef,
        inherit_from: AclId,
        shared_to_replace: Option<AclId>,
    ) -> Result<Vec<AclChange>, AclError> {
        let node = self.nodes.node_id(txn, parent).await?;
        let inherit_from = self.engine.latest_version(txn, inherit_from).await?;

        let mut changes = Vec::new();
        self.set_fixed_acls(
            txn,
            node,
            inherit_from,
            None,
            shared_to_replace,
            &mut changes,
            false,
        )
        .await?;
        debug!(
            parent = %parent,
            inherit_from,
            changes = changes.len(),
            deferred = txn.async_required(),
            "Set inheritance for children"
        );
        Ok(changes)
    }

    async fn update_inheritance(
        &self,
        txn: &mut AclTxn,
        child: &NodeRef,
        old_parent: Option<&NodeRef>,
        new_parent: &NodeRef,
    ) -> Result<(), AclError> {
        let child_id = self.nodes.node_id(txn, child).await?;
        let new_parent_id = self.nodes.node_id(txn, new_parent).await?;
        let Some(new_parent_acl) = self.nodes.get_node_acl_id(txn, new_parent_id).await? else {
            return Ok(());
        };

        let old_shared = match old_parent {
            Some(old) => {
                let old_id = self.nodes.node_id(txn, old).await?;
                match self.nodes.get_node_acl_id(txn, old_id).await? {
                    Some(acl) => self.engine.get_inherited_access_control_list(txn, acl).await?,
                    None => None,
                }
            }
            None => None,
        };

        let Some(child_acl) = self.nodes.get_node_acl_id(txn, child_id).await? else {
            let mut changes = Vec::new();
            return self
                .set_fixed_acls(txn, child_id, new_parent_acl, None, None, &mut changes, true)
                .await;
        };

        let acl = crud::require_acl(txn.conn(), child_acl).await?;
        match acl.acl_type {
            AclType::Shared => {
                // Shared ACLs of some other root stay where they are
                if old_shared.is_some() && old_shared != Some(child_acl) {
                    return Ok(());
                }
                let mut changes = Vec::new();
                self.set_fixed_acls(
                    txn,
                    child_id,
                    new_parent_acl,
                    None,
                    Some(child_acl),
                    &mut changes,
                    true,
                )
                .await
            }
            AclType::Defining | AclType::Layered if acl.inherits => {
                let changes = self
                    .engine
                    .merge_inherited_access_control_list(txn, Some(new_parent_acl), child_acl)
                    .await?;
                self.update_changed_acls(txn, child, &changes).await
            }
            _ => Ok(()),
        }
    }

    async fn delete_acl_for_node(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
    ) -> Result<Vec<AclChange>, AclError> {
        let node_id = self.nodes.node_id(txn, node).await?;
        let Some(acl_id) = self.nodes.get_node_acl_id(txn, node_id).await? else {
            return Ok(Vec::new());
        };
        let acl = crud::require_acl(txn.conn(), acl_id).await?;

        if acl.acl_type == AclType::Shared {
            self.nodes.set_node_acl_id(txn, node_id, None).await?;
            let still_used = !self.nodes.nodes_by_acl(txn, acl_id).await?.is_empty()
                || crud::count_acl_references(txn.conn(), acl_id).await? > 0;
            if still_used {
                return Ok(Vec::new());
            }
            crud::delete_acl(txn.conn(), &acl).await?;
            txn.invalidate(acl_id);
            debug!(acl_id, "Deleted orphaned shared ACL");
            return Ok(vec![AclChange::new(
                Some(acl_id),
                None,
                Some(AclType::Shared),
                None,
            )]);
        }

        let changes = self
            .engine
            .delete_access_control_list(txn, acl_id)
            .await?;

        // The node and anything below it that held a deleted ACL falls back to the parent
        let fallback = self.parent_shared(txn, node_id).await?;
        let map: HashMap<AclId, Option<AclId>> = changes
            .iter()
            .filter(|c| c.is_remap())
            .filter_map(|c| c.before.map(|before| (before, c.after.or(fallback))))
            .collect();
        let unchanged = unchanged_set(&changes);
        self.fix_up_acls(txn, node_id, &map, &unchanged, fallback, false)
            .await?;
        Ok(changes)
    }

    async fn force_copy(&self, _txn: &mut AclTxn, _node: &NodeRef) -> Result<(), AclError> {
        Err(AclError::UnsupportedForBackend {
            backend: BACKEND,
            operation: "force copy",
        })
    }

    async fn patch_acls(&self, txn: &mut AclTxn) -> Result<AclCounters, AclError> {
        let counters = AclMigration::new().run(txn).await?;
        info!(%counters, "Patched tree ACLs");
        Ok(counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AccessControlEntry, AccessStatus, AclProperties, PermissionReference, QName};
    use crate::db::test_utils::{test_pool, test_txn};

    fn allow(authority: &str) -> AccessControlEntry {
        AccessControlEntry::new(
            authority,
            PermissionReference::new(QName::new("urn:acld:test", "base"), "Read"),
            AccessStatus::Allowed,
        )
    }

    #[tokio::test]
    async fn test_children_follow_parent_shared_acl() {
        let pool = test_pool().await;
        let dao = TreeAclDao::new();
        let engine = AclEngine::new();
        let nodes = NodeStore::new();
        let mut txn = test_txn(&pool).await;

        let store = StoreRef::workspace("SpacesStore");
        let root = nodes.create_store(&mut txn, &store).await.unwrap();
        let a = nodes.create_node(&mut txn, root, "a").await.unwrap();
        let b = nodes.create_node(&mut txn, a, "b").await.unwrap();

        let acl = engine
            .create_acl(&mut txn, AclProperties::new(AclType::Defining), &[allow("root")], None)
            .await
            .unwrap();
        nodes.set_node_acl_id(&mut txn, root, Some(acl.id)).await.unwrap();

        let root_ref = nodes.node_ref(&mut txn, root).await.unwrap();
        let changes = dao
            .set_inheritance_for_children(&mut txn, &root_ref, acl.id, None)
            .await
            .unwrap();
        assert!(changes.is_empty());

        let shared = engine
            .get_inherited_access_control_list(&mut txn, acl.id)
            .await
            .unwrap();
        assert_eq!(nodes.get_node_acl_id(&mut txn, a).await.unwrap(), shared);
        assert_eq!(nodes.get_node_acl_id(&mut txn, b).await.unwrap(), shared);

        let b_ref = nodes.node_ref(&mut txn, b).await.unwrap();
        assert_eq!(dao.get_inherited_acl(&mut txn, &b_ref).await.unwrap(), shared);
    }

    #[tokio::test]
    async fn test_defining_child_is_merged() {
        let pool = test_pool().await;
        let dao = TreeAclDao::new();
        let engine = AclEngine::new();
        let nodes = NodeStore::new();
        let mut txn = test_txn(&pool).await;

        let root = nodes
            .create_store(&mut txn, &StoreRef::workspace("SpacesStore"))
            .await
            .unwrap();
        let a = nodes.create_node(&mut txn, root, "a").await.unwrap();
        let b = nodes.create_node(&mut txn, a, "b").await.unwrap();

        let parent = engine
            .create_acl(&mut txn, AclProperties::new(AclType::Defining), &[allow("root")], None)
            .await
            .unwrap();
        let child = engine
            .create_acl(&mut txn, AclProperties::new(AclType::Defining), &[allow("alice")], None)
            .await
            .unwrap();
        nodes.set_node_acl_id(&mut txn, root, Some(parent.id)).await.unwrap();
        nodes.set_node_acl_id(&mut txn, a, Some(child.id)).await.unwrap();

        let root_ref = nodes.node_ref(&mut txn, root).await.unwrap();
        dao.set_inheritance_for_children(&mut txn, &root_ref, parent.id, None)
            .await
            .unwrap();

        let list = engine.get_access_control_list(&mut txn, child.id).await.unwrap();
        assert_eq!(list.positions_of("root", "Read"), vec![2]);
        assert_eq!(list.positions_of("alice", "Read"), vec![0]);

        // b sits under a's own shared derivative
        let child_shared = engine
            .get_inherited_access_control_list(&mut txn, child.id)
            .await
            .unwrap();
        assert_eq!(nodes.get_node_acl_id(&mut txn, b).await.unwrap(), child_shared);
    }

    #[tokio::test]
    async fn test_store_acls_unsupported() {
        let pool = test_pool().await;
        let dao = TreeAclDao::new();
        let mut txn = test_txn(&pool).await;

        let store = StoreRef::workspace("SpacesStore");
        assert!(matches!(
            dao.get_store_acl(&mut txn, &store).await,
            Err(AclError::UnsupportedForBackend { backend: "tree", .. })
        ));
        assert!(matches!(
            dao.set_store_acl(&mut txn, &store, None).await,
            Err(AclError::UnsupportedForBackend { .. })
        ));
        let node = NodeRef::new(store, "x");
        assert!(matches!(
            dao.force_copy(&mut txn, &node).await,
            Err(AclError::UnsupportedForBackend { .. })
        ));
    }
}
