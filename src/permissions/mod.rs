//! Node-level permission verbs
//!
//! Resolves the backend DAO for a node reference, finds or creates the
//! node's DEFINING ACL, applies the edit through the engine and hands the
//! resulting [`AclChange`]s back to the DAO so nodes follow remapped ids.
//!
//! A node holding no ACL or a SHARED one gets a fresh DEFINING ACL on its
//! first local edit; its children are moved onto that ACL's derivative.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::acl::{
    AccessControlEntry, AccessControlList, AccessStatus, AcePattern, AclChange, AclEngine, AclId,
    AclProperties, AclTxn, AclType, PermissionReference,
};
use crate::dao::{AccessControlListDao, AclCounters, AclDaos};
use crate::error::AclError;
use crate::nodes::{NodeRef, NodeStore, StoreRef};

/// Permission service over both storage backends
#[derive(Debug, Clone, Default)]
pub struct PermissionManager {
    engine: AclEngine,
    daos: AclDaos,
    nodes: NodeStore,
}

impl PermissionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared instance
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn engine(&self) -> &AclEngine {
        &self.engine
    }

    pub fn daos(&self) -> &AclDaos {
        &self.daos
    }

    /// Resolved ACL of a node, if it has one
    pub async fn get_node_acl(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
    ) -> Result<Option<Arc<AccessControlList>>, AclError> {
        let dao = self.daos.for_node(node)?;
        match dao.get_acl_id(txn, node).await? {
            Some(id) => Ok(Some(self.engine.get_access_control_list(txn, id).await?)),
            None => Ok(None),
        }
    }

    /// Resolved store-level ACL
    pub async fn get_store_acl(
        &self,
        txn: &mut AclTxn,
        store: &StoreRef,
    ) -> Result<Option<Arc<AccessControlList>>, AclError> {
        let dao = self.daos.for_store(store)?;
        match dao.get_store_acl(txn, store).await? {
            Some(id) => Ok(Some(self.engine.get_access_control_list(txn, id).await?)),
            None => Ok(None),
        }
    }

    /// Authorities that may read the node
    pub async fn get_readers(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
    ) -> Result<Arc<BTreeSet<String>>, AclError> {
        let dao = self.daos.for_node(node)?;
        match dao.get_acl_id(txn, node).await? {
            Some(id) => self.engine.get_readers(txn, id).await,
            None => Ok(Arc::new(BTreeSet::new())),
        }
    }

    /// Grant or deny `permission` to `authority` directly on the node
    pub async fn set_permission(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
        authority: &str,
        permission: PermissionReference,
        allow: bool,
    ) -> Result<(), AclError> {
        let dao = self.daos.for_node(node)?;
        let acl = self.defining_acl(txn, dao, node).await?;
        let entry = AccessControlEntry::new(authority, permission, AccessStatus::from_allowed(allow));
        let changes = self
            .engine
            .set_access_control_entry(txn, acl, &entry)
            .await?;
        debug!(node = %node, authority, changes = changes.len(), "Set permission");
        dao.update_changed_acls(txn, node, &changes).await
    }

    /// Remove a local entry for `authority` and `permission`
    pub async fn delete_permission(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
        authority: &str,
        permission: PermissionReference,
    ) -> Result<(), AclError> {
        let pattern = AcePattern::local()
            .with_authority(authority)
            .with_permission(permission);
        self.delete_local(txn, node, &pattern).await
    }

    /// Remove every local entry on the node
    pub async fn delete_permissions(&self, txn: &mut AclTxn, node: &NodeRef) -> Result<(), AclError> {
        self.delete_local(txn, node, &AcePattern::local()).await
    }

    /// Grant or deny `permission` on a layered store itself
    pub async fn set_store_permission(
        &self,
        txn: &mut AclTxn,
        store: &StoreRef,
        authority: &str,
        permission: PermissionReference,
        allow: bool,
    ) -> Result<(), AclError> {
        let dao = self.daos.for_store(store)?;
        let acl = match dao.get_store_acl(txn, store).await? {
            Some(id) => id,
            None => {
                let created = self
                    .engine
                    .create_acl(txn, AclProperties::new(AclType::Defining), &[], None)
                    .await?;
                dao.set_store_acl(txn, store, Some(created.id)).await?;
                created.id
            }
        };
        let entry = AccessControlEntry::new(authority, permission, AccessStatus::from_allowed(allow));
        let changes = self
            .engine
            .set_access_control_entry(txn, acl, &entry)
            .await?;
        if let Some(after) = remapped(&changes, acl) {
            dao.set_store_acl(txn, store, Some(after)).await?;
        }
        Ok(())
    }

    /// Turn inheritance from the parent on or off for the node
    ///
    /// Long propagations are deferred to the fixup worker only when `txn`
    /// allows async calls.
    pub async fn set_inheritance(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
        inherit: bool,
    ) -> Result<(), AclError> {
        let dao = self.daos.for_node(node)?;
        let changes = if inherit {
            let Some(acl) = self.local_acl(txn, dao, node).await? else {
                // No local ACL, so the node already inherits
                return Ok(());
            };
            let parent = dao.get_inherited_acl(txn, node).await?;
            self.engine.enable_inheritance(txn, acl, parent).await?
        } else {
            let acl = self.defining_acl(txn, dao, node).await?;
            self.engine.disable_inheritance(txn, acl, false).await?
        };
        debug!(node = %node, inherit, changes = changes.len(), "Set inheritance");
        dao.update_changed_acls(txn, node, &changes).await
    }

    /// Reparent hook; `child` has already moved under `new_parent`
    pub async fn update_inheritance(
        &self,
        txn: &mut AclTxn,
        child: &NodeRef,
        old_parent: Option<&NodeRef>,
        new_parent: &NodeRef,
    ) -> Result<(), AclError> {
        self.daos
            .for_node(child)?
            .update_inheritance(txn, child, old_parent, new_parent)
            .await
    }

    /// Move a tree node under `new_parent` and fix up its ACLs
    pub async fn move_node(
        &self,
        txn: &mut AclTxn,
        child: &NodeRef,
        new_parent: &NodeRef,
    ) -> Result<(), AclError> {
        let dao = self.daos.for_node(child)?;
        let child_id = self.nodes.node_id(txn, child).await?;
        let parent_id = self.nodes.node_id(txn, new_parent).await?;
        let old_parent = match self.nodes.get_primary_parent(txn, child_id).await? {
            Some(id) => Some(self.nodes.node_ref(txn, id).await?),
            None => None,
        };
        self.nodes.move_node(txn, child_id, parent_id).await?;
        dao.update_inheritance(txn, child, old_parent.as_ref(), new_parent)
            .await
    }

    /// Delete the node's own ACL, falling back to what it inherits
    pub async fn delete_node_acl(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
    ) -> Result<Vec<AclChange>, AclError> {
        self.daos
            .for_node(node)?
            .delete_acl_for_node(txn, node)
            .await
    }

    /// Convert legacy ACLs in every store of both backends
    pub async fn patch_acls(&self, txn: &mut AclTxn) -> Result<AclCounters, AclError> {
        let mut counters = self.daos.tree.patch_acls(txn).await?;
        counters.merge(&self.daos.layered.patch_acls(txn).await?);
        Ok(counters)
    }

    async fn delete_local(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
        pattern: &AcePattern,
    ) -> Result<(), AclError> {
        let dao = self.daos.for_node(node)?;
        let Some(acl) = self.local_acl(txn, dao, node).await? else {
            return Ok(());
        };
        let changes = self
            .engine
            .delete_access_control_entries(txn, acl, pattern)
            .await?;
        dao.update_changed_acls(txn, node, &changes).await
    }

    /// The node's ACL unless it is absent or only inherited
    async fn local_acl(
        &self,
        txn: &mut AclTxn,
        dao: &dyn AccessControlListDao,
        node: &NodeRef,
    ) -> Result<Option<AclId>, AclError> {
        let Some(id) = dao.get_acl_id(txn, node).await? else {
            return Ok(None);
        };
        let acl = self.engine.get_acl_properties(txn, id).await?;
        Ok((acl.acl_type != AclType::Shared).then_some(id))
    }

    /// The node's own ACL, creating a DEFINING one in place of a missing or SHARED ACL
    async fn defining_acl(
        &self,
        txn: &mut AclTxn,
        dao: &dyn AccessControlListDao,
        node: &NodeRef,
    ) -> Result<AclId, AclError> {
        let current = dao.get_acl_id(txn, node).await?;
        if let Some(id) = self.local_acl(txn, dao, node).await? {
            return Ok(id);
        }

        let inherit_from = match current {
            Some(shared) => Some(shared),
            None => dao.get_inherited_acl(txn, node).await?,
        };
        let acl = self
            .engine
            .create_acl(txn, AclProperties::new(AclType::Defining), &[], inherit_from)
            .await?;
        dao.set_acl_id(txn, node, Some(acl.id)).await?;
        dao.set_inheritance_for_children(txn, node, acl.id, current)
            .await?;
        debug!(node = %node, acl_id = acl.id, replaced = ?current, "Created defining ACL for node");
        Ok(acl.id)
    }
}

/// New id of `acl` if `changes` moved it
fn remapped(changes: &[AclChange], acl: AclId) -> Option<AclId> {
    changes
        .iter()
        .find(|c| c.before == Some(acl) && c.is_remap())
        .and_then(|c| c.after)
}
