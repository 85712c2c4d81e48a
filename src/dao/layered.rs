//! ACL DAO for layered stores
//!
//! Layered directories expose another path's children, so an ACL change can
//! reach nodes that are not below the node it started at. Before a pass the
//! DAO indexes every layered node by the node it points at and consults that
//! index whenever a node picks up a new ACL.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{AccessControlListDao, AclCounters};
use crate::acl::{crud, AclChange, AclCopyMode, AclEngine, AclId, AclProperties, AclTxn, AclType};
use crate::error::AclError;
use crate::layered::{from_node_ref, parent_path, root_path, LayeredStore, ListingMode, HEAD};
use crate::nodes::{NodeRef, StoreRef};
use crate::BoxFuture;

const BACKEND: &str = "layered";

/// Target node id to the layered nodes pointing at it
type IndirectionIndex = HashMap<i64, BTreeSet<i64>>;

/// Layered-backend ACL DAO
#[derive(Debug, Clone, Copy, Default)]
pub struct LayeredAclDao {
    engine: AclEngine,
    store: LayeredStore,
}

fn head_path(node: &NodeRef) -> Result<String, AclError> {
    let (version, path) = from_node_ref(node)?;
    if version != HEAD {
        return Err(AclError::InvalidNodeReference(format!(
            "{node} is a read-only snapshot"
        )));
    }
    Ok(path)
}

/// New id for `acl` in `changes`, if the change list covers it
fn after_of(changes: &[AclChange], acl: AclId) -> Option<Option<AclId>> {
    changes.iter().find(|c| c.before == Some(acl)).map(|c| c.after)
}

fn warn_on_remap(changes: &[AclChange], path: &str) {
    for change in changes.iter().filter(|c| c.is_remap()) {
        warn!(path, before = ?change.before, after = ?change.after, "Unexpected ACL copy while patching");
    }
}

impl LayeredAclDao {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every head layered node by the id of the node it points at
    ///
    /// Valid for one propagation pass only.
    async fn build_indirections(&self, txn: &mut AclTxn) -> Result<IndirectionIndex, AclError> {
        let indirections = self.store.layered_indirections(txn).await?;
        let mut index = IndirectionIndex::new();
        for indirection in &indirections {
            if let Some(target) = self
                .store
                .lookup(txn, indirection.to_version, &indirection.to)
                .await?
            {
                index.entry(target.id).or_default().insert(indirection.from);
            }
        }
        debug!(
            indirections = indirections.len(),
            targets = index.len(),
            "Built indirection index"
        );
        Ok(index)
    }

    /// Materialise `path` and flag its ACL so the next write makes a new version
    async fn force_copy_path(&self, txn: &mut AclTxn, path: &str) -> Result<(), AclError> {
        let (node, copied) = self.store.force_copy(txn, HEAD, path).await?;
        if copied {
            if let Some(acl) = node.acl_id {
                self.engine
                    .get_acl_copy(txn, acl, None, AclCopyMode::Cow)
                    .await?;
            }
        }
        Ok(())
    }

    /// Shared derivative of `inherit_from`, created on first use
    async fn shared_of(&self, txn: &mut AclTxn, inherit_from: AclId) -> Result<Option<AclId>, AclError> {
        self.engine
            .get_inherited_access_control_list(txn, inherit_from)
            .await
    }

    /// Push the shared derivative of `inherit_from` below `path`
    #[allow(clippy::too_many_arguments)]
    fn set_fixed_acls<'a>(
        &'a self,
        txn: &'a mut AclTxn,
        path: String,
        inherit_from: AclId,
        merge_from: Option<AclId>,
        changes: &'a mut Vec<AclChange>,
        mode: ListingMode,
        set: bool,
        index: &'a IndirectionIndex,
    ) -> BoxFuture<'a, Result<(), AclError>> {
        Box::pin(async move {
            let Some(node) = self.store.lookup(txn, HEAD, &path).await? else {
                return Ok(());
            };
            let mut merge_from = merge_from;

            if set {
                let shared = match merge_from {
                    Some(id) => id,
                    None => match self.shared_of(txn, inherit_from).await? {
                        Some(id) => id,
                        None => return Ok(()),
                    },
                };
                merge_from = Some(shared);
                // Virtual nodes already showing this ACL stay virtual
                if node.acl_id != Some(shared) {
                    self.store.set_acl(txn, HEAD, &path, Some(shared)).await?;
                }
                if node.acl_id.is_none() {
                    self.update_referencing_layered_acls(txn, path.clone(), shared, index)
                        .await?;
                }
            }

            if !node.is_directory() {
                return Ok(());
            }

            for child in self.store.listing(txn, &node, mode).await? {
                let shared = match merge_from {
                    Some(id) => id,
                    None => match self.shared_of(txn, inherit_from).await? {
                        Some(id) => id,
                        None => return Ok(()),
                    },
                };
                merge_from = Some(shared);

                let Some(acl_id) = child.acl_id else {
                    self.set_fixed_acls(
                        txn,
                        child.path,
                        inherit_from,
                        Some(shared),
                        changes,
                        mode,
                        true,
                        index,
                    )
                    .await?;
                    continue;
                };

                match crud::require_acl(txn.conn(), acl_id).await?.acl_type {
                    AclType::Layered => {}
                    AclType::Defining => {
                        self.force_copy_path(txn, &child.path).await?;
                        let mut merged = self
                            .engine
                            .merge_inherited_access_control_list(txn, Some(shared), acl_id)
                            .await?;
                        if let Some(Some(after)) = after_of(&merged, acl_id) {
                            if after != acl_id {
                                self.store
                                    .set_acl(txn, HEAD, &child.path, Some(after))
                                    .await?;
                            }
                            self.set_fixed_acls(
                                txn,
                                child.path,
                                after,
                                None,
                                &mut merged,
                                ListingMode::DirectOnly,
                                false,
                                index,
                            )
                            .await?;
                            changes.extend(merged);
                        }
                    }
                    _ => {
                        self.set_fixed_acls(
                            txn,
                            child.path,
                            inherit_from,
                            Some(shared),
                            changes,
                            mode,
                            true,
                            index,
                        )
                        .await?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Re-merge LAYERED ACLs of layered nodes that point at `path`
    fn update_referencing_layered_acls<'a>(
        &'a self,
        txn: &'a mut AclTxn,
        path: String,
        inherited: AclId,
        index: &'a IndirectionIndex,
    ) -> BoxFuture<'a, Result<(), AclError>> {
        Box::pin(async move {
            let Some(node) = self.store.lookup(txn, HEAD, &path).await? else {
                return Ok(());
            };
            let Some(referrers) = index.get(&node.id) else {
                return Ok(());
            };

            for layer in referrers {
                for layer_path in self.store.head_paths(txn, *layer).await? {
                    let Some(target) = self.store.get_acl(txn, HEAD, &layer_path).await? else {
                        continue;
                    };
                    if crud::require_acl(txn.conn(), target).await?.acl_type != AclType::Layered {
                        continue;
                    }

                    self.force_copy_path(txn, &layer_path).await?;
                    let layered = self
                        .engine
                        .merge_inherited_access_control_list(txn, Some(inherited), target)
                        .await?;
                    let Some(after) = after_of(&layered, target) else {
                        continue;
                    };
                    let new_inherited = match after {
                        Some(id) => self.shared_of(txn, id).await?,
                        None => None,
                    };
                    debug!(path = %layer_path, target, ?after, "Re-merged referencing layered ACL");
                    self.update_changed_acls_impl(
                        txn,
                        layer_path,
                        layered,
                        ListingMode::DirectOnly,
                        new_inherited,
                        after,
                        index,
                    )
                    .await?;
                }
            }
            Ok(())
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn update_changed_acls_impl<'a>(
        &'a self,
        txn: &'a mut AclTxn,
        path: String,
        changes: Vec<AclChange>,
        mode: ListingMode,
        inherited: Option<AclId>,
        set_acl: Option<AclId>,
        index: &'a IndirectionIndex,
    ) -> BoxFuture<'a, Result<(), AclError>> {
        Box::pin(async move {
            let mut change_map: HashMap<AclId, Option<AclId>> = HashMap::new();
            let mut unchanged: HashSet<AclId> = HashSet::new();
            for change in &changes {
                let Some(before) = change.before else { continue };
                if change.is_remap() {
                    change_map.insert(before, change.after);
                } else {
                    unchanged.insert(before);
                }
            }
            unchanged.extend(inherited);
            unchanged.extend(set_acl);

            if let Some(inherited) = inherited {
                self.update_referencing_layered_acls(txn, path.clone(), inherited, index)
                    .await?;
            }
            self.update_inherited_changed_acls(
                txn,
                path,
                &mut change_map,
                &unchanged,
                inherited,
                mode,
                index,
            )
            .await?;
            self.update_layered_acls_changed_by_inheritance(
                txn,
                &changes,
                &mut change_map,
                &unchanged,
                index,
            )
            .await
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn update_inherited_changed_acls<'a>(
        &'a self,
        txn: &'a mut AclTxn,
        path: String,
        change_map: &'a mut HashMap<AclId, Option<AclId>>,
        unchanged: &'a HashSet<AclId>,
        unset: Option<AclId>,
        mode: ListingMode,
        index: &'a IndirectionIndex,
    ) -> BoxFuture<'a, Result<(), AclError>> {
        Box::pin(async move {
            let Some(node) = self.store.lookup(txn, HEAD, &path).await? else {
                return Ok(());
            };
            if node.is_layered_directory() {
                if let Some(acl) = node.acl_id {
                    let mut changes = Vec::new();
                    self.set_fixed_acls(
                        txn,
                        path.clone(),
                        acl,
                        None,
                        &mut changes,
                        ListingMode::DirectOnly,
                        false,
                        index,
                    )
                    .await?;
                    for change in changes.iter().filter(|c| c.is_remap()) {
                        if let Some(before) = change.before {
                            change_map.insert(before, change.after);
                        }
                    }
                }
            }
            self.fix_up_acls(txn, path, change_map, unchanged, unset, mode, index)
                .await
        })
    }

    /// Walk down from `path` applying `change_map`; stop at nodes whose ACL is unrelated
    #[allow(clippy::too_many_arguments)]
    fn fix_up_acls<'a>(
        &'a self,
        txn: &'a mut AclTxn,
        path: String,
        change_map: &'a HashMap<AclId, Option<AclId>>,
        unchanged: &'a HashSet<AclId>,
        unset: Option<AclId>,
        mode: ListingMode,
        index: &'a IndirectionIndex,
    ) -> BoxFuture<'a, Result<(), AclError>> {
        Box::pin(async move {
            let Some(node) = self.store.lookup(txn, HEAD, &path).await? else {
                return Ok(());
            };

            match node.acl_id {
                None => {
                    if let Some(unset) = unset {
                        self.store.set_acl(txn, HEAD, &path, Some(unset)).await?;
                        self.update_referencing_layered_acls(txn, path.clone(), unset, index)
                            .await?;
                    }
                }
                Some(id) => match change_map.get(&id) {
                    Some(after) => {
                        if *after != Some(id) {
                            self.store.set_acl(txn, HEAD, &path, *after).await?;
                        }
                    }
                    None if unchanged.contains(&id) => {}
                    None => return Ok(()),
                },
            }

            if !node.is_directory() {
                return Ok(());
            }
            let node = match self.store.lookup(txn, HEAD, &path).await? {
                Some(node) => node,
                None => return Ok(()),
            };
            for child in self.store.listing(txn, &node, mode).await? {
                self.fix_up_acls(txn, child.path, change_map, unchanged, unset, mode, index)
                    .await?;
            }
            Ok(())
        })
    }

    /// Re-point head nodes still holding a LAYERED ACL that was copied by inheritance
    fn update_layered_acls_changed_by_inheritance<'a>(
        &'a self,
        txn: &'a mut AclTxn,
        changes: &'a [AclChange],
        change_map: &'a mut HashMap<AclId, Option<AclId>>,
        unchanged: &'a HashSet<AclId>,
        index: &'a IndirectionIndex,
    ) -> BoxFuture<'a, Result<(), AclError>> {
        Box::pin(async move {
            for change in changes {
                if change.type_before != Some(AclType::Layered)
                    || change.type_after != Some(AclType::Layered)
                    || !change.is_remap()
                {
                    continue;
                }
                let (Some(before), Some(after)) = (change.before, change.after) else {
                    continue;
                };

                for node in self.store.nodes_by_acl(txn, before).await? {
                    self.store.set_acl(txn, HEAD, &node.path, Some(after)).await?;
                    let unset = self.shared_of(txn, after).await?;
                    self.update_inherited_changed_acls(
                        txn,
                        node.path,
                        change_map,
                        unchanged,
                        unset,
                        ListingMode::DirectOnly,
                        index,
                    )
                    .await?;
                }
            }
            Ok(())
        })
    }

    /// Convert legacy ACLs below `path`, children first
    fn fix_old_acls<'a>(
        &'a self,
        txn: &'a mut AclTxn,
        path: String,
        index: &'a IndirectionIndex,
    ) -> BoxFuture<'a, Result<AclCounters, AclError>> {
        Box::pin(async move {
            let mut counters = AclCounters::new();
            let Some(node) = self.store.lookup(txn, HEAD, &path).await? else {
                return Ok(counters);
            };

            if node.is_directory() {
                for child in self.store.listing(txn, &node, ListingMode::DirectOnly).await? {
                    counters.merge(&self.fix_old_acls(txn, child.path, index).await?);
                }
            }

            let fixed = match self.store.get_acl(txn, HEAD, &path).await? {
                Some(existing) => {
                    let list = self.engine.get_access_control_list(txn, existing).await?;
                    if list.properties.acl_type != AclType::Old {
                        debug!(path = %path, acl_id = existing, "Skipping current ACL");
                        return Ok(counters);
                    }
                    counters.increment(AclType::Defining);
                    let local: Vec<_> = list.local_entries().cloned().collect();
                    let acl = self
                        .engine
                        .create_acl(
                            txn,
                            AclProperties::new(AclType::Defining).versioned(true),
                            &local,
                            None,
                        )
                        .await?;
                    acl.id
                }
                None if node.is_layered_directory() || node.is_layered_file() => {
                    counters.increment(AclType::Layered);
                    let mut indirected = None;
                    if let Some(target) = node.indirection.as_deref() {
                        if let Some(target) = self.store.lookup(txn, HEAD, target).await? {
                            if target.is_directory() || node.is_layered_file() {
                                indirected = target.acl_id;
                            }
                        }
                    }
                    self.engine.create_layered_acl(txn, indirected).await?
                }
                None => return Ok(counters),
            };

            self.store.set_acl(txn, HEAD, &path, Some(fixed)).await?;
            let mut changes = Vec::new();
            self.set_fixed_acls(
                txn,
                path.clone(),
                fixed,
                None,
                &mut changes,
                ListingMode::DirectOnly,
                false,
                index,
            )
            .await?;
            warn_on_remap(&changes, &path);
            Ok(counters)
        })
    }
}

fn unsupported(operation: &'static str) -> AclError {
    AclError::UnsupportedForBackend {
        backend: BACKEND,
        operation,
    }
}

#[async_trait]
impl AccessControlListDao for LayeredAclDao {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn get_acl_id(&self, txn: &mut AclTxn, node: &NodeRef) -> Result<Option<AclId>, AclError> {
        let (version, path) = from_node_ref(node)?;
        self.store.get_acl(txn, version, &path).await
    }

    async fn set_acl_id(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
        acl: Option<AclId>,
    ) -> Result<(), AclError> {
        let path = head_path(node)?;
        self.store.set_acl(txn, HEAD, &path, acl).await
    }

    async fn get_inherited_acl(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
    ) -> Result<Option<AclId>, AclError> {
        let (version, path) = from_node_ref(node)?;
        let Some(parent) = parent_path(&path) else {
            return Ok(None);
        };
        match self.store.get_acl(txn, version, &parent).await? {
            Some(acl) => self.shared_of(txn, acl).await,
            None => Ok(None),
        }
    }

    async fn get_store_acl(
        &self,
        txn: &mut AclTxn,
        store: &StoreRef,
    ) -> Result<Option<AclId>, AclError> {
        self.store.get_store_acl(txn, &store.identifier).await
    }

    async fn set_store_acl(
        &self,
        txn: &mut AclTxn,
        store: &StoreRef,
        acl: Option<AclId>,
    ) -> Result<(), AclError> {
        self.store.set_store_acl(txn, &store.identifier, acl).await
    }

    async fn update_changed_acls(
        &self,
        txn: &mut AclTxn,
        start: &NodeRef,
        changes: &[AclChange],
    ) -> Result<(), AclError> {
        let path = head_path(start)?;
        if !changes
            .iter()
            .any(|c| c.is_remap() || c.type_before != c.type_after)
        {
            return Ok(());
        }

        let mut set_acl = None;
        for change in changes {
            if change.before.is_none() || change.type_before != change.type_after {
                set_acl = change.after;
            }
        }
        let inherited = match set_acl {
            Some(acl) => self.shared_of(txn, acl).await?,
            None => None,
        };

        let index = self.build_indirections(txn).await?;
        self.update_changed_acls_impl(
            txn,
            path,
            changes.to_vec(),
            ListingMode::All,
            inherited,
            set_acl,
            &index,
        )
        .await
    }

    async fn set_inheritance_for_children(
        &self,
        txn: &mut AclTxn,
        parent: &NodeRef,
        inherit_from: AclId,
        _shared_to_replace: Option<AclId>,
    ) -> Result<Vec<AclChange>, AclError> {
        let path = head_path(parent)?;
        let inherit_from = self.engine.latest_version(txn, inherit_from).await?;
        let index = self.build_indirections(txn).await?;

        let mut changes = Vec::new();
        self.set_fixed_acls(
            txn,
            path,
            inherit_from,
            None,
            &mut changes,
            ListingMode::All,
            false,
            &index,
        )
        .await?;
        debug!(parent = %parent, inherit_from, changes = changes.len(), "Set inheritance for children");
        Ok(changes)
    }

    async fn update_inheritance(
        &self,
        _txn: &mut AclTxn,
        _child: &NodeRef,
        _old_parent: Option<&NodeRef>,
        _new_parent: &NodeRef,
    ) -> Result<(), AclError> {
        Err(unsupported("update inheritance"))
    }

    async fn delete_acl_for_node(
        &self,
        _txn: &mut AclTxn,
        _node: &NodeRef,
    ) -> Result<Vec<AclChange>, AclError> {
        Err(unsupported("delete node ACL"))
    }

    async fn force_copy(&self, txn: &mut AclTxn, node: &NodeRef) -> Result<(), AclError> {
        let path = head_path(node)?;
        self.force_copy_path(txn, &path).await
    }

    async fn patch_acls(&self, txn: &mut AclTxn) -> Result<AclCounters, AclError> {
        let index = self.build_indirections(txn).await?;
        let mut counters = AclCounters::new();
        for store in self.store.stores(txn).await? {
            let fixed = self.fix_old_acls(txn, root_path(&store), &index).await?;
            debug!(store = %store, %fixed, "Patched layered store");
            counters.merge(&fixed);
        }
        info!(%counters, "Patched layered ACLs");
        Ok(counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AccessControlEntry, AccessStatus, PermissionReference, QName};
    use crate::db::test_utils::{test_pool, test_txn};
    use crate::layered::to_node_ref;

    fn allow(authority: &str) -> AccessControlEntry {
        AccessControlEntry::new(
            authority,
            PermissionReference::new(QName::new("urn:acld:test", "base"), "Read"),
            AccessStatus::Allowed,
        )
    }

    fn head(path: &str) -> NodeRef {
        to_node_ref(HEAD, path).unwrap()
    }

    #[tokio::test]
    async fn test_inheritance_reaches_layered_directories() {
        let pool = test_pool().await;
        let dao = LayeredAclDao::new();
        let engine = AclEngine::new();
        let store = LayeredStore::new();
        let mut txn = test_txn(&pool).await;

        store.create_store(&mut txn, "site").await.unwrap();
        store.create_directory(&mut txn, "site:/", "a").await.unwrap();
        store.create_file(&mut txn, "site:/a", "f").await.unwrap();
        store
            .create_layered_directory(&mut txn, "site:/a", "site:/", "b")
            .await
            .unwrap();

        let root_acl = engine
            .create_acl(&mut txn, AclProperties::new(AclType::Defining), &[allow("root")], None)
            .await
            .unwrap();
        dao.set_acl_id(&mut txn, &head("site:/"), Some(root_acl.id))
            .await
            .unwrap();
        dao.set_inheritance_for_children(&mut txn, &head("site:/"), root_acl.id, None)
            .await
            .unwrap();

        let shared = engine
            .get_inherited_access_control_list(&mut txn, root_acl.id)
            .await
            .unwrap();
        for path in ["site:/a", "site:/a/f", "site:/b", "site:/b/f"] {
            assert_eq!(dao.get_acl_id(&mut txn, &head(path)).await.unwrap(), shared, "{path}");
        }
        // Already showing the right ACL, so never copied into the layer
        let virtual_file = store.lookup(&mut txn, HEAD, "site:/b/f").await.unwrap().unwrap();
        assert!(!virtual_file.primary);

        assert_eq!(
            dao.get_inherited_acl(&mut txn, &head("site:/a/f")).await.unwrap(),
            shared
        );
    }

    #[tokio::test]
    async fn test_snapshots_are_read_only() {
        let pool = test_pool().await;
        let dao = LayeredAclDao::new();
        let store = LayeredStore::new();
        let mut txn = test_txn(&pool).await;

        store.create_store(&mut txn, "site").await.unwrap();
        store.create_directory(&mut txn, "site:/", "a").await.unwrap();
        let version = store.snapshot(&mut txn, "site").await.unwrap();

        let snap = to_node_ref(version, "site:/a").unwrap();
        assert_eq!(dao.get_acl_id(&mut txn, &snap).await.unwrap(), None);
        assert!(matches!(
            dao.set_acl_id(&mut txn, &snap, None).await,
            Err(AclError::InvalidNodeReference(_))
        ));
        assert!(matches!(
            dao.force_copy(&mut txn, &snap).await,
            Err(AclError::InvalidNodeReference(_))
        ));
    }

    #[tokio::test]
    async fn test_force_copy_marks_acl_for_versioning() {
        let pool = test_pool().await;
        let dao = LayeredAclDao::new();
        let engine = AclEngine::new();
        let store = LayeredStore::new();
        let mut txn = test_txn(&pool).await;

        store.create_store(&mut txn, "site").await.unwrap();
        store.create_directory(&mut txn, "site:/", "a").await.unwrap();
        store.create_file(&mut txn, "site:/a", "f").await.unwrap();
        store
            .create_layered_directory(&mut txn, "site:/a", "site:/", "b")
            .await
            .unwrap();
        let acl = engine
            .create_acl(
                &mut txn,
                AclProperties::new(AclType::Defining).versioned(true),
                &[allow("alice")],
                None,
            )
            .await
            .unwrap();
        store.set_acl(&mut txn, HEAD, "site:/a/f", Some(acl.id)).await.unwrap();

        dao.force_copy(&mut txn, &head("site:/b/f")).await.unwrap();

        let copied = store.lookup(&mut txn, HEAD, "site:/b/f").await.unwrap().unwrap();
        assert!(copied.primary);
        assert_eq!(copied.acl_id, Some(acl.id));
        assert!(engine.get_acl_properties(&mut txn, acl.id).await.unwrap().requires_version);
    }

    #[tokio::test]
    async fn test_store_acls_and_unsupported_operations() {
        let pool = test_pool().await;
        let dao = LayeredAclDao::new();
        let engine = AclEngine::new();
        let store = LayeredStore::new();
        let mut txn = test_txn(&pool).await;

        store.create_store(&mut txn, "site").await.unwrap();
        let site = StoreRef::layered("site");
        assert_eq!(dao.get_store_acl(&mut txn, &site).await.unwrap(), None);

        let acl = engine.create_default_acl(&mut txn).await.unwrap();
        dao.set_store_acl(&mut txn, &site, Some(acl.id)).await.unwrap();
        assert_eq!(dao.get_store_acl(&mut txn, &site).await.unwrap(), Some(acl.id));

        assert!(matches!(
            dao.update_inheritance(&mut txn, &head("site:/"), None, &head("site:/"))
                .await,
            Err(AclError::UnsupportedForBackend { backend: "layered", .. })
        ));
        assert!(matches!(
            dao.delete_acl_for_node(&mut txn, &head("site:/")).await,
            Err(AclError::UnsupportedForBackend { .. })
        ));
    }

    #[tokio::test]
    async fn test_patch_converts_old_and_layers() {
        let pool = test_pool().await;
        let dao = LayeredAclDao::new();
        let engine = AclEngine::new();
        let store = LayeredStore::new();
        let mut txn = test_txn(&pool).await;

        store.create_store(&mut txn, "site").await.unwrap();
        store.create_directory(&mut txn, "site:/", "a").await.unwrap();
        store.create_file(&mut txn, "site:/a", "f").await.unwrap();
        store
            .create_layered_directory(&mut txn, "site:/a", "site:/", "b")
            .await
            .unwrap();
        let old = engine
            .create_acl(&mut txn, AclProperties::new(AclType::Old), &[allow("alice")], None)
            .await
            .unwrap();
        store.set_acl(&mut txn, HEAD, "site:/a", Some(old.id)).await.unwrap();

        let counters = dao.patch_acls(&mut txn).await.unwrap();
        assert_eq!(counters.get(AclType::Defining), 1);
        assert_eq!(counters.get(AclType::Layered), 1);
        assert_eq!(counters.total(), 2);

        let a = dao.get_acl_id(&mut txn, &head("site:/a")).await.unwrap().unwrap();
        let a_acl = engine.get_access_control_list(&mut txn, a).await.unwrap();
        assert_eq!(a_acl.properties.acl_type, AclType::Defining);
        assert!(a_acl.properties.versioned);
        assert_eq!(a_acl.positions_of("alice", "Read"), vec![0]);

        // The file below picks up the new derivative
        let shared = engine.get_inherited_access_control_list(&mut txn, a).await.unwrap();
        assert_eq!(dao.get_acl_id(&mut txn, &head("site:/a/f")).await.unwrap(), shared);

        let b = dao.get_acl_id(&mut txn, &head("site:/b")).await.unwrap().unwrap();
        let b_acl = engine.get_access_control_list(&mut txn, b).await.unwrap();
        assert_eq!(b_acl.properties.acl_type, AclType::Layered);
        assert_eq!(b_acl.positions_of("alice", "Read"), vec![2]);
    }
}
