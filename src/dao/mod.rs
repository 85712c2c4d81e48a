//! Per-backend ACL DAOs
//!
//! Node ACL bookkeeping differs between tree-structured stores and layered
//! stores; both sit behind [`AccessControlListDao`] and are picked once per
//! store reference by [`Backend::for_store`].

pub mod layered;
pub mod tree;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::acl::{AclChange, AclId, AclTxn, AclType};
use crate::error::AclError;
use crate::nodes::{NodeRef, StoreRef};

pub use layered::LayeredAclDao;
pub use tree::TreeAclDao;

/// Node-facing ACL operations of one storage backend
#[async_trait]
pub trait AccessControlListDao: Send + Sync {
    /// Backend name used in errors and logs
    fn backend(&self) -> &'static str;

    async fn get_acl_id(&self, txn: &mut AclTxn, node: &NodeRef) -> Result<Option<AclId>, AclError>;

    async fn set_acl_id(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
        acl: Option<AclId>,
    ) -> Result<(), AclError>;

    /// Shared derivative a child of `node`'s parent would inherit
    async fn get_inherited_acl(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
    ) -> Result<Option<AclId>, AclError>;

    async fn get_store_acl(&self, txn: &mut AclTxn, store: &StoreRef)
        -> Result<Option<AclId>, AclError>;

    async fn set_store_acl(
        &self,
        txn: &mut AclTxn,
        store: &StoreRef,
        acl: Option<AclId>,
    ) -> Result<(), AclError>;

    /// Re-point nodes below `start` whose ACL ids were remapped by `changes`
    async fn update_changed_acls(
        &self,
        txn: &mut AclTxn,
        start: &NodeRef,
        changes: &[AclChange],
    ) -> Result<(), AclError>;

    /// Push the shared derivative of `inherit_from` onto the subtree below `parent`
    ///
    /// When the transaction allows async deferral and its budget is spent,
    /// remaining subtrees are tagged for the fixup worker instead.
    async fn set_inheritance_for_children(
        &self,
        txn: &mut AclTxn,
        parent: &NodeRef,
        inherit_from: AclId,
        shared_to_replace: Option<AclId>,
    ) -> Result<Vec<AclChange>, AclError>;

    /// Reparent hook, called after `child` moved from `old_parent` to `new_parent`
    async fn update_inheritance(
        &self,
        txn: &mut AclTxn,
        child: &NodeRef,
        old_parent: Option<&NodeRef>,
        new_parent: &NodeRef,
    ) -> Result<(), AclError>;

    async fn delete_acl_for_node(
        &self,
        txn: &mut AclTxn,
        node: &NodeRef,
    ) -> Result<Vec<AclChange>, AclError>;

    /// Materialise a node into its own layer and mark its ACL for copy-on-write
    async fn force_copy(&self, txn: &mut AclTxn, node: &NodeRef) -> Result<(), AclError>;

    /// Convert legacy ACLs to the shared model
    async fn patch_acls(&self, txn: &mut AclTxn) -> Result<AclCounters, AclError>;
}

/// Storage backend behind a store protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Tree,
    Layered,
}

impl Backend {
    pub fn for_store(store: &StoreRef) -> Result<Self, AclError> {
        match store.protocol.as_str() {
            StoreRef::PROTOCOL_WORKSPACE | StoreRef::PROTOCOL_ARCHIVE => Ok(Backend::Tree),
            StoreRef::PROTOCOL_LAYERED => Ok(Backend::Layered),
            _ => Err(AclError::InvalidNodeReference(store.to_string())),
        }
    }
}

/// Both backend DAOs, dispatched by store protocol
#[derive(Debug, Clone, Default)]
pub struct AclDaos {
    pub tree: TreeAclDao,
    pub layered: LayeredAclDao,
}

impl AclDaos {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_store(&self, store: &StoreRef) -> Result<&dyn AccessControlListDao, AclError> {
        Ok(match Backend::for_store(store)? {
            Backend::Tree => &self.tree,
            Backend::Layered => &self.layered,
        })
    }

    pub fn for_node(&self, node: &NodeRef) -> Result<&dyn AccessControlListDao, AclError> {
        self.for_store(&node.store)
    }
}

/// Per-kind counts reported by legacy patching; every kind is always present
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclCounters {
    counts: BTreeMap<AclType, u64>,
}

impl Default for AclCounters {
    fn default() -> Self {
        Self {
            counts: AclType::ALL.iter().map(|kind| (*kind, 0)).collect(),
        }
    }
}

impl AclCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, kind: AclType) {
        self.add(kind, 1);
    }

    pub fn add(&mut self, kind: AclType, n: u64) {
        *self.counts.entry(kind).or_insert(0) += n;
    }

    pub fn get(&self, kind: AclType) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &AclCounters) {
        for (kind, n) in &other.counts {
            self.add(*kind, *n);
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AclType, u64)> + '_ {
        self.counts.iter().map(|(kind, n)| (*kind, *n))
    }
}

impl fmt::Display for AclCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (kind, n) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{kind}={n}")?;
            first = false;
        }
        Ok(())
    }
}
