//! Layered node persistence

use std::collections::BTreeMap;

use tracing::debug;

use super::{
    base_name, join_path, parent_path, root_path, Indirection, LayeredKind, LayeredNode,
    ListingMode, HEAD,
};
use crate::acl::{AclId, AclTxn};
use crate::error::AclError;
use crate::BoxFuture;

/// Indirection chains longer than this are treated as dangling
const MAX_INDIRECTION_HOPS: usize = 32;

/// Layered store with database backing
#[derive(Debug, Clone, Copy, Default)]
pub struct LayeredStore;

#[derive(sqlx::FromRow)]
struct LayeredNodeRow {
    id: i64,
    snapshot: i64,
    path: String,
    name: String,
    kind: String,
    indirection: Option<String>,
    indirection_version: i64,
    acl_id: Option<i64>,
}

impl LayeredNodeRow {
    fn into_node(self) -> Result<LayeredNode, AclError> {
        Ok(LayeredNode {
            id: self.id,
            version: self.snapshot,
            kind: self.kind.parse()?,
            name: self.name,
            indirection: self.indirection,
            indirection_version: self.indirection_version,
            acl_id: self.acl_id,
            primary: true,
            backing_version: self.snapshot,
            backing_path: self.path.clone(),
            path: self.path,
        })
    }
}

const NODE_COLUMNS: &str =
    "id, snapshot, path, name, kind, indirection, indirection_version, acl_id";

fn read_only(version: i64, path: &str) -> AclError {
    AclError::InvalidNodeReference(format!("{version};{path} is a read-only snapshot"))
}

/// A backing node seen through a layer at `(version, path)`
fn virtual_view(backing: LayeredNode, version: i64, path: &str) -> LayeredNode {
    LayeredNode {
        version,
        path: path.to_string(),
        name: base_name(path).to_string(),
        primary: false,
        ..backing
    }
}

impl LayeredStore {
    pub fn new() -> Self {
        Self
    }

    /// Create a store with an empty plain root directory
    pub async fn create_store(&self, txn: &mut AclTxn, name: &str) -> Result<LayeredNode, AclError> {
        sqlx::query("INSERT INTO layered_stores (name) VALUES (?)")
            .bind(name)
            .execute(txn.conn())
            .await?;

        let root = root_path(name);
        self.insert(txn, &root, LayeredKind::PlainDirectory, None, HEAD, None)
            .await?;
        debug!(store = name, "Created layered store");
        self.require(txn, HEAD, &root).await
    }

    pub async fn stores(&self, txn: &mut AclTxn) -> Result<Vec<String>, AclError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM layered_stores ORDER BY name")
            .fetch_all(txn.conn())
            .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    pub async fn create_directory(
        &self,
        txn: &mut AclTxn,
        parent: &str,
        name: &str,
    ) -> Result<LayeredNode, AclError> {
        self.create_child(txn, parent, name, LayeredKind::PlainDirectory, None, HEAD)
            .await
    }

    pub async fn create_file(
        &self,
        txn: &mut AclTxn,
        parent: &str,
        name: &str,
    ) -> Result<LayeredNode, AclError> {
        self.create_child(txn, parent, name, LayeredKind::PlainFile, None, HEAD)
            .await
    }

    /// Create a layered directory over `target` (head version)
    pub async fn create_layered_directory(
        &self,
        txn: &mut AclTxn,
        target: &str,
        parent: &str,
        name: &str,
    ) -> Result<LayeredNode, AclError> {
        self.create_child(
            txn,
            parent,
            name,
            LayeredKind::LayeredDirectory,
            Some(target),
            HEAD,
        )
        .await
    }

    pub async fn create_layered_file(
        &self,
        txn: &mut AclTxn,
        target: &str,
        parent: &str,
        name: &str,
    ) -> Result<LayeredNode, AclError> {
        self.create_child(txn, parent, name, LayeredKind::LayeredFile, Some(target), HEAD)
            .await
    }

    /// Resolve `(version, path)`, following layers for virtual nodes
    pub async fn lookup(
        &self,
        txn: &mut AclTxn,
        version: i64,
        path: &str,
    ) -> Result<Option<LayeredNode>, AclError> {
        self.resolve(txn, version, path.to_string(), 0).await
    }

    pub async fn node_by_id(&self, txn: &mut AclTxn, id: i64) -> Result<Option<LayeredNode>, AclError> {
        let row: Option<LayeredNodeRow> =
            sqlx::query_as(&format!("SELECT {NODE_COLUMNS} FROM layered_nodes WHERE id = ?"))
                .bind(id)
                .fetch_optional(txn.conn())
                .await?;
        row.map(LayeredNodeRow::into_node).transpose()
    }

    /// Head paths at which the node with row `id` is stored
    pub async fn head_paths(&self, txn: &mut AclTxn, id: i64) -> Result<Vec<String>, AclError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT path FROM layered_nodes WHERE id = ? AND snapshot = -1")
                .bind(id)
                .fetch_all(txn.conn())
                .await?;
        Ok(rows.into_iter().map(|(path,)| path).collect())
    }

    /// Children of a directory, by name
    pub async fn listing(
        &self,
        txn: &mut AclTxn,
        dir: &LayeredNode,
        mode: ListingMode,
    ) -> Result<Vec<LayeredNode>, AclError> {
        let children = self.list(txn, dir.clone(), mode, 0).await?;
        Ok(children.into_values().collect())
    }

    /// ACL of the node visible at `(version, path)`
    pub async fn get_acl(
        &self,
        txn: &mut AclTxn,
        version: i64,
        path: &str,
    ) -> Result<Option<AclId>, AclError> {
        Ok(self
            .lookup(txn, version, path)
            .await?
            .and_then(|node| node.acl_id))
    }

    /// Set the ACL of a head node, materialising it first if it is virtual
    pub async fn set_acl(
        &self,
        txn: &mut AclTxn,
        version: i64,
        path: &str,
        acl: Option<AclId>,
    ) -> Result<(), AclError> {
        let (node, _) = self.force_copy(txn, version, path).await?;
        sqlx::query("UPDATE layered_nodes SET acl_id = ?, version = version + 1 WHERE id = ?")
            .bind(acl)
            .bind(node.id)
            .execute(txn.conn())
            .await?;
        Ok(())
    }

    /// Materialise a virtual head node into its layer
    ///
    /// Returns the stored node and whether a copy was made. Directories are
    /// copied as layered directories over their backing path.
    pub fn force_copy<'a>(
        &'a self,
        txn: &'a mut AclTxn,
        version: i64,
        path: &'a str,
    ) -> BoxFuture<'a, Result<(LayeredNode, bool), AclError>> {
        Box::pin(async move {
            if version != HEAD {
                return Err(read_only(version, path));
            }
            let node = self
                .lookup(txn, HEAD, path)
                .await?
                .ok_or_else(|| AclError::NodeNotFound(path.to_string()))?;
            if node.primary {
                return Ok((node, false));
            }

            if let Some(parent) = parent_path(path) {
                self.force_copy(txn, HEAD, &parent).await?;
            }

            let (kind, indirection, indirection_version) = match node.kind {
                LayeredKind::PlainDirectory | LayeredKind::LayeredDirectory => (
                    LayeredKind::LayeredDirectory,
                    Some(node.backing_path.clone()),
                    node.backing_version,
                ),
                LayeredKind::PlainFile => (LayeredKind::PlainFile, None, HEAD),
                LayeredKind::LayeredFile => (
                    LayeredKind::LayeredFile,
                    node.indirection.clone(),
                    node.indirection_version,
                ),
            };
            self.insert(
                txn,
                path,
                kind,
                indirection.as_deref(),
                indirection_version,
                node.acl_id,
            )
            .await?;

            debug!(path, kind = %kind, "Materialised layered node");
            let copied = self.require(txn, HEAD, path).await?;
            Ok((copied, true))
        })
    }

    /// Freeze the head of `store` as a new read-only snapshot
    pub async fn snapshot(&self, txn: &mut AclTxn, store: &str) -> Result<i64, AclError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT next_snapshot FROM layered_stores WHERE name = ?")
                .bind(store)
                .fetch_optional(txn.conn())
                .await?;
        let (snapshot,) = row.ok_or_else(|| AclError::NodeNotFound(root_path(store)))?;

        sqlx::query(
            r#"
            INSERT INTO layered_nodes
                (store_name, snapshot, path, parent_path, name, kind, indirection, indirection_version, acl_id)
            SELECT store_name, ?, path, parent_path, name, kind, indirection, indirection_version, acl_id
            FROM layered_nodes WHERE store_name = ? AND snapshot = -1
            "#,
        )
        .bind(snapshot)
        .bind(store)
        .execute(txn.conn())
        .await?;

        sqlx::query(
            "UPDATE layered_stores SET next_snapshot = next_snapshot + 1, version = version + 1 WHERE name = ?",
        )
        .bind(store)
        .execute(txn.conn())
        .await?;

        debug!(store, snapshot, "Created snapshot");
        Ok(snapshot)
    }

    /// Every head layered directory and layered file with its target
    pub async fn layered_indirections(&self, txn: &mut AclTxn) -> Result<Vec<Indirection>, AclError> {
        let rows: Vec<(i64, Option<String>, i64)> = sqlx::query_as(
            r#"
            SELECT id, indirection, indirection_version FROM layered_nodes
            WHERE snapshot = -1 AND kind IN ('layered_directory', 'layered_file')
            ORDER BY id
            "#,
        )
        .fetch_all(txn.conn())
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(from, to, to_version)| {
                to.map(|to| Indirection {
                    from,
                    to,
                    to_version,
                })
            })
            .collect())
    }

    /// Head nodes holding `acl`
    pub async fn nodes_by_acl(&self, txn: &mut AclTxn, acl: AclId) -> Result<Vec<LayeredNode>, AclError> {
        let rows: Vec<LayeredNodeRow> = sqlx::query_as(&format!(
            "SELECT {NODE_COLUMNS} FROM layered_nodes WHERE acl_id = ? AND snapshot = -1 ORDER BY id"
        ))
        .bind(acl)
        .fetch_all(txn.conn())
        .await?;
        rows.into_iter().map(LayeredNodeRow::into_node).collect()
    }

    pub async fn get_store_acl(&self, txn: &mut AclTxn, store: &str) -> Result<Option<AclId>, AclError> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT acl_id FROM layered_stores WHERE name = ?")
                .bind(store)
                .fetch_optional(txn.conn())
                .await?;
        row.map(|(acl,)| acl)
            .ok_or_else(|| AclError::NodeNotFound(root_path(store)))
    }

    pub async fn set_store_acl(
        &self,
        txn: &mut AclTxn,
        store: &str,
        acl: Option<AclId>,
    ) -> Result<(), AclError> {
        let result =
            sqlx::query("UPDATE layered_stores SET acl_id = ?, version = version + 1 WHERE name = ?")
                .bind(acl)
                .bind(store)
                .execute(txn.conn())
                .await?;
        if result.rows_affected() == 0 {
            return Err(AclError::NodeNotFound(root_path(store)));
        }
        Ok(())
    }

    async fn require(&self, txn: &mut AclTxn, version: i64, path: &str) -> Result<LayeredNode, AclError> {
        self.lookup(txn, version, path)
            .await?
            .ok_or_else(|| AclError::NodeNotFound(path.to_string()))
    }

    async fn create_child(
        &self,
        txn: &mut AclTxn,
        parent: &str,
        name: &str,
        kind: LayeredKind,
        indirection: Option<&str>,
        indirection_version: i64,
    ) -> Result<LayeredNode, AclError> {
        let (dir, _) = self.force_copy(txn, HEAD, parent).await?;
        if !dir.is_directory() {
            return Err(AclError::InvalidArgument(format!("{parent} is not a directory")));
        }
        let path = join_path(parent, name);
        self.insert(txn, &path, kind, indirection, indirection_version, None)
            .await?;
        self.require(txn, HEAD, &path).await
    }

    async fn insert(
        &self,
        txn: &mut AclTxn,
        path: &str,
        kind: LayeredKind,
        indirection: Option<&str>,
        indirection_version: i64,
        acl: Option<AclId>,
    ) -> Result<(), AclError> {
        let (store, _) = super::split_path(path)?;
        sqlx::query(
            r#"
            INSERT INTO layered_nodes
                (store_name, snapshot, path, parent_path, name, kind, indirection, indirection_version, acl_id)
            VALUES (?, -1, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(store)
        .bind(path)
        .bind(parent_path(path))
        .bind(base_name(path))
        .bind(kind.as_str())
        .bind(indirection)
        .bind(indirection_version)
        .bind(acl)
        .execute(txn.conn())
        .await?;
        Ok(())
    }

    async fn row_at(
        &self,
        txn: &mut AclTxn,
        version: i64,
        path: &str,
    ) -> Result<Option<LayeredNode>, AclError> {
        let row: Option<LayeredNodeRow> = sqlx::query_as(&format!(
            "SELECT {NODE_COLUMNS} FROM layered_nodes WHERE snapshot = ? AND path = ?"
        ))
        .bind(version)
        .bind(path)
        .fetch_optional(txn.conn())
        .await?;
        row.map(LayeredNodeRow::into_node).transpose()
    }

    fn resolve<'a>(
        &'a self,
        txn: &'a mut AclTxn,
        version: i64,
        path: String,
        hops: usize,
    ) -> BoxFuture<'a, Result<Option<LayeredNode>, AclError>> {
        Box::pin(async move {
            if hops > MAX_INDIRECTION_HOPS {
                return Ok(None);
            }
            if let Some(node) = self.row_at(txn, version, &path).await? {
                return Ok(Some(node));
            }
            let Some(parent) = parent_path(&path) else {
                return Ok(None);
            };
            let Some(dir) = self.resolve(txn, version, parent, hops).await? else {
                return Ok(None);
            };

            // Where the child would live underneath the layer
            let (target_version, target_dir) = if !dir.primary {
                (dir.backing_version, dir.backing_path.clone())
            } else if dir.is_layered_directory() {
                match dir.indirection.clone() {
                    Some(target) => (dir.indirection_version, target),
                    None => return Ok(None),
                }
            } else {
                return Ok(None);
            };

            let target = join_path(&target_dir, base_name(&path));
            let backing = self.resolve(txn, target_version, target, hops + 1).await?;
            Ok(backing.map(|b| virtual_view(b, version, &path)))
        })
    }

    fn list<'a>(
        &'a self,
        txn: &'a mut AclTxn,
        dir: LayeredNode,
        mode: ListingMode,
        hops: usize,
    ) -> BoxFuture<'a, Result<BTreeMap<String, LayeredNode>, AclError>> {
        Box::pin(async move {
            let mut children = BTreeMap::new();
            if !dir.is_directory() || hops > MAX_INDIRECTION_HOPS {
                return Ok(children);
            }

            if dir.primary {
                let rows: Vec<LayeredNodeRow> = sqlx::query_as(&format!(
                    "SELECT {NODE_COLUMNS} FROM layered_nodes WHERE snapshot = ? AND parent_path = ?"
                ))
                .bind(dir.version)
                .bind(&dir.path)
                .fetch_all(txn.conn())
                .await?;
                for row in rows {
                    let node = row.into_node()?;
                    children.insert(node.name.clone(), node);
                }
            }
            if mode == ListingMode::DirectOnly {
                return Ok(children);
            }

            let below = if !dir.primary {
                self.resolve(txn, dir.backing_version, dir.backing_path.clone(), hops + 1)
                    .await?
            } else if dir.is_layered_directory() {
                match dir.indirection.clone() {
                    Some(target) => {
                        self.resolve(txn, dir.indirection_version, target, hops + 1)
                            .await?
                    }
                    None => None,
                }
            } else {
                None
            };

            if let Some(below) = below {
                for (name, child) in self.list(txn, below, ListingMode::All, hops + 1).await? {
                    if children.contains_key(&name) {
                        continue;
                    }
                    let path = join_path(&dir.path, &name);
                    children.insert(name, virtual_view(child, dir.version, &path));
                }
            }
            Ok(children)
        })
    }
}
