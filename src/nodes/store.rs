//! Node persistence for tree-structured stores

use tracing::debug;

use super::{NodeId, NodeRef, StoreRef};
use crate::acl::{intern, AclId, AclTxn, QName};
use crate::error::AclError;

/// Node storage with database backing
///
/// Stateless; every call runs inside the caller's [`AclTxn`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeStore;

impl NodeStore {
    pub fn new() -> Self {
        Self
    }

    /// Create a store together with its root node
    pub async fn create_store(
        &self,
        txn: &mut AclTxn,
        store: &StoreRef,
    ) -> Result<NodeId, AclError> {
        let result = sqlx::query("INSERT INTO stores (protocol, identifier) VALUES (?, ?)")
            .bind(&store.protocol)
            .bind(&store.identifier)
            .execute(txn.conn())
            .await?;
        let store_id = result.last_insert_rowid();

        let root = insert_node(txn, store_id, None, "").await?;
        sqlx::query("UPDATE stores SET root_node_id = ?, version = version + 1 WHERE id = ?")
            .bind(root)
            .bind(store_id)
            .execute(txn.conn())
            .await?;

        debug!(store = %store, root, "Created store");
        Ok(root)
    }

    /// Every store with its root node
    pub async fn stores(&self, txn: &mut AclTxn) -> Result<Vec<(StoreRef, NodeId)>, AclError> {
        let rows: Vec<(String, String, Option<i64>)> = sqlx::query_as(
            "SELECT protocol, identifier, root_node_id FROM stores ORDER BY id",
        )
        .fetch_all(txn.conn())
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(protocol, identifier, root)| {
                root.map(|root| (StoreRef::new(&protocol, &identifier), root))
            })
            .collect())
    }

    pub async fn root_node(&self, txn: &mut AclTxn, store: &StoreRef) -> Result<NodeId, AclError> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT root_node_id FROM stores WHERE protocol = ? AND identifier = ?")
                .bind(&store.protocol)
                .bind(&store.identifier)
                .fetch_optional(txn.conn())
                .await?;

        row.and_then(|(root,)| root)
            .ok_or_else(|| AclError::NodeNotFound(store.to_string()))
    }

    /// Create a node under `parent` in the parent's store
    pub async fn create_node(
        &self,
        txn: &mut AclTxn,
        parent: NodeId,
        name: &str,
    ) -> Result<NodeId, AclError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT store_id FROM nodes WHERE id = ?")
            .bind(parent)
            .fetch_optional(txn.conn())
            .await?;
        let (store_id,) = row.ok_or_else(|| AclError::NodeNotFound(parent.to_string()))?;

        insert_node(txn, store_id, Some(parent), name).await
    }

    /// Resolve a node reference to its id
    pub async fn node_id(&self, txn: &mut AclTxn, node: &NodeRef) -> Result<NodeId, AclError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT n.id FROM nodes n
            JOIN stores s ON s.id = n.store_id
            WHERE s.protocol = ? AND s.identifier = ? AND n.uuid = ?
            "#,
        )
        .bind(&node.store.protocol)
        .bind(&node.store.identifier)
        .bind(&node.id)
        .fetch_optional(txn.conn())
        .await?;

        row.map(|(id,)| id)
            .ok_or_else(|| AclError::NodeNotFound(node.to_string()))
    }

    pub async fn node_ref(&self, txn: &mut AclTxn, node: NodeId) -> Result<NodeRef, AclError> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT s.protocol, s.identifier, n.uuid FROM nodes n
            JOIN stores s ON s.id = n.store_id
            WHERE n.id = ?
            "#,
        )
        .bind(node)
        .fetch_optional(txn.conn())
        .await?;

        let (protocol, identifier, uuid) =
            row.ok_or_else(|| AclError::NodeNotFound(node.to_string()))?;
        Ok(NodeRef::new(StoreRef::new(&protocol, &identifier), &uuid))
    }

    pub async fn child_by_name(
        &self,
        txn: &mut AclTxn,
        parent: NodeId,
        name: &str,
    ) -> Result<Option<NodeId>, AclError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM nodes WHERE parent_id = ? AND name = ?")
                .bind(parent)
                .bind(name)
                .fetch_optional(txn.conn())
                .await?;
        Ok(row.map(|(id,)| id))
    }

    pub async fn get_node_acl_id(
        &self,
        txn: &mut AclTxn,
        node: NodeId,
    ) -> Result<Option<AclId>, AclError> {
        let row: Option<(Option<i64>,)> = sqlx::query_as("SELECT acl_id FROM nodes WHERE id = ?")
            .bind(node)
            .fetch_optional(txn.conn())
            .await?;

        row.map(|(acl,)| acl)
            .ok_or_else(|| AclError::NodeNotFound(node.to_string()))
    }

    pub async fn set_node_acl_id(
        &self,
        txn: &mut AclTxn,
        node: NodeId,
        acl: Option<AclId>,
    ) -> Result<(), AclError> {
        let result = sqlx::query(
            "UPDATE nodes SET acl_id = ?, version = version + 1, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(acl)
        .bind(node)
        .execute(txn.conn())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AclError::NodeNotFound(node.to_string()));
        }
        Ok(())
    }

    /// `(child, acl)` for every primary child of `parent`
    pub async fn get_primary_children_acls(
        &self,
        txn: &mut AclTxn,
        parent: NodeId,
    ) -> Result<Vec<(NodeId, Option<AclId>)>, AclError> {
        let rows: Vec<(i64, Option<i64>)> =
            sqlx::query_as("SELECT id, acl_id FROM nodes WHERE parent_id = ? ORDER BY id")
                .bind(parent)
                .fetch_all(txn.conn())
                .await?;
        Ok(rows)
    }

    /// Point children with no ACL, or with `shared_to_replace`, at `shared`
    pub async fn set_primary_children_shared_acl_id(
        &self,
        txn: &mut AclTxn,
        parent: NodeId,
        shared_to_replace: Option<AclId>,
        shared: AclId,
    ) -> Result<u64, AclError> {
        let result = sqlx::query(
            r#"
            UPDATE nodes SET acl_id = ?, version = version + 1, updated_at = datetime('now')
            WHERE parent_id = ? AND (acl_id IS NULL OR acl_id = ?)
            "#,
        )
        .bind(shared)
        .bind(parent)
        .bind(shared_to_replace)
        .execute(txn.conn())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_primary_parent(
        &self,
        txn: &mut AclTxn,
        node: NodeId,
    ) -> Result<Option<NodeId>, AclError> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT parent_id FROM nodes WHERE id = ?")
                .bind(node)
                .fetch_optional(txn.conn())
                .await?;

        row.map(|(parent,)| parent)
            .ok_or_else(|| AclError::NodeNotFound(node.to_string()))
    }

    /// Reparent a node; ACL inheritance is updated separately
    pub async fn move_node(
        &self,
        txn: &mut AclTxn,
        node: NodeId,
        new_parent: NodeId,
    ) -> Result<(), AclError> {
        let result = sqlx::query(
            "UPDATE nodes SET parent_id = ?, version = version + 1, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(new_parent)
        .bind(node)
        .execute(txn.conn())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AclError::NodeNotFound(node.to_string()));
        }
        Ok(())
    }

    pub async fn add_aspect(
        &self,
        txn: &mut AclTxn,
        node: NodeId,
        aspect: &QName,
    ) -> Result<(), AclError> {
        let qname_id = intern::get_or_create_qname(txn, aspect).await?;
        sqlx::query("INSERT OR IGNORE INTO node_aspects (node_id, qname_id) VALUES (?, ?)")
            .bind(node)
            .bind(qname_id)
            .execute(txn.conn())
            .await?;
        Ok(())
    }

    pub async fn remove_aspect(
        &self,
        txn: &mut AclTxn,
        node: NodeId,
        aspect: &QName,
    ) -> Result<(), AclError> {
        let Some(qname_id) = intern::get_qname(txn, aspect).await? else {
            return Ok(());
        };
        sqlx::query("DELETE FROM node_aspects WHERE node_id = ? AND qname_id = ?")
            .bind(node)
            .bind(qname_id)
            .execute(txn.conn())
            .await?;
        Ok(())
    }

    pub async fn has_aspect(
        &self,
        txn: &mut AclTxn,
        node: NodeId,
        aspect: &QName,
    ) -> Result<bool, AclError> {
        let Some(qname_id) = intern::get_qname(txn, aspect).await? else {
            return Ok(false);
        };
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT node_id FROM node_aspects WHERE node_id = ? AND qname_id = ?")
                .bind(node)
                .bind(qname_id)
                .fetch_optional(txn.conn())
                .await?;
        Ok(row.is_some())
    }

    /// Set a property; values are stored as JSON
    pub async fn set_property(
        &self,
        txn: &mut AclTxn,
        node: NodeId,
        property: &QName,
        value: &serde_json::Value,
    ) -> Result<(), AclError> {
        let qname_id = intern::get_or_create_qname(txn, property).await?;
        let json = serde_json::to_string(value)?;
        sqlx::query(
            r#"
            INSERT INTO node_properties (node_id, qname_id, value) VALUES (?, ?, ?)
            ON CONFLICT(node_id, qname_id) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(node)
        .bind(qname_id)
        .bind(&json)
        .execute(txn.conn())
        .await?;
        Ok(())
    }

    pub async fn get_property(
        &self,
        txn: &mut AclTxn,
        node: NodeId,
        property: &QName,
    ) -> Result<Option<serde_json::Value>, AclError> {
        let Some(qname_id) = intern::get_qname(txn, property).await? else {
            return Ok(None);
        };
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM node_properties WHERE node_id = ? AND qname_id = ?")
                .bind(node)
                .bind(qname_id)
                .fetch_optional(txn.conn())
                .await?;

        match row {
            Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn remove_property(
        &self,
        txn: &mut AclTxn,
        node: NodeId,
        property: &QName,
    ) -> Result<(), AclError> {
        let Some(qname_id) = intern::get_qname(txn, property).await? else {
            return Ok(());
        };
        sqlx::query("DELETE FROM node_properties WHERE node_id = ? AND qname_id = ?")
            .bind(node)
            .bind(qname_id)
            .execute(txn.conn())
            .await?;
        Ok(())
    }

    /// Up to `limit` nodes carrying `aspect` with ids above `after`, in id order
    pub async fn nodes_with_aspect(
        &self,
        txn: &mut AclTxn,
        aspect: &QName,
        after: NodeId,
        limit: i64,
    ) -> Result<Vec<NodeId>, AclError> {
        let Some(qname_id) = intern::get_qname(txn, aspect).await? else {
            return Ok(Vec::new());
        };
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT node_id FROM node_aspects WHERE qname_id = ? AND node_id > ? ORDER BY node_id LIMIT ?",
        )
        .bind(qname_id)
        .bind(after)
        .bind(limit)
        .fetch_all(txn.conn())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Nodes whose ACL is `acl`
    pub async fn nodes_by_acl(&self, txn: &mut AclTxn, acl: AclId) -> Result<Vec<NodeId>, AclError> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM nodes WHERE acl_id = ? ORDER BY id")
            .bind(acl)
            .fetch_all(txn.conn())
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

async fn insert_node(
    txn: &mut AclTxn,
    store_id: i64,
    parent: Option<NodeId>,
    name: &str,
) -> Result<NodeId, AclError> {
    let result = sqlx::query("INSERT INTO nodes (store_id, uuid, parent_id, name) VALUES (?, ?, ?, ?)")
        .bind(store_id)
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(parent)
        .bind(name)
        .execute(txn.conn())
        .await?;
    Ok(result.last_insert_rowid())
}
