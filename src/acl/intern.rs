//! Key interning for qualified names, permissions and authorities
//!
//! Lookups go through the shared caches first. Ids learned inside a
//! transaction are staged and only become visible to other callers on commit.

use sha2::{Digest, Sha256};

use super::txn::Interned;
use super::{AclTxn, PermissionReference, QName};
use crate::error::AclError;

/// Checksum of an authority name, used as an equality pre-filter
pub fn authority_checksum(authority: &str) -> i64 {
    let digest = Sha256::digest(authority.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Look up a qname id without creating it
pub async fn get_qname(txn: &mut AclTxn, qname: &QName) -> Result<Option<i64>, AclError> {
    if let Some(id) = txn.caches().qname(qname) {
        return Ok(Some(id));
    }

    let row: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM qnames WHERE namespace = ? AND local_name = ?")
            .bind(&qname.namespace)
            .bind(&qname.local_name)
            .fetch_optional(txn.conn())
            .await?;

    if let Some((id,)) = row {
        txn.stage(Interned::QName(qname.clone(), id));
        return Ok(Some(id));
    }
    Ok(None)
}

/// Get or create the id for a qname
pub async fn get_or_create_qname(txn: &mut AclTxn, qname: &QName) -> Result<i64, AclError> {
    if let Some(id) = get_qname(txn, qname).await? {
        return Ok(id);
    }

    let result = sqlx::query("INSERT INTO qnames (namespace, local_name) VALUES (?, ?)")
        .bind(&qname.namespace)
        .bind(&qname.local_name)
        .execute(txn.conn())
        .await?;
    let id = result.last_insert_rowid();
    txn.stage(Interned::QName(qname.clone(), id));
    Ok(id)
}

/// Resolve a qname id
pub async fn qname_by_id(txn: &mut AclTxn, id: i64) -> Result<Option<QName>, AclError> {
    let row: Option<(String, String)> =
        sqlx::query_as("SELECT namespace, local_name FROM qnames WHERE id = ?")
            .bind(id)
            .fetch_optional(txn.conn())
            .await?;
    Ok(row.map(|(ns, local)| QName {
        namespace: ns,
        local_name: local,
    }))
}

/// Look up a permission id without creating it
pub async fn get_permission(
    txn: &mut AclTxn,
    permission: &PermissionReference,
) -> Result<Option<i64>, AclError> {
    let Some(type_id) = get_qname(txn, &permission.qname).await? else {
        return Ok(None);
    };
    if let Some(id) = txn.caches().permission(type_id, &permission.name) {
        return Ok(Some(id));
    }

    let row: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM acl_permissions WHERE type_qname_id = ? AND name = ?")
            .bind(type_id)
            .bind(&permission.name)
            .fetch_optional(txn.conn())
            .await?;

    if let Some((id,)) = row {
        txn.stage(Interned::Permission(type_id, permission.name.clone(), id));
        return Ok(Some(id));
    }
    Ok(None)
}

/// Get or create the id for a permission
pub async fn get_or_create_permission(
    txn: &mut AclTxn,
    permission: &PermissionReference,
) -> Result<i64, AclError> {
    if let Some(id) = get_permission(txn, permission).await? {
        return Ok(id);
    }

    let type_id = get_or_create_qname(txn, &permission.qname).await?;
    let result = sqlx::query("INSERT INTO acl_permissions (type_qname_id, name) VALUES (?, ?)")
        .bind(type_id)
        .bind(&permission.name)
        .execute(txn.conn())
        .await?;
    let id = result.last_insert_rowid();
    txn.stage(Interned::Permission(type_id, permission.name.clone(), id));
    Ok(id)
}

/// Look up an authority id without creating it
pub async fn get_authority(txn: &mut AclTxn, authority: &str) -> Result<Option<i64>, AclError> {
    if let Some(id) = txn.caches().authority(authority) {
        return Ok(Some(id));
    }

    let candidates: Vec<(i64, String)> =
        sqlx::query_as("SELECT id, authority FROM acl_authorities WHERE crc = ?")
            .bind(authority_checksum(authority))
            .fetch_all(txn.conn())
            .await?;

    match candidates.into_iter().find(|(_, name)| name == authority) {
        Some((id, name)) => {
            txn.stage(Interned::Authority(name, id));
            Ok(Some(id))
        }
        None => Ok(None),
    }
}

/// Get or create the id for an authority
pub async fn get_or_create_authority(txn: &mut AclTxn, authority: &str) -> Result<i64, AclError> {
    if let Some(id) = get_authority(txn, authority).await? {
        return Ok(id);
    }

    let result = sqlx::query("INSERT INTO acl_authorities (authority, crc) VALUES (?, ?)")
        .bind(authority)
        .bind(authority_checksum(authority))
        .execute(txn.conn())
        .await?;
    let id = result.last_insert_rowid();
    txn.stage(Interned::Authority(authority.to_string(), id));
    Ok(id)
}

/// Rename an authority in place
///
/// Returns false if `before` is unknown. Cached ACL content naming the old
/// authority is dropped.
pub async fn rename_authority(
    txn: &mut AclTxn,
    before: &str,
    after: &str,
) -> Result<bool, AclError> {
    let Some(id) = get_authority(txn, before).await? else {
        return Ok(false);
    };

    sqlx::query(
        "UPDATE acl_authorities SET authority = ?, crc = ?, version = version + 1 WHERE id = ?",
    )
    .bind(after)
    .bind(authority_checksum(after))
    .bind(id)
    .execute(txn.conn())
    .await?;

    txn.unstage_authority(before);
    txn.caches().forget_authority(before);
    txn.caches().invalidate_all();
    txn.stage(Interned::Authority(after.to_string(), id));
    Ok(true)
}
