//! Row-level persistence for ACLs, members and ACEs
//!
//! Updates and deletes of ACL rows are optimistic: they target `(id, version)`
//! and fail with [`AclError::ConcurrencyConflict`] when the row moved on.

use sqlx::SqliteConnection;

use super::{
    AccessControlEntry, AccessStatus, AceId, AceType, Acl, AclId, AclType, PermissionReference,
    QName,
};
use crate::error::AclError;

const ACL_COLUMNS: &str = "id, version, acl_guid, acl_version, latest, inherits, inherits_from, \
     acl_type, inherited_acl, versioned, requires_version, change_set_id";

#[derive(sqlx::FromRow)]
struct AclRow {
    id: i64,
    version: i64,
    acl_guid: String,
    acl_version: i64,
    latest: bool,
    inherits: bool,
    inherits_from: Option<i64>,
    acl_type: i64,
    inherited_acl: Option<i64>,
    versioned: bool,
    requires_version: bool,
    change_set_id: Option<i64>,
}

impl AclRow {
    fn into_acl(self) -> Result<Acl, AclError> {
        let acl_type = AclType::from_code(self.acl_type).ok_or_else(|| {
            AclError::Database(sqlx::Error::Decode(
                format!("unknown ACL type code {} on ACL {}", self.acl_type, self.id).into(),
            ))
        })?;
        Ok(Acl {
            id: self.id,
            version: self.version,
            guid: self.acl_guid,
            acl_version: self.acl_version,
            latest: self.latest,
            inherits: self.inherits,
            inherits_from: self.inherits_from,
            acl_type,
            inherited_acl: self.inherited_acl,
            versioned: self.versioned,
            requires_version: self.requires_version,
            change_set_id: self.change_set_id,
        })
    }
}

/// Get an ACL row by id
pub async fn get_acl(conn: &mut SqliteConnection, id: AclId) -> Result<Option<Acl>, AclError> {
    let row: Option<AclRow> =
        sqlx::query_as(&format!("SELECT {} FROM acls WHERE id = ?", ACL_COLUMNS))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
    row.map(AclRow::into_acl).transpose()
}

/// Get an ACL row, failing with `AclNotFound`
pub async fn require_acl(conn: &mut SqliteConnection, id: AclId) -> Result<Acl, AclError> {
    get_acl(conn, id).await?.ok_or(AclError::AclNotFound(id))
}

/// Latest version of the ACL identified by `guid`
pub async fn latest_acl_by_guid(
    conn: &mut SqliteConnection,
    guid: &str,
) -> Result<Option<Acl>, AclError> {
    let row: Option<AclRow> = sqlx::query_as(&format!(
        "SELECT {} FROM acls WHERE acl_guid = ? AND latest = 1",
        ACL_COLUMNS
    ))
    .bind(guid)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(AclRow::into_acl).transpose()
}

/// Every version of `guid`, oldest first
pub async fn acl_versions(conn: &mut SqliteConnection, guid: &str) -> Result<Vec<Acl>, AclError> {
    let rows: Vec<AclRow> = sqlx::query_as(&format!(
        "SELECT {} FROM acls WHERE acl_guid = ? ORDER BY acl_version",
        ACL_COLUMNS
    ))
    .bind(guid)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(AclRow::into_acl).collect()
}

/// Insert a new ACL row; `acl.id` and `acl.version` are ignored
pub async fn insert_acl(conn: &mut SqliteConnection, acl: &Acl) -> Result<AclId, AclError> {
    let result = sqlx::query(
        r#"
        INSERT INTO acls (version, acl_guid, acl_version, latest, inherits, inherits_from,
                          acl_type, inherited_acl, versioned, requires_version, change_set_id)
        VALUES (0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&acl.guid)
    .bind(acl.acl_version)
    .bind(acl.latest)
    .bind(acl.inherits)
    .bind(acl.inherits_from)
    .bind(acl.acl_type.code())
    .bind(acl.inherited_acl)
    .bind(acl.versioned)
    .bind(acl.requires_version)
    .bind(acl.change_set_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Write every mutable column of `acl`, returning the row at its new version
pub async fn update_acl(conn: &mut SqliteConnection, acl: &Acl) -> Result<Acl, AclError> {
    let result = sqlx::query(
        r#"
        UPDATE acls
        SET version = version + 1, latest = ?, inherits = ?, inherits_from = ?, acl_type = ?,
            inherited_acl = ?, versioned = ?, requires_version = ?, change_set_id = ?
        WHERE id = ? AND version = ?
        "#,
    )
    .bind(acl.latest)
    .bind(acl.inherits)
    .bind(acl.inherits_from)
    .bind(acl.acl_type.code())
    .bind(acl.inherited_acl)
    .bind(acl.versioned)
    .bind(acl.requires_version)
    .bind(acl.change_set_id)
    .bind(acl.id)
    .bind(acl.version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AclError::ConcurrencyConflict { id: acl.id });
    }

    Ok(Acl {
        version: acl.version + 1,
        ..acl.clone()
    })
}

/// Delete an ACL row and its members
pub async fn delete_acl(conn: &mut SqliteConnection, acl: &Acl) -> Result<(), AclError> {
    delete_members(conn, acl.id).await?;
    let result = sqlx::query("DELETE FROM acls WHERE id = ? AND version = ?")
        .bind(acl.id)
        .bind(acl.version)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AclError::ConcurrencyConflict { id: acl.id });
    }
    Ok(())
}

/// Latest, inheriting ACLs whose `inherits_from` is `id`
pub async fn acls_inheriting_from(
    conn: &mut SqliteConnection,
    id: AclId,
) -> Result<Vec<AclId>, AclError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT id FROM acls WHERE inherits_from = ? AND inherits = 1 AND latest = 1 AND id != ? ORDER BY id",
    )
    .bind(id)
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Latest ACLs that inherit from `id` or cache it as their shared derivative
pub async fn count_acl_references(conn: &mut SqliteConnection, id: AclId) -> Result<i64, AclError> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM acls WHERE latest = 1 AND id != ? AND (inherits_from = ? OR inherited_acl = ?)",
    )
    .bind(id)
    .bind(id)
    .bind(id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

/// Count latest ACLs per kind
pub async fn count_latest_by_type(
    conn: &mut SqliteConnection,
    acl_type: AclType,
) -> Result<i64, AclError> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM acls WHERE acl_type = ? AND latest = 1")
            .bind(acl_type.code())
            .fetch_one(&mut *conn)
            .await?;
    Ok(count)
}

/// `(ace id, position)` pairs of an ACL
pub async fn members(
    conn: &mut SqliteConnection,
    acl_id: AclId,
) -> Result<Vec<(AceId, i32)>, AclError> {
    let rows: Vec<(i64, i32)> =
        sqlx::query_as("SELECT ace_id, pos FROM acl_members WHERE acl_id = ? ORDER BY pos, ace_id")
            .bind(acl_id)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows)
}

pub async fn add_member(
    conn: &mut SqliteConnection,
    acl_id: AclId,
    ace_id: AceId,
    pos: i32,
) -> Result<(), AclError> {
    sqlx::query("INSERT OR IGNORE INTO acl_members (acl_id, ace_id, pos) VALUES (?, ?, ?)")
        .bind(acl_id)
        .bind(ace_id)
        .bind(pos)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Copy every member of `from` onto `to`
pub async fn copy_members(
    conn: &mut SqliteConnection,
    from: AclId,
    to: AclId,
) -> Result<(), AclError> {
    sqlx::query(
        "INSERT OR IGNORE INTO acl_members (acl_id, ace_id, pos) SELECT ?, ace_id, pos FROM acl_members WHERE acl_id = ?",
    )
    .bind(to)
    .bind(from)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_members(conn: &mut SqliteConnection, acl_id: AclId) -> Result<u64, AclError> {
    let result = sqlx::query("DELETE FROM acl_members WHERE acl_id = ?")
        .bind(acl_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete_member(conn: &mut SqliteConnection, member_id: i64) -> Result<(), AclError> {
    sqlx::query("DELETE FROM acl_members WHERE id = ?")
        .bind(member_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Drop members deeper than `depth`
pub async fn truncate_below(
    conn: &mut SqliteConnection,
    acl_id: AclId,
    depth: i32,
) -> Result<u64, AclError> {
    let result = sqlx::query("DELETE FROM acl_members WHERE acl_id = ? AND pos > ?")
        .bind(acl_id)
        .bind(depth)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Remove the level at `level` and pull deeper members up by one
pub async fn remove_level(
    conn: &mut SqliteConnection,
    acl_id: AclId,
    level: i32,
) -> Result<(), AclError> {
    sqlx::query("DELETE FROM acl_members WHERE acl_id = ? AND pos = ?")
        .bind(acl_id)
        .bind(level)
        .execute(&mut *conn)
        .await?;
    shift_positions(conn, acl_id, level, -1).await
}

/// Push members deeper than `depth` down by one, opening a level at `depth + 1`
pub async fn open_level(
    conn: &mut SqliteConnection,
    acl_id: AclId,
    depth: i32,
) -> Result<(), AclError> {
    shift_positions(conn, acl_id, depth, 1).await
}

// Two passes through negative positions keep UNIQUE(acl_id, ace_id, pos)
// satisfied row by row.
async fn shift_positions(
    conn: &mut SqliteConnection,
    acl_id: AclId,
    above: i32,
    delta: i32,
) -> Result<(), AclError> {
    sqlx::query("UPDATE acl_members SET pos = -(pos + ?) - 1 WHERE acl_id = ? AND pos > ?")
        .bind(delta)
        .bind(acl_id)
        .bind(above)
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE acl_members SET pos = -(pos + 1), version = version + 1 WHERE acl_id = ? AND pos < 0")
        .bind(acl_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// A member joined with its resolved entry
#[derive(Debug, Clone)]
pub struct MemberEntry {
    pub member_id: i64,
    pub ace_id: AceId,
    pub entry: AccessControlEntry,
}

#[derive(sqlx::FromRow)]
struct MemberEntryRow {
    member_id: i64,
    ace_id: i64,
    pos: i32,
    allowed: bool,
    ace_type: i64,
    authority: String,
    permission: String,
    namespace: String,
    local_name: String,
}

/// Resolved entries of an ACL
pub async fn member_entries(
    conn: &mut SqliteConnection,
    acl_id: AclId,
) -> Result<Vec<MemberEntry>, AclError> {
    let rows: Vec<MemberEntryRow> = sqlx::query_as(
        r#"
        SELECT m.id AS member_id, m.ace_id, m.pos, a.allowed, a.ace_type,
               au.authority, p.name AS permission, q.namespace, q.local_name
        FROM acl_members m
        JOIN acl_aces a ON a.id = m.ace_id
        JOIN acl_authorities au ON au.id = a.authority_id
        JOIN acl_permissions p ON p.id = a.permission_id
        JOIN qnames q ON q.id = p.type_qname_id
        WHERE m.acl_id = ?
        ORDER BY m.pos, m.id
        "#,
    )
    .bind(acl_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|r| {
            let ace_type = AceType::from_code(r.ace_type).ok_or_else(|| {
                AclError::Database(sqlx::Error::Decode(
                    format!("unknown ACE type code {}", r.ace_type).into(),
                ))
            })?;
            Ok(MemberEntry {
                member_id: r.member_id,
                ace_id: r.ace_id,
                entry: AccessControlEntry {
                    authority: r.authority,
                    permission: PermissionReference {
                        qname: QName {
                            namespace: r.namespace,
                            local_name: r.local_name,
                        },
                        name: r.permission,
                    },
                    access_status: AccessStatus::from_allowed(r.allowed),
                    ace_type,
                    position: r.pos,
                },
            })
        })
        .collect()
}

/// Get or create the content-addressed ACE row
pub async fn get_or_create_ace(
    conn: &mut SqliteConnection,
    permission_id: i64,
    authority_id: i64,
    allowed: bool,
    ace_type: AceType,
) -> Result<AceId, AclError> {
    let existing: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM acl_aces WHERE permission_id = ? AND authority_id = ? AND allowed = ? AND ace_type = ?",
    )
    .bind(permission_id)
    .bind(authority_id)
    .bind(allowed)
    .bind(ace_type.code())
    .fetch_optional(&mut *conn)
    .await?;

    if let Some((id,)) = existing {
        return Ok(id);
    }

    let result = sqlx::query(
        "INSERT INTO acl_aces (permission_id, authority_id, allowed, ace_type) VALUES (?, ?, ?, ?)",
    )
    .bind(permission_id)
    .bind(authority_id)
    .bind(allowed)
    .bind(ace_type.code())
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// ACLs holding any member for `authority_id`
pub async fn acls_with_authority(
    conn: &mut SqliteConnection,
    authority_id: i64,
) -> Result<Vec<AclId>, AclError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT m.acl_id FROM acl_members m
        JOIN acl_aces a ON a.id = m.ace_id
        WHERE a.authority_id = ?
        ORDER BY m.acl_id
        "#,
    )
    .bind(authority_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Remove an authority along with its ACEs and every member referencing them
pub async fn purge_authority(
    conn: &mut SqliteConnection,
    authority_id: i64,
) -> Result<u64, AclError> {
    let members = sqlx::query(
        "DELETE FROM acl_members WHERE ace_id IN (SELECT id FROM acl_aces WHERE authority_id = ?)",
    )
    .bind(authority_id)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM acl_aces WHERE authority_id = ?")
        .bind(authority_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM acl_authorities WHERE id = ?")
        .bind(authority_id)
        .execute(&mut *conn)
        .await?;
    Ok(members.rows_affected())
}
