//! Database module - SQLite schema for ACLs, tree nodes and layered nodes

#[cfg(test)]
pub mod test_utils;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

/// Database handle wrapping SQLite connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    /// If path is None, uses in-memory database (for testing)
    pub async fn new(path: Option<&str>) -> Result<Self> {
        let conn_str = match path {
            Some(p) => format!("sqlite:{}?mode=rwc", p),
            None => "sqlite::memory:".to_string(),
        };

        let options = SqliteConnectOptions::from_str(&conn_str)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");

        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Database migrations complete");
        Ok(())
    }
}

/// Schema statements, applied in order.
///
/// ACL id columns on nodes, stores and the `inherits_from` / `inherited_acl`
/// pointers carry no foreign keys; retired versions and deleted
/// shared ACLs may still be named by historical rows.
const SCHEMA: &[&str] = &[
    // Interned qualified names (permission types, aspects, properties)
    r#"
    CREATE TABLE IF NOT EXISTS qnames (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        namespace TEXT NOT NULL,
        local_name TEXT NOT NULL,
        UNIQUE(namespace, local_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS acl_permissions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        version INTEGER NOT NULL DEFAULT 0,
        type_qname_id INTEGER NOT NULL REFERENCES qnames(id),
        name TEXT NOT NULL,
        UNIQUE(type_qname_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS acl_authorities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        version INTEGER NOT NULL DEFAULT 0,
        authority TEXT NOT NULL UNIQUE,
        crc INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_acl_authorities_crc ON acl_authorities(crc)",
    // Content-addressed access control entries
    r#"
    CREATE TABLE IF NOT EXISTS acl_aces (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        version INTEGER NOT NULL DEFAULT 0,
        permission_id INTEGER NOT NULL REFERENCES acl_permissions(id),
        authority_id INTEGER NOT NULL REFERENCES acl_authorities(id),
        allowed INTEGER NOT NULL,
        ace_type INTEGER NOT NULL,
        context_id INTEGER,
        UNIQUE(permission_id, authority_id, allowed, ace_type)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_acl_aces_authority ON acl_aces(authority_id)",
    r#"
    CREATE TABLE IF NOT EXISTS acl_change_sets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        commit_time_ms INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS acls (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        version INTEGER NOT NULL DEFAULT 0,
        acl_guid TEXT NOT NULL,
        acl_version INTEGER NOT NULL,
        latest INTEGER NOT NULL,
        inherits INTEGER NOT NULL,
        inherits_from INTEGER,
        acl_type INTEGER NOT NULL,
        inherited_acl INTEGER,
        versioned INTEGER NOT NULL,
        requires_version INTEGER NOT NULL DEFAULT 0,
        change_set_id INTEGER REFERENCES acl_change_sets(id),
        UNIQUE(acl_guid, acl_version)
    )
    "#,
    // One latest row per guid
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_acls_latest_guid ON acls(acl_guid) WHERE latest = 1",
    "CREATE INDEX IF NOT EXISTS idx_acls_inherits_from ON acls(inherits_from)",
    r#"
    CREATE TABLE IF NOT EXISTS acl_members (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        version INTEGER NOT NULL DEFAULT 0,
        acl_id INTEGER NOT NULL REFERENCES acls(id),
        ace_id INTEGER NOT NULL REFERENCES acl_aces(id),
        pos INTEGER NOT NULL,
        UNIQUE(acl_id, ace_id, pos)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_acl_members_ace ON acl_members(ace_id)",
    // Tree-structured stores and nodes
    r#"
    CREATE TABLE IF NOT EXISTS stores (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        version INTEGER NOT NULL DEFAULT 0,
        protocol TEXT NOT NULL,
        identifier TEXT NOT NULL,
        root_node_id INTEGER,
        acl_id INTEGER,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE(protocol, identifier)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        version INTEGER NOT NULL DEFAULT 0,
        store_id INTEGER NOT NULL REFERENCES stores(id),
        uuid TEXT NOT NULL,
        parent_id INTEGER REFERENCES nodes(id),
        name TEXT NOT NULL,
        acl_id INTEGER,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE(store_id, uuid)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_nodes_acl ON nodes(acl_id)",
    r#"
    CREATE TABLE IF NOT EXISTS node_aspects (
        node_id INTEGER NOT NULL REFERENCES nodes(id),
        qname_id INTEGER NOT NULL REFERENCES qnames(id),
        PRIMARY KEY(node_id, qname_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_node_aspects_qname ON node_aspects(qname_id)",
    r#"
    CREATE TABLE IF NOT EXISTS node_properties (
        node_id INTEGER NOT NULL REFERENCES nodes(id),
        qname_id INTEGER NOT NULL REFERENCES qnames(id),
        value TEXT NOT NULL,
        PRIMARY KEY(node_id, qname_id)
    )
    "#,
    // Layered (path + version addressed) stores
    r#"
    CREATE TABLE IF NOT EXISTS layered_stores (
        name TEXT PRIMARY KEY,
        version INTEGER NOT NULL DEFAULT 0,
        next_snapshot INTEGER NOT NULL DEFAULT 0,
        acl_id INTEGER,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS layered_nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        version INTEGER NOT NULL DEFAULT 0,
        store_name TEXT NOT NULL REFERENCES layered_stores(name),
        snapshot INTEGER NOT NULL,
        path TEXT NOT NULL,
        parent_path TEXT,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        indirection TEXT,
        indirection_version INTEGER NOT NULL DEFAULT -1,
        acl_id INTEGER,
        UNIQUE(snapshot, path)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_layered_nodes_parent ON layered_nodes(snapshot, parent_path)",
    "CREATE INDEX IF NOT EXISTS idx_layered_nodes_acl ON layered_nodes(acl_id)",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::new(None).await.unwrap();
        db.run_migrations().await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM acls")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_file_backed_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acl.db");
        let db = Database::new(path.to_str()).await.unwrap();

        sqlx::query("INSERT INTO acl_change_sets DEFAULT VALUES")
            .execute(db.pool())
            .await
            .unwrap();
        drop(db);

        let reopened = Database::new(path.to_str()).await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM acl_change_sets")
            .fetch_one(reopened.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }
}
