//! Shared test utilities for database operations
//!
//! Provides an in-memory pool with the full schema and a transaction
//! context bound to it, so unit tests run against the production schema.

use std::sync::Arc;

use sqlx::SqlitePool;

use super::Database;
use crate::acl::{AclCaches, AclTxn};

/// Create an in-memory test database pool with full schema
pub async fn test_pool() -> SqlitePool {
    let db = Database::new(None)
        .await
        .expect("Failed to create test database");
    db.pool().clone()
}

/// Begin a transaction context on `pool` with fresh caches
pub async fn test_txn(pool: &SqlitePool) -> AclTxn {
    test_txn_with(pool, AclCaches::shared()).await
}

/// Begin a transaction context sharing `caches`
pub async fn test_txn_with(pool: &SqlitePool, caches: Arc<AclCaches>) -> AclTxn {
    AclTxn::begin(pool, caches)
        .await
        .expect("Failed to begin test transaction")
}
