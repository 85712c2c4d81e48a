//! Error types shared by the ACL engine, the backend DAOs and the fixup worker

use thiserror::Error;

use crate::acl::{AclId, AclType};

/// Errors raised by ACL operations
#[derive(Debug, Error)]
pub enum AclError {
    /// Operation not legal for this ACL's kind
    #[error("invalid operation on {kind} ACL: {reason}")]
    InvalidAclKind { kind: AclType, reason: String },

    /// Merge would close an inheritance loop
    #[error("cyclical ACL detected: {target} is already an ancestor of {inherited}")]
    CyclicalAcl { inherited: AclId, target: AclId },

    /// Optimistic version check failed; retry the whole transaction
    #[error("ACL {id} was modified concurrently")]
    ConcurrencyConflict { id: AclId },

    #[error("{operation} is not supported by the {backend} backend")]
    UnsupportedForBackend {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("invalid node reference: {0}")]
    InvalidNodeReference(String),

    #[error("ACL not found: {0}")]
    AclNotFound(AclId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("lock error: {0}")]
    Lock(#[from] crate::locks::LockError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AclError {
    /// Whether the caller should retry the whole transaction
    pub fn is_retryable(&self) -> bool {
        match self {
            AclError::ConcurrencyConflict { .. } => true,
            AclError::Database(sqlx::Error::Database(db)) => {
                // SQLITE_BUSY / SQLITE_LOCKED
                matches!(db.code().as_deref(), Some("5") | Some("6"))
            }
            _ => false,
        }
    }
}
