//! Tree-structured node storage - stores, primary parent/child links and node ACL ids

mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::acl::QName;
use crate::error::AclError;

pub use store::NodeStore;

/// Database id of a node
pub type NodeId = i64;

/// Namespace of the system model qnames
pub const SYSTEM_NAMESPACE: &str = "urn:acld:model:system";

/// Aspect marking a node whose ACL inheritance still has to be pushed down
pub fn pending_fix_acl_aspect() -> QName {
    QName::new(SYSTEM_NAMESPACE, "pendingFixAcl")
}

/// Property holding the ACL the pending fix inherits from
pub fn inherit_from_property() -> QName {
    QName::new(SYSTEM_NAMESPACE, "inheritFrom")
}

/// Property holding the shared ACL the pending fix replaces
pub fn shared_acl_to_replace_property() -> QName {
    QName::new(SYSTEM_NAMESPACE, "sharedAclToReplace")
}

/// A store address, `protocol://identifier`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreRef {
    pub protocol: String,
    pub identifier: String,
}

impl StoreRef {
    pub const PROTOCOL_WORKSPACE: &'static str = "workspace";
    pub const PROTOCOL_ARCHIVE: &'static str = "archive";
    pub const PROTOCOL_LAYERED: &'static str = "avm";

    pub fn new(protocol: &str, identifier: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            identifier: identifier.to_string(),
        }
    }

    pub fn workspace(identifier: &str) -> Self {
        Self::new(Self::PROTOCOL_WORKSPACE, identifier)
    }

    pub fn layered(name: &str) -> Self {
        Self::new(Self::PROTOCOL_LAYERED, name)
    }
}

impl fmt::Display for StoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.identifier)
    }
}

impl FromStr for StoreRef {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("://") {
            Some((protocol, identifier)) if !protocol.is_empty() && !identifier.is_empty() => {
                Ok(Self::new(protocol, identifier))
            }
            _ => Err(AclError::InvalidNodeReference(s.to_string())),
        }
    }
}

/// A node address, `protocol://identifier/id`
///
/// Tree stores use the node uuid as `id`. Layered stores encode
/// `version;path` with the store-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub store: StoreRef,
    pub id: String,
}

impl NodeRef {
    pub fn new(store: StoreRef, id: &str) -> Self {
        Self {
            store,
            id: id.to_string(),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.store, self.id)
    }
}

impl FromStr for NodeRef {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AclError::InvalidNodeReference(s.to_string());
        let (protocol, rest) = s.split_once("://").ok_or_else(invalid)?;
        let (identifier, id) = rest.split_once('/').ok_or_else(invalid)?;
        if protocol.is_empty() || identifier.is_empty() || id.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(StoreRef::new(protocol, identifier), id))
    }
}
