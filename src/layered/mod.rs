//! Layered storage - path and version addressed nodes with transparent layers
//!
//! Paths look like `store:/dir/file`. Version `-1` is the writable head;
//! versions `>= 0` are read-only snapshots. A layered directory exposes the
//! children of its indirection target as virtual nodes until they are
//! materialised by [`LayeredStore::force_copy`].

mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::acl::AclId;
use crate::error::AclError;
use crate::nodes::{NodeRef, StoreRef};

pub use store::LayeredStore;

/// The writable head version
pub const HEAD: i64 = -1;

/// Kind of a layered-store node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayeredKind {
    PlainDirectory,
    PlainFile,
    LayeredDirectory,
    LayeredFile,
}

impl LayeredKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LayeredKind::PlainDirectory => "plain_directory",
            LayeredKind::PlainFile => "plain_file",
            LayeredKind::LayeredDirectory => "layered_directory",
            LayeredKind::LayeredFile => "layered_file",
        }
    }

    pub fn is_directory(self) -> bool {
        matches!(self, LayeredKind::PlainDirectory | LayeredKind::LayeredDirectory)
    }

    pub fn is_layered(self) -> bool {
        matches!(self, LayeredKind::LayeredDirectory | LayeredKind::LayeredFile)
    }
}

impl fmt::Display for LayeredKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayeredKind {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain_directory" => Ok(LayeredKind::PlainDirectory),
            "plain_file" => Ok(LayeredKind::PlainFile),
            "layered_directory" => Ok(LayeredKind::LayeredDirectory),
            "layered_file" => Ok(LayeredKind::LayeredFile),
            other => Err(AclError::InvalidArgument(format!("unknown layered node kind: {other}"))),
        }
    }
}

/// Which children a directory listing returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingMode {
    /// Direct children plus children visible through the indirection
    All,
    /// Only children stored in this layer
    DirectOnly,
}

/// A node as seen at `(version, path)`
///
/// Virtual nodes (`primary == false`) are backed by a node at another path,
/// reached through a layered directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayeredNode {
    /// Row id of the backing node
    pub id: i64,
    pub version: i64,
    pub path: String,
    pub name: String,
    pub kind: LayeredKind,
    pub indirection: Option<String>,
    pub indirection_version: i64,
    pub acl_id: Option<AclId>,
    pub primary: bool,
    pub backing_version: i64,
    pub backing_path: String,
}

impl LayeredNode {
    pub fn is_directory(&self) -> bool {
        self.kind.is_directory()
    }

    pub fn is_layered_directory(&self) -> bool {
        self.kind == LayeredKind::LayeredDirectory
    }

    pub fn is_layered_file(&self) -> bool {
        self.kind == LayeredKind::LayeredFile
    }

    pub fn node_ref(&self) -> Result<NodeRef, AclError> {
        to_node_ref(self.version, &self.path)
    }
}

/// A layered node and the path it points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indirection {
    pub from: i64,
    pub to: String,
    pub to_version: i64,
}

/// Split `store:/a/b` into `("store", "/a/b")`
pub fn split_path(path: &str) -> Result<(&str, &str), AclError> {
    match path.split_once(':') {
        Some((store, rel)) if !store.is_empty() && rel.starts_with('/') => Ok((store, rel)),
        _ => Err(AclError::InvalidNodeReference(path.to_string())),
    }
}

/// Root path of a store
pub fn root_path(store: &str) -> String {
    format!("{store}:/")
}

/// Parent path, `None` for a store root
pub fn parent_path(path: &str) -> Option<String> {
    let (store, rel) = split_path(path).ok()?;
    let trimmed = rel.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some(root_path(store)),
        Some(idx) => Some(format!("{store}:{}", &trimmed[..idx])),
        None => None,
    }
}

/// Last path segment; empty for a store root
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind(|c: char| c == '/' || c == ':') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

pub fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Encode `(version, path)` as a node reference in the store's `avm` space
pub fn to_node_ref(version: i64, path: &str) -> Result<NodeRef, AclError> {
    let (store, rel) = split_path(path)?;
    Ok(NodeRef::new(StoreRef::layered(store), &format!("{version};{rel}")))
}

/// Decode a node reference back into `(version, path)`
pub fn from_node_ref(node: &NodeRef) -> Result<(i64, String), AclError> {
    let invalid = || AclError::InvalidNodeReference(node.to_string());
    let (version, rel) = node.id.split_once(';').ok_or_else(invalid)?;
    let version: i64 = version.parse().map_err(|_| invalid())?;
    if !rel.starts_with('/') {
        return Err(invalid());
    }
    Ok((version, format!("{}:{rel}", node.store.identifier)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(split_path("site:/www/a").unwrap(), ("site", "/www/a"));
        assert!(split_path("site").is_err());
        assert_eq!(parent_path("site:/www/a").as_deref(), Some("site:/www"));
        assert_eq!(parent_path("site:/www").as_deref(), Some("site:/"));
        assert_eq!(parent_path("site:/"), None);
        assert_eq!(base_name("site:/www/a"), "a");
        assert_eq!(base_name("site:/www"), "www");
        assert_eq!(base_name("site:/"), "");
        assert_eq!(join_path("site:/", "www"), "site:/www");
        assert_eq!(join_path("site:/www", "a"), "site:/www/a");
    }

    #[test]
    fn test_node_ref_encoding() {
        let node = to_node_ref(-1, "site:/www/a").unwrap();
        assert_eq!(node.to_string(), "avm://site/-1;/www/a");
        assert_eq!(from_node_ref(&node).unwrap(), (-1, "site:/www/a".to_string()));

        let snap = to_node_ref(3, "site:/").unwrap();
        assert_eq!(from_node_ref(&snap).unwrap(), (3, "site:/".to_string()));

        let bad = NodeRef::new(StoreRef::layered("site"), "www");
        assert!(from_node_ref(&bad).is_err());
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            LayeredKind::PlainDirectory,
            LayeredKind::PlainFile,
            LayeredKind::LayeredDirectory,
            LayeredKind::LayeredFile,
        ] {
            assert_eq!(kind.as_str().parse::<LayeredKind>().unwrap(), kind);
        }
        assert!(LayeredKind::LayeredDirectory.is_directory());
        assert!(!LayeredKind::LayeredFile.is_directory());
    }
}
