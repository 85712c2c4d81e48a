//! Access control lists: kinds, entries, patterns and the copy-on-write engine
//!
//! An ACL is a versioned entity holding access control entries at a depth:
//! - depth 0: entries set directly on the ACL
//! - depth N: entries copied down N `inherits_from` hops
//!
//! Kind-specific rules live in one table (see [`AclType::rules`]) consulted by
//! every mutating entry point of [`engine::AclEngine`].

pub mod crud;
pub mod engine;
pub mod intern;
pub mod txn;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use engine::AclEngine;
pub use txn::{AclCaches, AclTxn};

/// Database id of an ACL version row
pub type AclId = i64;

/// Database id of an interned ACE row
pub type AceId = i64;

/// Authority that matches every caller
pub const WILDCARD_AUTHORITY: &str = "*";

/// Permission name used to compute the readers set
pub const READ_PERMISSION: &str = "Read";

/// ACL kinds
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum AclType {
    /// Legacy single-node ACL, never shared
    Old = 0,
    /// Authoritative ACL with local entries
    Defining = 1,
    /// Derived inheritance cache, only written by the engine
    Shared = 2,
    Fixed = 3,
    Global = 4,
    /// Defining ACL of a node overlaying another subtree
    Layered = 5,
}

/// How an inheritance toggle applies to a kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InheritanceToggle {
    /// Goes through copy-on-write and cascades
    Cow,
    /// Flips the flag on the row without versioning
    InPlace,
    /// Accepted and ignored
    NoOp,
    Reject,
}

/// Kind rule table row
#[derive(Debug, Clone, Copy)]
pub struct KindRules {
    pub create_directly: bool,
    pub may_inherit: bool,
    pub may_be_versioned: bool,
    pub default_versioned: bool,
    /// Entries may be set or deleted by callers
    pub client_mutable: bool,
    pub enable_inheritance: InheritanceToggle,
    pub disable_inheritance: InheritanceToggle,
    /// Has its own shared derivative rather than being one
    pub spawns_shared: bool,
}

const RULES: [KindRules; 6] = [
    // Old
    KindRules {
        create_directly: true,
        may_inherit: true,
        may_be_versioned: false,
        default_versioned: false,
        client_mutable: true,
        enable_inheritance: InheritanceToggle::InPlace,
        disable_inheritance: InheritanceToggle::InPlace,
        spawns_shared: false,
    },
    // Defining
    KindRules {
        create_directly: true,
        may_inherit: true,
        may_be_versioned: true,
        default_versioned: false,
        client_mutable: true,
        enable_inheritance: InheritanceToggle::Cow,
        disable_inheritance: InheritanceToggle::Cow,
        spawns_shared: true,
    },
    // Shared
    KindRules {
        create_directly: false,
        may_inherit: true,
        may_be_versioned: true,
        default_versioned: false,
        client_mutable: false,
        enable_inheritance: InheritanceToggle::Reject,
        disable_inheritance: InheritanceToggle::Reject,
        spawns_shared: false,
    },
    // Fixed
    KindRules {
        create_directly: true,
        may_inherit: false,
        may_be_versioned: true,
        default_versioned: false,
        client_mutable: true,
        enable_inheritance: InheritanceToggle::Reject,
        disable_inheritance: InheritanceToggle::NoOp,
        spawns_shared: false,
    },
    // Global
    KindRules {
        create_directly: true,
        may_inherit: false,
        may_be_versioned: true,
        default_versioned: false,
        client_mutable: true,
        enable_inheritance: InheritanceToggle::Reject,
        disable_inheritance: InheritanceToggle::NoOp,
        spawns_shared: false,
    },
    // Layered
    KindRules {
        create_directly: true,
        may_inherit: true,
        may_be_versioned: true,
        default_versioned: true,
        client_mutable: true,
        enable_inheritance: InheritanceToggle::Cow,
        disable_inheritance: InheritanceToggle::Cow,
        spawns_shared: true,
    },
];

impl AclType {
    pub const ALL: [AclType; 6] = [
        AclType::Old,
        AclType::Defining,
        AclType::Shared,
        AclType::Fixed,
        AclType::Global,
        AclType::Layered,
    ];

    /// Rules for this kind
    pub fn rules(self) -> &'static KindRules {
        &RULES[self as usize]
    }

    /// Integer code stored in the `acl_type` column
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Decode the `acl_type` column
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AclType::Old => "OLD",
            AclType::Defining => "DEFINING",
            AclType::Shared => "SHARED",
            AclType::Fixed => "FIXED",
            AclType::Global => "GLOBAL",
            AclType::Layered => "LAYERED",
        }
    }
}

impl fmt::Display for AclType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AclType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown ACL type: {}", s))
    }
}

/// Allow or deny
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessStatus {
    Allowed,
    Denied,
}

impl AccessStatus {
    pub fn is_allowed(self) -> bool {
        self == AccessStatus::Allowed
    }

    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            AccessStatus::Allowed
        } else {
            AccessStatus::Denied
        }
    }
}

/// ACE kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AceType {
    Direct = 0,
    Special = 1,
}

impl AceType {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(AceType::Direct),
            1 => Some(AceType::Special),
            _ => None,
        }
    }
}

/// Namespaced name, interned to a small id by [`intern::Interner`]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QName {
    pub namespace: String,
    pub local_name: String,
}

impl QName {
    pub fn new(namespace: &str, local_name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            local_name: local_name.to_string(),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.namespace, self.local_name)
    }
}

impl FromStr for QName {
    type Err = String;

    /// Parse `{namespace}local`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('{')
            .ok_or_else(|| format!("invalid qname: {}", s))?;
        let (namespace, local) = rest
            .split_once('}')
            .ok_or_else(|| format!("invalid qname: {}", s))?;
        if local.is_empty() {
            return Err(format!("invalid qname: {}", s));
        }
        Ok(QName::new(namespace, local))
    }
}

/// A permission: type qualifier plus name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PermissionReference {
    pub qname: QName,
    pub name: String,
}

impl PermissionReference {
    pub fn new(qname: QName, name: &str) -> Self {
        Self {
            qname,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for PermissionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.qname, self.name)
    }
}

/// One resolved entry of an ACL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlEntry {
    pub authority: String,
    pub permission: PermissionReference,
    pub access_status: AccessStatus,
    pub ace_type: AceType,
    /// Depth at which the entry sits in the owning ACL
    pub position: i32,
}

impl AccessControlEntry {
    /// A direct entry at depth 0
    pub fn new(authority: &str, permission: PermissionReference, access_status: AccessStatus) -> Self {
        Self {
            authority: authority.to_string(),
            permission,
            access_status,
            ace_type: AceType::Direct,
            position: 0,
        }
    }

    fn sort_key(&self) -> (i32, &str, &PermissionReference, AccessStatus) {
        (
            self.position,
            self.authority.as_str(),
            &self.permission,
            self.access_status,
        )
    }
}

/// Which depths a pattern matches, relative to the depth of the ACL being written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionFilter {
    #[default]
    Any,
    /// Entries owned by the ACL itself
    Local,
    /// Entries copied down from an ancestor
    Inherited,
}

impl PositionFilter {
    pub fn matches(self, position: i32, depth: i32) -> bool {
        match self {
            PositionFilter::Any => true,
            PositionFilter::Local => position == depth,
            PositionFilter::Inherited => position > depth,
        }
    }
}

/// Partial entry match used by deletions; `None` fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcePattern {
    pub authority: Option<String>,
    pub permission: Option<PermissionReference>,
    pub access_status: Option<AccessStatus>,
    pub ace_type: Option<AceType>,
    pub position: PositionFilter,
}

impl AcePattern {
    /// Match every entry
    pub fn any() -> Self {
        Self::default()
    }

    pub fn local() -> Self {
        Self {
            position: PositionFilter::Local,
            ..Self::default()
        }
    }

    pub fn inherited() -> Self {
        Self {
            position: PositionFilter::Inherited,
            ..Self::default()
        }
    }

    /// Local entries with the same authority, permission and type as `entry`
    pub fn replacing(entry: &AccessControlEntry) -> Self {
        Self {
            authority: Some(entry.authority.clone()),
            permission: Some(entry.permission.clone()),
            access_status: None,
            ace_type: Some(entry.ace_type),
            position: PositionFilter::Local,
        }
    }

    pub fn with_authority(mut self, authority: &str) -> Self {
        self.authority = Some(authority.to_string());
        self
    }

    pub fn with_permission(mut self, permission: PermissionReference) -> Self {
        self.permission = Some(permission);
        self
    }

    pub fn with_access_status(mut self, status: AccessStatus) -> Self {
        self.access_status = Some(status);
        self
    }

    /// Whether `entry` matches when the owning ACL sits at `depth`
    pub fn matches(&self, entry: &AccessControlEntry, depth: i32) -> bool {
        if let Some(status) = self.access_status {
            if status != entry.access_status {
                return false;
            }
        }
        if let Some(ace_type) = self.ace_type {
            if ace_type != entry.ace_type {
                return false;
            }
        }
        if let Some(ref authority) = self.authority {
            if authority != WILDCARD_AUTHORITY && *authority != entry.authority {
                return false;
            }
        }
        if let Some(ref permission) = self.permission {
            if *permission != entry.permission {
                return false;
            }
        }
        self.position.matches(entry.position, depth)
    }
}

/// Creation parameters for a new ACL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclProperties {
    pub acl_type: AclType,
    /// Defaults to true for kinds that may inherit
    pub inherits: Option<bool>,
    /// Defaults per kind
    pub versioned: Option<bool>,
}

impl AclProperties {
    pub fn new(acl_type: AclType) -> Self {
        Self {
            acl_type,
            inherits: None,
            versioned: None,
        }
    }

    pub fn inherits(mut self, inherits: bool) -> Self {
        self.inherits = Some(inherits);
        self
    }

    pub fn versioned(mut self, versioned: bool) -> Self {
        self.versioned = Some(versioned);
        self
    }
}

/// A stored ACL version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub id: AclId,
    /// Optimistic concurrency version of the row
    pub version: i64,
    pub guid: String,
    pub acl_version: i64,
    pub latest: bool,
    pub inherits: bool,
    pub inherits_from: Option<AclId>,
    pub acl_type: AclType,
    /// Cached shared derivative
    pub inherited_acl: Option<AclId>,
    pub versioned: bool,
    pub requires_version: bool,
    pub change_set_id: Option<i64>,
}

/// How an ACL id was remapped by a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclChange {
    pub before: Option<AclId>,
    pub after: Option<AclId>,
    pub type_before: Option<AclType>,
    pub type_after: Option<AclType>,
}

impl AclChange {
    pub fn new(
        before: Option<AclId>,
        after: Option<AclId>,
        type_before: Option<AclType>,
        type_after: Option<AclType>,
    ) -> Self {
        Self {
            before,
            after,
            type_before,
            type_after,
        }
    }

    /// Change that kept the id
    pub fn unchanged(acl: &Acl) -> Self {
        Self::new(Some(acl.id), Some(acl.id), Some(acl.acl_type), Some(acl.acl_type))
    }

    pub fn is_remap(&self) -> bool {
        self.before != self.after
    }
}

/// How [`AclEngine::get_acl_copy`] derives an ACL for a copied node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclCopyMode {
    /// Shared ACLs follow the new parent
    Inherit,
    /// Reuse the ACL and force a new version on the next write
    Cow,
    /// Defining ACLs re-merge from the new parent
    Redirect,
    /// Independent copy
    Copy,
}

/// An ACL version with its resolved entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlList {
    pub properties: Acl,
    pub entries: Vec<AccessControlEntry>,
}

impl AccessControlList {
    pub fn new(properties: Acl, mut entries: Vec<AccessControlEntry>) -> Self {
        entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Self {
            properties,
            entries,
        }
    }

    /// Entries at exactly `position`
    pub fn entries_at(&self, position: i32) -> impl Iterator<Item = &AccessControlEntry> {
        self.entries.iter().filter(move |e| e.position == position)
    }

    pub fn local_entries(&self) -> impl Iterator<Item = &AccessControlEntry> {
        self.entries_at(0)
    }

    /// Depths at which `authority` has `permission`
    pub fn positions_of(&self, authority: &str, permission: &str) -> Vec<i32> {
        self.entries
            .iter()
            .filter(|e| e.authority == authority && e.permission.name == permission)
            .map(|e| e.position)
            .collect()
    }
}
