//! ACL write engine
//!
//! Every mutation funnels through [`AclEngine::get_writable`], which decides
//! between an in-place edit and a copy-on-write version bump, applies the
//! edit at the right depth and cascades it to every inheriting ACL.
//!
//! An ACL version is edited in place when it is unversioned, or when it was
//! created in the current change set and nothing requires a fresh version.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::{
    crud, intern, AccessControlEntry, AccessControlList, AcePattern, AceId, Acl, AclChange,
    AclCopyMode, AclId, AclProperties, AclTxn, AclType, InheritanceToggle, READ_PERMISSION,
};
use crate::error::AclError;
use crate::BoxFuture;

/// How a writable version is edited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Drop everything below the current depth
    TruncateInherited,
    /// Append the parent's members one level down
    AddInherited,
    /// Replace the inherited portion with the parent's members
    ChangeInherited,
    /// Remove the level directly below the current depth
    RemoveInherited,
    /// Open a level below the current depth and fill it from the parent
    InsertInherited,
    /// Remove excluded entries at the current depth and add new ones
    CopyUpdateAndInherit,
    /// Only make the ACL writable
    CopyOnly,
    /// Populate a fresh ACL with local and inherited entries
    CreateAndInherit,
}

/// What to do with `inherits_from` on the written version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rewire {
    Keep,
    To(AclId),
    Detach,
}

impl Rewire {
    fn apply(self, current: Option<AclId>) -> Option<AclId> {
        match self {
            Rewire::Keep => current,
            Rewire::To(id) => Some(id),
            Rewire::Detach => None,
        }
    }
}

/// Parameters shared by every step of one cascade
struct WriteSpec<'w> {
    mode: WriteMode,
    exclude: &'w [AcePattern],
    to_add: &'w [AceId],
    /// Parent members as `(ace, position)`, shifted by `depth + 1` on insert
    inherited: &'w [(AceId, i32)],
    cascade: bool,
}

impl WriteSpec<'static> {
    const fn bare(mode: WriteMode, cascade: bool) -> Self {
        Self {
            mode,
            exclude: &[],
            to_add: &[],
            inherited: &[],
            cascade,
        }
    }
}

const COPY_ONLY: WriteSpec<'static> = WriteSpec::bare(WriteMode::CopyOnly, false);

fn kind_error(kind: AclType, reason: impl Into<String>) -> AclError {
    AclError::InvalidAclKind {
        kind,
        reason: reason.into(),
    }
}

/// The copy-on-write ACL engine
///
/// Stateless; all transaction and cache state travels in [`AclTxn`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AclEngine;

impl AclEngine {
    pub fn new() -> Self {
        Self
    }

    /// Create a new ACL, optionally inheriting from `inherit_from`'s shared derivative
    pub async fn create_acl(
        &self,
        txn: &mut AclTxn,
        properties: AclProperties,
        entries: &[AccessControlEntry],
        inherit_from: Option<AclId>,
    ) -> Result<Acl, AclError> {
        let kind = properties.acl_type;
        let rules = kind.rules();

        if !rules.create_directly {
            return Err(kind_error(kind, "cannot be created directly"));
        }
        if properties.inherits == Some(true) && !rules.may_inherit {
            return Err(kind_error(kind, "cannot inherit"));
        }
        if inherit_from.is_some() && !rules.may_inherit {
            return Err(kind_error(kind, "cannot inherit"));
        }
        if properties.versioned == Some(true) && !rules.may_be_versioned {
            return Err(kind_error(kind, "cannot be versioned"));
        }
        let inherits = properties.inherits.unwrap_or(rules.may_inherit);
        if inherit_from.is_some() && !inherits {
            return Err(AclError::InvalidArgument(
                "inherit_from given for a non-inheriting ACL".into(),
            ));
        }
        if let Some(entry) = entries.iter().find(|e| e.position != 0) {
            return Err(AclError::InvalidArgument(format!(
                "initial entries must be at position 0, got {}",
                entry.position
            )));
        }

        let change_set = txn.change_set_id().await?;
        let acl = Acl {
            id: 0,
            version: 0,
            guid: uuid::Uuid::new_v4().to_string(),
            acl_version: 1,
            latest: true,
            inherits,
            inherits_from: None,
            acl_type: kind,
            inherited_acl: None,
            versioned: properties.versioned.unwrap_or(rules.default_versioned),
            requires_version: false,
            change_set_id: Some(change_set),
        };
        let id = crud::insert_acl(txn.conn(), &acl).await?;
        txn.invalidate(id);

        // Later entries win over earlier ones for the same authority/permission/type
        let mut local: Vec<&AccessControlEntry> = Vec::new();
        for entry in entries {
            local.retain(|e| !AcePattern::replacing(entry).matches(e, 0));
            local.push(entry);
        }
        let mut to_add = Vec::with_capacity(local.len());
        for entry in local {
            to_add.push(self.ace_for(txn, entry).await?);
        }

        let shared = match inherit_from {
            Some(parent) => self.get_inherited_access_control_list(txn, parent).await?,
            None => None,
        };
        let inherited = match shared {
            Some(s) => crud::members(txn.conn(), s).await?,
            None => Vec::new(),
        };
        let spec = WriteSpec {
            mode: WriteMode::CreateAndInherit,
            exclude: &[],
            to_add: &to_add,
            inherited: &inherited,
            cascade: false,
        };
        let rewire = shared.map(Rewire::To).unwrap_or(Rewire::Keep);
        self.get_writable(txn, id, shared, rewire, &spec, 0, false)
            .await?;

        let created = crud::require_acl(txn.conn(), id).await?;
        debug!(acl_id = id, kind = %kind, inherits_from = ?created.inherits_from, "Created ACL");
        Ok(created)
    }

    /// Create an inheriting, unversioned DEFINING ACL
    pub async fn create_default_acl(&self, txn: &mut AclTxn) -> Result<Acl, AclError> {
        self.create_acl(
            txn,
            AclProperties::new(AclType::Defining)
                .inherits(true)
                .versioned(false),
            &[],
            None,
        )
        .await
    }

    /// Create a LAYERED ACL merged from an indirected ACL
    pub async fn create_layered_acl(
        &self,
        txn: &mut AclTxn,
        indirected: Option<AclId>,
    ) -> Result<AclId, AclError> {
        let acl = self
            .create_acl(
                txn,
                AclProperties::new(AclType::Layered)
                    .inherits(true)
                    .versioned(true),
                &[],
                None,
            )
            .await?;
        let Some(indirected) = indirected else {
            return Ok(acl.id);
        };
        let changes = self
            .merge_inherited_access_control_list(txn, Some(indirected), acl.id)
            .await?;
        Ok(changes.first().and_then(|c| c.after).unwrap_or(acl.id))
    }

    /// The shared derivative children of `id` should point at, created on first use
    pub async fn get_inherited_access_control_list(
        &self,
        txn: &mut AclTxn,
        id: AclId,
    ) -> Result<Option<AclId>, AclError> {
        let acl = crud::require_acl(txn.conn(), id).await?;
        if acl.acl_type == AclType::Old {
            return Ok(None);
        }
        if let Some(inherited) = acl.inherited_acl {
            return Ok(Some(inherited));
        }

        if !acl.acl_type.rules().spawns_shared {
            crud::update_acl(
                txn.conn(),
                &Acl {
                    inherited_acl: Some(id),
                    ..acl
                },
            )
            .await?;
            txn.invalidate(id);
            return Ok(Some(id));
        }

        let change_set = txn.change_set_id().await?;
        let shared = Acl {
            id: 0,
            version: 0,
            guid: uuid::Uuid::new_v4().to_string(),
            acl_version: 1,
            latest: true,
            inherits: true,
            inherits_from: None,
            acl_type: AclType::Shared,
            inherited_acl: None,
            versioned: acl.versioned,
            requires_version: false,
            change_set_id: Some(change_set),
        };
        let shared_id = crud::insert_acl(txn.conn(), &shared).await?;
        txn.invalidate(shared_id);

        let inherited = crud::members(txn.conn(), id).await?;
        let spec = WriteSpec {
            mode: WriteMode::AddInherited,
            exclude: &[],
            to_add: &[],
            inherited: &inherited,
            cascade: true,
        };
        self.get_writable(txn, shared_id, Some(id), Rewire::To(id), &spec, 0, false)
            .await?;

        let acl = crud::require_acl(txn.conn(), id).await?;
        crud::update_acl(
            txn.conn(),
            &Acl {
                inherited_acl: Some(shared_id),
                ..acl
            },
        )
        .await?;
        txn.invalidate(id);

        debug!(acl_id = id, shared_id, "Created shared ACL");
        Ok(Some(shared_id))
    }

    /// Add or replace a local entry
    pub async fn set_access_control_entry(
        &self,
        txn: &mut AclTxn,
        id: AclId,
        entry: &AccessControlEntry,
    ) -> Result<Vec<AclChange>, AclError> {
        let acl = crud::require_acl(txn.conn(), id).await?;
        check_client_mutable(&acl)?;
        if entry.position != 0 {
            return Err(AclError::InvalidArgument(format!(
                "entries can only be set at position 0, got {}",
                entry.position
            )));
        }

        let ace = self.ace_for(txn, entry).await?;
        let exclude = [AcePattern::replacing(entry)];
        let to_add = [ace];
        let spec = WriteSpec {
            mode: WriteMode::CopyUpdateAndInherit,
            exclude: &exclude,
            to_add: &to_add,
            inherited: &[],
            cascade: true,
        };
        self.get_writable(txn, id, None, Rewire::Keep, &spec, 0, false)
            .await
    }

    /// Remove entries matching `pattern`
    pub async fn delete_access_control_entries(
        &self,
        txn: &mut AclTxn,
        id: AclId,
        pattern: &AcePattern,
    ) -> Result<Vec<AclChange>, AclError> {
        let acl = crud::require_acl(txn.conn(), id).await?;
        check_client_mutable(&acl)?;

        let exclude = [pattern.clone()];
        let spec = WriteSpec {
            mode: WriteMode::CopyUpdateAndInherit,
            exclude: &exclude,
            to_add: &[],
            inherited: &[],
            cascade: true,
        };
        self.get_writable(txn, id, None, Rewire::Keep, &spec, 0, false)
            .await
    }

    pub async fn delete_local_access_control_entries(
        &self,
        txn: &mut AclTxn,
        id: AclId,
    ) -> Result<Vec<AclChange>, AclError> {
        self.delete_access_control_entries(txn, id, &AcePattern::local())
            .await
    }

    pub async fn delete_inherited_access_control_entries(
        &self,
        txn: &mut AclTxn,
        id: AclId,
    ) -> Result<Vec<AclChange>, AclError> {
        self.delete_access_control_entries(txn, id, &AcePattern::inherited())
            .await
    }

    /// Drop every entry for `authority` everywhere, without versioning
    pub async fn delete_access_control_entries_for_authority(
        &self,
        txn: &mut AclTxn,
        authority: &str,
    ) -> Result<Vec<AclChange>, AclError> {
        let Some(authority_id) = intern::get_authority(txn, authority).await? else {
            return Ok(Vec::new());
        };

        let affected = crud::acls_with_authority(txn.conn(), authority_id).await?;
        let removed = crud::purge_authority(txn.conn(), authority_id).await?;
        txn.unstage_authority(authority);
        txn.caches().forget_authority(authority);

        let mut changes = Vec::with_capacity(affected.len());
        for id in affected {
            txn.invalidate(id);
            let acl = crud::require_acl(txn.conn(), id).await?;
            changes.push(AclChange::unchanged(&acl));
        }
        debug!(authority, members = removed, acls = changes.len(), "Deleted authority entries");
        Ok(changes)
    }

    /// Replace the inherited portion of `target` with the shared derivative of `inherited`
    ///
    /// With `inherited = None`, `target` is re-synchronised with the latest
    /// version of the ACL it currently inherits from.
    pub async fn merge_inherited_access_control_list(
        &self,
        txn: &mut AclTxn,
        inherited: Option<AclId>,
        target: AclId,
    ) -> Result<Vec<AclChange>, AclError> {
        let target_acl = crud::require_acl(txn.conn(), target).await?;

        let inherited = match inherited {
            Some(id) => id,
            None => match target_acl.inherits_from {
                Some(from) => self.latest_version(txn, from).await?,
                None => return Ok(Vec::new()),
            },
        };

        // Walk the ancestry of `inherited` before writing anything
        let mut cursor = Some(inherited);
        let mut seen = HashSet::new();
        while let Some(id) = cursor {
            if id == target {
                return Err(AclError::CyclicalAcl { inherited, target });
            }
            if !seen.insert(id) {
                break;
            }
            cursor = crud::require_acl(txn.conn(), id).await?.inherits_from;
        }

        if !target_acl.acl_type.rules().spawns_shared {
            return Err(kind_error(
                target_acl.acl_type,
                "only DEFINING and LAYERED ACLs merge inherited entries",
            ));
        }
        if !target_acl.inherits {
            return Ok(Vec::new());
        }

        let inherited_acl = crud::require_acl(txn.conn(), inherited).await?;
        let actual = if inherited_acl.acl_type.rules().spawns_shared {
            self.get_inherited_access_control_list(txn, inherited)
                .await?
                .unwrap_or(inherited)
        } else {
            inherited
        };

        let parent_members = crud::members(txn.conn(), actual).await?;
        let spec = WriteSpec {
            mode: WriteMode::ChangeInherited,
            exclude: &[],
            to_add: &[],
            inherited: &parent_members,
            cascade: true,
        };
        self.get_writable(txn, target, Some(actual), Rewire::To(actual), &spec, 0, false)
            .await
    }

    /// Turn inheritance on, merging from `parent` or the current `inherits_from`
    pub async fn enable_inheritance(
        &self,
        txn: &mut AclTxn,
        id: AclId,
        parent: Option<AclId>,
    ) -> Result<Vec<AclChange>, AclError> {
        let acl = crud::require_acl(txn.conn(), id).await?;

        match acl.acl_type.rules().enable_inheritance {
            InheritanceToggle::Reject => Err(kind_error(
                acl.acl_type,
                "inheritance cannot be enabled",
            )),
            InheritanceToggle::NoOp => Ok(vec![AclChange::unchanged(&acl)]),
            InheritanceToggle::InPlace => {
                let updated = crud::update_acl(
                    txn.conn(),
                    &Acl {
                        inherits: true,
                        ..acl
                    },
                )
                .await?;
                txn.invalidate(id);
                Ok(vec![AclChange::unchanged(&updated)])
            }
            InheritanceToggle::Cow => {
                check_latest(&acl)?;
                let mut changes = self
                    .get_writable(txn, id, None, Rewire::Keep, &COPY_ONLY, 0, false)
                    .await?;
                let after = changes[0].after.unwrap_or(id);

                let writable = crud::require_acl(txn.conn(), after).await?;
                crud::update_acl(
                    txn.conn(),
                    &Acl {
                        inherits: true,
                        ..writable
                    },
                )
                .await?;
                txn.invalidate(after);

                changes.extend(
                    self.merge_inherited_access_control_list(txn, parent, after)
                        .await?,
                );
                Ok(changes)
            }
        }
    }

    /// Turn inheritance off
    ///
    /// With `copy_inherited`, entries inherited so far are re-created as local entries.
    pub async fn disable_inheritance(
        &self,
        txn: &mut AclTxn,
        id: AclId,
        copy_inherited: bool,
    ) -> Result<Vec<AclChange>, AclError> {
        let acl = crud::require_acl(txn.conn(), id).await?;

        match acl.acl_type.rules().disable_inheritance {
            InheritanceToggle::Reject => Err(kind_error(
                acl.acl_type,
                "inheritance cannot be disabled",
            )),
            InheritanceToggle::NoOp => Ok(vec![AclChange::unchanged(&acl)]),
            InheritanceToggle::InPlace => {
                let updated = crud::update_acl(
                    txn.conn(),
                    &Acl {
                        inherits: false,
                        ..acl
                    },
                )
                .await?;
                txn.invalidate(id);
                Ok(vec![AclChange::unchanged(&updated)])
            }
            InheritanceToggle::Cow => {
                if !acl.inherits {
                    return Ok(Vec::new());
                }
                check_latest(&acl)?;

                let frozen: Vec<AccessControlEntry> = match (copy_inherited, acl.inherits_from) {
                    (true, Some(from)) => crud::member_entries(txn.conn(), from)
                        .await?
                        .into_iter()
                        .map(|m| AccessControlEntry {
                            position: 0,
                            ..m.entry
                        })
                        .collect(),
                    _ => Vec::new(),
                };

                let mut changes = self
                    .get_writable(txn, id, None, Rewire::Keep, &COPY_ONLY, 0, false)
                    .await?;
                let after = changes[0].after.unwrap_or(id);

                let writable = crud::require_acl(txn.conn(), after).await?;
                crud::update_acl(
                    txn.conn(),
                    &Acl {
                        inherits: false,
                        ..writable
                    },
                )
                .await?;
                txn.invalidate(after);

                let truncate = WriteSpec::bare(WriteMode::TruncateInherited, true);
                changes.extend(
                    self.get_writable(txn, after, None, Rewire::Keep, &truncate, 0, false)
                        .await?,
                );

                for entry in &frozen {
                    changes.extend(self.set_access_control_entry(txn, after, entry).await?);
                }
                Ok(changes)
            }
        }
    }

    /// Delete a DEFINING or LAYERED ACL, rewiring everything that inherited from it
    pub async fn delete_access_control_list(
        &self,
        txn: &mut AclTxn,
        id: AclId,
    ) -> Result<Vec<AclChange>, AclError> {
        let acl = crud::require_acl(txn.conn(), id).await?;
        check_latest(&acl)?;
        if acl.acl_type == AclType::Shared {
            return Err(kind_error(
                acl.acl_type,
                "shared ACLs are removed with their defining ACL",
            ));
        }

        let rewire = match acl.inherits_from {
            Some(from) => Rewire::To(from),
            None => Rewire::Detach,
        };
        let remove = WriteSpec::bare(WriteMode::RemoveInherited, true);
        let mut changes = Vec::new();

        match acl.inherited_acl {
            Some(shared) if acl.acl_type.rules().spawns_shared && shared != id => {
                // Strip this level from the derivative and everything below it
                let stripped = self
                    .get_writable(txn, shared, None, Rewire::Keep, &remove, 0, false)
                    .await?;
                let unused = stripped.first().and_then(|c| c.after).unwrap_or(shared);
                changes.extend(stripped);

                for inheritor in crud::acls_inheriting_from(txn.conn(), unused).await? {
                    changes.extend(
                        self.get_writable(txn, inheritor, None, rewire, &remove, 0, false)
                            .await?,
                    );
                }

                let derivative = crud::require_acl(txn.conn(), unused).await?;
                self.retire_or_delete(txn, derivative).await?;
                changes.push(AclChange::new(
                    Some(unused),
                    None,
                    Some(AclType::Shared),
                    None,
                ));
            }
            _ => {
                for inheritor in crud::acls_inheriting_from(txn.conn(), id).await? {
                    changes.extend(
                        self.get_writable(txn, inheritor, None, rewire, &remove, 0, false)
                            .await?,
                    );
                }
            }
        }

        let acl = crud::require_acl(txn.conn(), id).await?;
        let kind = acl.acl_type;
        self.retire_or_delete(txn, acl).await?;
        changes.push(AclChange::new(Some(id), None, Some(kind), None));

        debug!(acl_id = id, changes = changes.len(), "Deleted ACL");
        Ok(changes)
    }

    /// Derive the ACL for a copied node
    pub async fn get_acl_copy(
        &self,
        txn: &mut AclTxn,
        to_copy: AclId,
        to_inherit_from: Option<AclId>,
        mode: AclCopyMode,
    ) -> Result<Option<AclId>, AclError> {
        let acl = crud::require_acl(txn.conn(), to_copy).await?;

        match mode {
            AclCopyMode::Inherit => match acl.acl_type {
                AclType::Shared => match to_inherit_from {
                    Some(parent) => self.get_inherited_access_control_list(txn, parent).await,
                    None => Ok(None),
                },
                _ => Ok(Some(to_copy)),
            },
            AclCopyMode::Cow => {
                let inherited = acl.inherited_acl;
                self.mark_requires_version(txn, acl).await?;
                if let Some(inherited) = inherited.filter(|id| *id != to_copy) {
                    if let Some(shared) = crud::get_acl(txn.conn(), inherited).await? {
                        self.mark_requires_version(txn, shared).await?;
                    }
                }
                Ok(Some(to_copy))
            }
            AclCopyMode::Redirect => match acl.acl_type {
                AclType::Shared => match to_inherit_from {
                    Some(parent) => self.get_inherited_access_control_list(txn, parent).await,
                    None => Ok(None),
                },
                AclType::Defining if acl.inherits => match to_inherit_from {
                    Some(parent) => {
                        let changes = self
                            .merge_inherited_access_control_list(txn, Some(parent), to_copy)
                            .await?;
                        Ok(Some(changes.first().and_then(|c| c.after).unwrap_or(to_copy)))
                    }
                    None => Ok(Some(to_copy)),
                },
                _ => Ok(Some(to_copy)),
            },
            AclCopyMode::Copy => match acl.acl_type {
                AclType::Shared => match to_inherit_from {
                    Some(parent) => self.get_inherited_access_control_list(txn, parent).await,
                    None => Ok(None),
                },
                AclType::Defining => {
                    let local: Vec<AccessControlEntry> = crud::member_entries(txn.conn(), to_copy)
                        .await?
                        .into_iter()
                        .filter(|m| m.entry.position == 0)
                        .map(|m| m.entry)
                        .collect();
                    let copy = self
                        .create_acl(
                            txn,
                            AclProperties::new(AclType::Defining)
                                .inherits(acl.inherits)
                                .versioned(acl.versioned),
                            &local,
                            None,
                        )
                        .await?;
                    match to_inherit_from {
                        Some(parent) if acl.inherits => {
                            let changes = self
                                .merge_inherited_access_control_list(txn, Some(parent), copy.id)
                                .await?;
                            Ok(Some(changes.first().and_then(|c| c.after).unwrap_or(copy.id)))
                        }
                        _ => Ok(Some(copy.id)),
                    }
                }
                _ => Ok(Some(to_copy)),
            },
        }
    }

    /// Re-derive a shared ACL from its defining ACL
    pub async fn fix_shared_acl(
        &self,
        txn: &mut AclTxn,
        shared: AclId,
        defining: AclId,
    ) -> Result<Vec<AclChange>, AclError> {
        let parent_members = crud::members(txn.conn(), defining).await?;
        let spec = WriteSpec {
            mode: WriteMode::ChangeInherited,
            exclude: &[],
            to_add: &[],
            inherited: &parent_members,
            cascade: true,
        };
        self.get_writable(txn, shared, Some(defining), Rewire::To(defining), &spec, 0, false)
            .await
    }

    /// Rename an authority everywhere it is referenced
    pub async fn rename_authority(
        &self,
        txn: &mut AclTxn,
        before: &str,
        after: &str,
    ) -> Result<bool, AclError> {
        intern::rename_authority(txn, before, after).await
    }

    /// ACL row by id
    pub async fn get_acl_properties(&self, txn: &mut AclTxn, id: AclId) -> Result<Acl, AclError> {
        crud::require_acl(txn.conn(), id).await
    }

    /// ACL row by id, or `None`
    pub async fn find_acl(&self, txn: &mut AclTxn, id: AclId) -> Result<Option<Acl>, AclError> {
        crud::get_acl(txn.conn(), id).await
    }

    /// Id of the latest version of the ACL `id` belongs to
    pub async fn latest_version(&self, txn: &mut AclTxn, id: AclId) -> Result<AclId, AclError> {
        let acl = crud::require_acl(txn.conn(), id).await?;
        if acl.latest {
            return Ok(id);
        }
        Ok(crud::latest_acl_by_guid(txn.conn(), &acl.guid)
            .await?
            .map(|a| a.id)
            .unwrap_or(id))
    }

    /// Every version of the ACL `id` belongs to, oldest first
    pub async fn versions(&self, txn: &mut AclTxn, id: AclId) -> Result<Vec<Acl>, AclError> {
        let acl = crud::require_acl(txn.conn(), id).await?;
        crud::acl_versions(txn.conn(), &acl.guid).await
    }

    pub async fn acls_that_inherit_from(
        &self,
        txn: &mut AclTxn,
        id: AclId,
    ) -> Result<Vec<AclId>, AclError> {
        crud::acls_inheriting_from(txn.conn(), id).await
    }

    /// Resolved ACL, served from the content cache when possible
    pub async fn get_access_control_list(
        &self,
        txn: &mut AclTxn,
        id: AclId,
    ) -> Result<Arc<AccessControlList>, AclError> {
        let cacheable = !txn.touched(id);
        if cacheable {
            if let Some(cached) = txn.caches().acl(id) {
                return Ok(cached);
            }
        }

        let properties = crud::require_acl(txn.conn(), id).await?;
        let entries = crud::member_entries(txn.conn(), id)
            .await?
            .into_iter()
            .map(|m| m.entry)
            .collect();
        let list = Arc::new(AccessControlList::new(properties, entries));
        if cacheable {
            txn.caches().put_acl(id, list.clone());
        }
        Ok(list)
    }

    /// Authorities allowed to read through this ACL at any depth
    pub async fn get_readers(
        &self,
        txn: &mut AclTxn,
        id: AclId,
    ) -> Result<Arc<BTreeSet<String>>, AclError> {
        let cacheable = !txn.touched(id);
        if cacheable {
            if let Some(cached) = txn.caches().readers(id) {
                return Ok(cached);
            }
        }

        let acl = self.get_access_control_list(txn, id).await?;
        let readers: BTreeSet<String> = acl
            .entries
            .iter()
            .filter(|e| e.permission.name == READ_PERMISSION && e.access_status.is_allowed())
            .map(|e| e.authority.clone())
            .collect();
        let readers = Arc::new(readers);
        if cacheable {
            txn.caches().put_readers(id, readers.clone());
        }
        Ok(readers)
    }

    async fn ace_for(&self, txn: &mut AclTxn, entry: &AccessControlEntry) -> Result<AceId, AclError> {
        let permission = intern::get_or_create_permission(txn, &entry.permission).await?;
        let authority = intern::get_or_create_authority(txn, &entry.authority).await?;
        crud::get_or_create_ace(
            txn.conn(),
            permission,
            authority,
            entry.access_status.is_allowed(),
            entry.ace_type,
        )
        .await
    }

    async fn mark_requires_version(&self, txn: &mut AclTxn, acl: Acl) -> Result<(), AclError> {
        let id = acl.id;
        crud::update_acl(
            txn.conn(),
            &Acl {
                requires_version: true,
                ..acl
            },
        )
        .await?;
        txn.invalidate(id);
        Ok(())
    }

    /// Versioned ACLs stay readable as history; others go away
    async fn retire_or_delete(&self, txn: &mut AclTxn, acl: Acl) -> Result<(), AclError> {
        let id = acl.id;
        if acl.versioned {
            crud::update_acl(
                txn.conn(),
                &Acl {
                    latest: false,
                    ..acl
                },
            )
            .await?;
        } else {
            crud::delete_acl(txn.conn(), &acl).await?;
        }
        txn.invalidate(id);
        Ok(())
    }

    /// Make `id` writable, apply `spec` at `depth` and cascade to inheritors
    #[allow(clippy::too_many_arguments)]
    fn get_writable<'a>(
        &'a self,
        txn: &'a mut AclTxn,
        id: AclId,
        parent: Option<AclId>,
        rewire: Rewire,
        spec: &'a WriteSpec<'a>,
        depth: i32,
        force_version: bool,
    ) -> BoxFuture<'a, Result<Vec<AclChange>, AclError>> {
        Box::pin(async move {
            let current = self
                .write_one(txn, id, parent, rewire, spec, depth, force_version)
                .await?;
            let mut changes = vec![current];

            if spec.cascade {
                let after = current.after.unwrap_or(id);
                let cascade_version = force_version || current.is_remap();
                for next in crud::acls_inheriting_from(txn.conn(), id).await? {
                    changes.extend(
                        self.get_writable(
                            txn,
                            next,
                            Some(after),
                            Rewire::To(after),
                            spec,
                            depth + 1,
                            cascade_version,
                        )
                        .await?,
                    );
                }
            }
            Ok(changes)
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_one(
        &self,
        txn: &mut AclTxn,
        id: AclId,
        parent: Option<AclId>,
        rewire: Rewire,
        spec: &WriteSpec<'_>,
        depth: i32,
        force_version: bool,
    ) -> Result<AclChange, AclError> {
        let acl = crud::require_acl(txn.conn(), id).await?;
        if !acl.latest {
            txn.invalidate(id);
            return Ok(AclChange::unchanged(&acl));
        }

        let change_set = txn.change_set_id().await?;
        let in_place = !acl.versioned
            || (acl.change_set_id == Some(change_set) && !force_version && !acl.requires_version);

        if in_place {
            self.apply(txn, id, spec, depth).await?;
            let updated = crud::update_acl(
                txn.conn(),
                &Acl {
                    inherits_from: rewire.apply(acl.inherits_from),
                    ..acl
                },
            )
            .await?;
            txn.invalidate(id);
            return Ok(AclChange::unchanged(&updated));
        }

        // Retire first: one latest row per guid
        let kind = acl.acl_type;
        crud::update_acl(
            txn.conn(),
            &Acl {
                latest: false,
                requires_version: false,
                ..acl.clone()
            },
        )
        .await?;

        let next = Acl {
            id: 0,
            version: 0,
            guid: acl.guid.clone(),
            acl_version: acl.acl_version + 1,
            latest: true,
            inherits: acl.inherits,
            inherits_from: rewire.apply(acl.inherits_from),
            acl_type: kind,
            inherited_acl: None,
            versioned: true,
            requires_version: false,
            change_set_id: Some(change_set),
        };
        let new_id = crud::insert_acl(txn.conn(), &next).await?;
        crud::copy_members(txn.conn(), id, new_id).await?;
        self.apply(txn, new_id, spec, depth).await?;
        txn.invalidate(id);
        txn.invalidate(new_id);

        if kind == AclType::Shared {
            if let Some(parent) = parent {
                let parent_changes = self
                    .get_writable(txn, parent, None, Rewire::Keep, &COPY_ONLY, 0, false)
                    .await?;
                let writable_parent = parent_changes[0].after.unwrap_or(parent);
                let parent_acl = crud::require_acl(txn.conn(), writable_parent).await?;
                crud::update_acl(
                    txn.conn(),
                    &Acl {
                        inherited_acl: Some(new_id),
                        ..parent_acl
                    },
                )
                .await?;
                txn.invalidate(writable_parent);
            }
        }

        debug!(
            acl_id = id,
            new_id,
            acl_version = next.acl_version,
            depth,
            "Copied ACL on write"
        );
        Ok(AclChange::new(Some(id), Some(new_id), Some(kind), Some(kind)))
    }

    async fn apply(
        &self,
        txn: &mut AclTxn,
        acl_id: AclId,
        spec: &WriteSpec<'_>,
        depth: i32,
    ) -> Result<(), AclError> {
        let conn = txn.conn();
        match spec.mode {
            WriteMode::CopyOnly => {}
            WriteMode::TruncateInherited => {
                crud::truncate_below(conn, acl_id, depth).await?;
            }
            WriteMode::AddInherited => {
                add_inherited(conn, acl_id, spec.inherited, depth).await?;
            }
            WriteMode::ChangeInherited => {
                crud::truncate_below(conn, acl_id, depth).await?;
                add_inherited(conn, acl_id, spec.inherited, depth).await?;
            }
            WriteMode::RemoveInherited => {
                crud::remove_level(conn, acl_id, depth + 1).await?;
            }
            WriteMode::InsertInherited => {
                crud::open_level(conn, acl_id, depth).await?;
                add_inherited(conn, acl_id, spec.inherited, depth).await?;
            }
            WriteMode::CopyUpdateAndInherit => {
                if !spec.exclude.is_empty() {
                    for member in crud::member_entries(conn, acl_id).await? {
                        if spec
                            .exclude
                            .iter()
                            .any(|pattern| pattern.matches(&member.entry, depth))
                        {
                            crud::delete_member(conn, member.member_id).await?;
                        }
                    }
                }
                for ace in spec.to_add {
                    crud::add_member(conn, acl_id, *ace, depth).await?;
                }
            }
            WriteMode::CreateAndInherit => {
                for ace in spec.to_add {
                    crud::add_member(conn, acl_id, *ace, depth).await?;
                }
                add_inherited(conn, acl_id, spec.inherited, depth).await?;
            }
        }
        Ok(())
    }
}

async fn add_inherited(
    conn: &mut sqlx::SqliteConnection,
    acl_id: AclId,
    inherited: &[(AceId, i32)],
    depth: i32,
) -> Result<(), AclError> {
    for (ace, position) in inherited {
        crud::add_member(conn, acl_id, *ace, position + depth + 1).await?;
    }
    Ok(())
}

fn check_client_mutable(acl: &Acl) -> Result<(), AclError> {
    if !acl.acl_type.rules().client_mutable {
        return Err(kind_error(acl.acl_type, "entries cannot be changed directly"));
    }
    check_latest(acl)
}

/// Only the latest version of an ACL accepts writes
fn check_latest(acl: &Acl) -> Result<(), AclError> {
    if !acl.latest {
        return Err(AclError::ConcurrencyConflict { id: acl.id });
    }
    Ok(())
}

/// Map of `before -> after` for remapped ids
pub fn change_map(changes: &[AclChange]) -> HashMap<AclId, Option<AclId>> {
    changes
        .iter()
        .filter(|c| c.is_remap())
        .filter_map(|c| c.before.map(|before| (before, c.after)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AccessStatus, PermissionReference, QName};
    use crate::db::test_utils::{test_pool, test_txn, test_txn_with};
    use crate::acl::AclCaches;

    fn perm(name: &str) -> PermissionReference {
        PermissionReference::new(QName::new("urn:acld:test", "base"), name)
    }

    fn allow(authority: &str, permission: &str) -> AccessControlEntry {
        AccessControlEntry::new(authority, perm(permission), AccessStatus::Allowed)
    }

    fn deny(authority: &str, permission: &str) -> AccessControlEntry {
        AccessControlEntry::new(authority, perm(permission), AccessStatus::Denied)
    }

    fn defining(versioned: bool) -> AclProperties {
        AclProperties::new(AclType::Defining).versioned(versioned)
    }

    #[tokio::test]
    async fn test_create_validates_kind_rules() {
        let pool = test_pool().await;
        let engine = AclEngine::new();
        let mut txn = test_txn(&pool).await;

        let err = engine
            .create_acl(&mut txn, AclProperties::new(AclType::Shared), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, AclError::InvalidAclKind { kind: AclType::Shared, .. }));

        let err = engine
            .create_acl(&mut txn, AclProperties::new(AclType::Fixed).inherits(true), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, AclError::InvalidAclKind { kind: AclType::Fixed, .. }));

        let err = engine
            .create_acl(&mut txn, AclProperties::new(AclType::Old).versioned(true), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, AclError::InvalidAclKind { kind: AclType::Old, .. }));

        let mut deep = allow("alice", "Read");
        deep.position = 1;
        let err = engine
            .create_acl(&mut txn, defining(false), &[deep], None)
            .await
            .unwrap_err();
        assert!(matches!(err, AclError::InvalidArgument(_)));

        let fixed = engine
            .create_acl(&mut txn, AclProperties::new(AclType::Fixed), &[], None)
            .await
            .unwrap();
        assert!(!fixed.inherits);
        let layered = engine
            .create_acl(&mut txn, AclProperties::new(AclType::Layered), &[], None)
            .await
            .unwrap();
        assert!(layered.versioned);
    }

    #[tokio::test]
    async fn test_create_with_entries_and_parent() {
        let pool = test_pool().await;
        let engine = AclEngine::new();
        let mut txn = test_txn(&pool).await;

        let parent = engine
            .create_acl(&mut txn, defining(false), &[allow("root", "Read")], None)
            .await
            .unwrap();
        let child = engine
            .create_acl(
                &mut txn,
                defining(false),
                &[allow("alice", "Read"), deny("alice", "Read")],
                Some(parent.id),
            )
            .await
            .unwrap();

        let shared = engine
            .get_inherited_access_control_list(&mut txn, parent.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(child.inherits_from, Some(shared));

        let list = engine.get_access_control_list(&mut txn, child.id).await.unwrap();
        let local: Vec<_> = list.local_entries().collect();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].access_status, AccessStatus::Denied);
        assert_eq!(list.positions_of("root", "Read"), vec![2]);
    }

    #[tokio::test]
    async fn test_cow_idempotent_within_change_set() {
        let pool = test_pool().await;
        let engine = AclEngine::new();

        let mut txn = test_txn(&pool).await;
        let acl = engine.create_acl(&mut txn, defining(true), &[], None).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = test_txn(&pool).await;
        let entry = allow("alice", "Read");
        let first = engine
            .set_access_control_entry(&mut txn, acl.id, &entry)
            .await
            .unwrap();
        let after = first[0].after.unwrap();
        assert_ne!(after, acl.id);

        let second = engine
            .set_access_control_entry(&mut txn, after, &entry)
            .await
            .unwrap();
        assert_eq!(second[0].before, Some(after));
        assert_eq!(second[0].after, Some(after));

        let versions = engine.versions(&mut txn, after).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].acl_version, 2);

        let list = engine.get_access_control_list(&mut txn, after).await.unwrap();
        assert_eq!(list.entries.len(), 1);
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_versions_monotonic_with_single_latest() {
        let pool = test_pool().await;
        let engine = AclEngine::new();

        let mut txn = test_txn(&pool).await;
        let mut id = engine.create_acl(&mut txn, defining(true), &[], None).await.unwrap().id;
        txn.commit().await.unwrap();

        for who in ["a", "b", "c"] {
            let mut txn = test_txn(&pool).await;
            let changes = engine
                .set_access_control_entry(&mut txn, id, &allow(who, "Read"))
                .await
                .unwrap();
            id = changes[0].after.unwrap();
            txn.commit().await.unwrap();
        }

        let mut txn = test_txn(&pool).await;
        let versions = engine.versions(&mut txn, id).await.unwrap();
        let numbers: Vec<i64> = versions.iter().map(|v| v.acl_version).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(versions.iter().filter(|v| v.latest).count(), 1);
        assert!(versions[3].latest);

        // Old versions are read-only history
        let err = engine
            .set_access_control_entry(&mut txn, versions[0].id, &allow("d", "Read"))
            .await
            .unwrap_err();
        assert!(matches!(err, AclError::ConcurrencyConflict { .. }));
        let oldest = engine.get_access_control_list(&mut txn, versions[0].id).await.unwrap();
        assert!(oldest.entries.is_empty());
    }

    #[tokio::test]
    async fn test_shared_acl_reused() {
        let pool = test_pool().await;
        let engine = AclEngine::new();
        let mut txn = test_txn(&pool).await;

        let acl = engine.create_acl(&mut txn, defining(false), &[], None).await.unwrap();
        let first = engine
            .get_inherited_access_control_list(&mut txn, acl.id)
            .await
            .unwrap();
        let second = engine
            .get_inherited_access_control_list(&mut txn, acl.id)
            .await
            .unwrap();
        assert_eq!(first, second);

        let shared = engine.get_acl_properties(&mut txn, first.unwrap()).await.unwrap();
        assert_eq!(shared.acl_type, AclType::Shared);
        assert_eq!(shared.inherits_from, Some(acl.id));

        let fixed = engine
            .create_acl(&mut txn, AclProperties::new(AclType::Fixed), &[], None)
            .await
            .unwrap();
        assert_eq!(
            engine.get_inherited_access_control_list(&mut txn, fixed.id).await.unwrap(),
            Some(fixed.id)
        );
        let old = engine
            .create_acl(&mut txn, AclProperties::new(AclType::Old), &[], None)
            .await
            .unwrap();
        assert_eq!(
            engine.get_inherited_access_control_list(&mut txn, old.id).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_cycle_rejected_without_changes() {
        let pool = test_pool().await;
        let engine = AclEngine::new();
        let mut txn = test_txn(&pool).await;

        let c = engine
            .create_acl(&mut txn, defining(false), &[allow("c", "Read")], None)
            .await
            .unwrap();
        let b = engine.create_acl(&mut txn, defining(false), &[], Some(c.id)).await.unwrap();
        let a = engine.create_acl(&mut txn, defining(false), &[], Some(b.id)).await.unwrap();

        let mut before = Vec::new();
        for id in [a.id, b.id, c.id] {
            before.push(engine.get_access_control_list(&mut txn, id).await.unwrap());
        }

        let err = engine
            .merge_inherited_access_control_list(&mut txn, Some(a.id), c.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AclError::CyclicalAcl { inherited, target } if inherited == a.id && target == c.id));

        for (id, expected) in [a.id, b.id, c.id].into_iter().zip(before) {
            let now = engine.get_access_control_list(&mut txn, id).await.unwrap();
            assert_eq!(*now, *expected);
        }
    }

    #[tokio::test]
    async fn test_propagation_depths() {
        for versioned in [false, true] {
            let pool = test_pool().await;
            let engine = AclEngine::new();

            let mut txn = test_txn(&pool).await;
            let root = engine.create_acl(&mut txn, defining(versioned), &[], None).await.unwrap();
            let child = engine
                .create_acl(&mut txn, defining(versioned), &[], Some(root.id))
                .await
                .unwrap();
            let grandchild = engine
                .create_acl(&mut txn, defining(versioned), &[], Some(child.id))
                .await
                .unwrap();
            txn.commit().await.unwrap();

            let mut txn = test_txn(&pool).await;
            engine
                .set_access_control_entry(&mut txn, root.id, &allow("alice", "Read"))
                .await
                .unwrap();

            let root_now = engine.latest_version(&mut txn, root.id).await.unwrap();
            let child_now = engine.latest_version(&mut txn, child.id).await.unwrap();
            let grandchild_now = engine.latest_version(&mut txn, grandchild.id).await.unwrap();
            let root_shared = engine
                .get_inherited_access_control_list(&mut txn, root_now)
                .await
                .unwrap()
                .unwrap();
            let child_shared = engine
                .get_inherited_access_control_list(&mut txn, child_now)
                .await
                .unwrap()
                .unwrap();

            let depth = |list: &AccessControlList| list.positions_of("alice", "Read");
            let list = engine.get_access_control_list(&mut txn, root_now).await.unwrap();
            assert_eq!(depth(&list), vec![0]);
            let list = engine.get_access_control_list(&mut txn, root_shared).await.unwrap();
            assert_eq!(depth(&list), vec![1]);
            let list = engine.get_access_control_list(&mut txn, child_now).await.unwrap();
            assert_eq!(depth(&list), vec![2]);
            let list = engine.get_access_control_list(&mut txn, child_shared).await.unwrap();
            assert_eq!(depth(&list), vec![3]);
            let list = engine.get_access_control_list(&mut txn, grandchild_now).await.unwrap();
            assert_eq!(depth(&list), vec![4]);

            if versioned {
                assert_ne!(child_now, child.id);
                let child_acl = engine.get_acl_properties(&mut txn, child_now).await.unwrap();
                assert_eq!(child_acl.inherits_from, Some(root_shared));
            }
        }
    }

    #[tokio::test]
    async fn test_delete_rewires_inheritors() {
        let pool = test_pool().await;
        let engine = AclEngine::new();
        let mut txn = test_txn(&pool).await;

        let parent = engine
            .create_acl(&mut txn, defining(false), &[allow("root", "Read")], None)
            .await
            .unwrap();
        let doomed = engine
            .create_acl(&mut txn, defining(false), &[allow("dave", "Read")], Some(parent.id))
            .await
            .unwrap();
        let x1 = engine.create_acl(&mut txn, defining(false), &[], Some(doomed.id)).await.unwrap();
        let x2 = engine.create_acl(&mut txn, defining(false), &[], Some(doomed.id)).await.unwrap();
        let derivative = x1.inherits_from.unwrap();
        txn.commit().await.unwrap();

        let mut txn = test_txn(&pool).await;
        let changes = engine
            .delete_access_control_list(&mut txn, doomed.id)
            .await
            .unwrap();
        assert_eq!(changes.last().unwrap().after, None);

        let parent_shared = engine
            .get_inherited_access_control_list(&mut txn, parent.id)
            .await
            .unwrap()
            .unwrap();
        for x in [x1.id, x2.id] {
            let now = engine.latest_version(&mut txn, x).await.unwrap();
            let acl = engine.get_acl_properties(&mut txn, now).await.unwrap();
            assert_eq!(acl.inherits_from, Some(parent_shared));
            assert_ne!(acl.inherits_from, Some(derivative));

            let list = engine.get_access_control_list(&mut txn, now).await.unwrap();
            assert!(list.positions_of("dave", "Read").is_empty());
            assert_eq!(list.positions_of("root", "Read"), vec![2]);
        }
        assert!(engine.find_acl(&mut txn, derivative).await.unwrap().is_none());
        assert!(engine.find_acl(&mut txn, doomed.id).await.unwrap().is_none());

        let err = engine
            .delete_access_control_list(&mut txn, parent_shared)
            .await
            .unwrap_err();
        assert!(matches!(err, AclError::InvalidAclKind { kind: AclType::Shared, .. }));
    }

    #[tokio::test]
    async fn test_shared_acl_rejects_entries() {
        let pool = test_pool().await;
        let engine = AclEngine::new();
        let mut txn = test_txn(&pool).await;

        let acl = engine.create_acl(&mut txn, defining(false), &[], None).await.unwrap();
        let shared = engine
            .get_inherited_access_control_list(&mut txn, acl.id)
            .await
            .unwrap()
            .unwrap();
        let err = engine
            .set_access_control_entry(&mut txn, shared, &allow("x", "Read"))
            .await
            .unwrap_err();
        assert!(matches!(err, AclError::InvalidAclKind { .. }));

        let mut inherited = allow("x", "Read");
        inherited.position = 2;
        let err = engine
            .set_access_control_entry(&mut txn, acl.id, &inherited)
            .await
            .unwrap_err();
        assert!(matches!(err, AclError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_delete_entries_by_pattern() {
        let pool = test_pool().await;
        let engine = AclEngine::new();
        let mut txn = test_txn(&pool).await;

        let parent = engine
            .create_acl(&mut txn, defining(false), &[allow("root", "Read")], None)
            .await
            .unwrap();
        let child = engine
            .create_acl(
                &mut txn,
                defining(false),
                &[allow("alice", "Read"), allow("bob", "Write")],
                Some(parent.id),
            )
            .await
            .unwrap();

        engine
            .delete_access_control_entries(&mut txn, child.id, &AcePattern::local().with_authority("alice"))
            .await
            .unwrap();
        let list = engine.get_access_control_list(&mut txn, child.id).await.unwrap();
        assert!(list.positions_of("alice", "Read").is_empty());
        assert_eq!(list.positions_of("bob", "Write"), vec![0]);

        engine
            .delete_inherited_access_control_entries(&mut txn, child.id)
            .await
            .unwrap();
        let list = engine.get_access_control_list(&mut txn, child.id).await.unwrap();
        assert!(list.positions_of("root", "Read").is_empty());

        engine
            .delete_local_access_control_entries(&mut txn, child.id)
            .await
            .unwrap();
        let list = engine.get_access_control_list(&mut txn, child.id).await.unwrap();
        assert!(list.entries.is_empty());
    }

    #[tokio::test]
    async fn test_disable_and_enable_inheritance() {
        let pool = test_pool().await;
        let engine = AclEngine::new();
        let mut txn = test_txn(&pool).await;

        let parent = engine
            .create_acl(&mut txn, defining(false), &[allow("root", "Read")], None)
            .await
            .unwrap();
        let child = engine.create_acl(&mut txn, defining(false), &[], Some(parent.id)).await.unwrap();

        engine.disable_inheritance(&mut txn, child.id, true).await.unwrap();
        let list = engine.get_access_control_list(&mut txn, child.id).await.unwrap();
        assert!(!list.properties.inherits);
        assert_eq!(list.positions_of("root", "Read"), vec![0]);

        // Already disabled
        assert!(engine.disable_inheritance(&mut txn, child.id, false).await.unwrap().is_empty());

        engine.delete_local_access_control_entries(&mut txn, child.id).await.unwrap();
        engine.enable_inheritance(&mut txn, child.id, None).await.unwrap();
        let list = engine.get_access_control_list(&mut txn, child.id).await.unwrap();
        assert!(list.properties.inherits);
        assert_eq!(list.positions_of("root", "Read"), vec![2]);

        let fixed = engine
            .create_acl(&mut txn, AclProperties::new(AclType::Fixed), &[], None)
            .await
            .unwrap();
        assert!(engine.enable_inheritance(&mut txn, fixed.id, None).await.is_err());
        let changes = engine.disable_inheritance(&mut txn, fixed.id, false).await.unwrap();
        assert!(!changes[0].is_remap());
    }

    #[tokio::test]
    async fn test_cow_copy_mode_forces_new_version() {
        let pool = test_pool().await;
        let engine = AclEngine::new();

        let mut txn = test_txn(&pool).await;
        let acl = engine.create_acl(&mut txn, defining(true), &[], None).await.unwrap();
        let same = engine
            .get_acl_copy(&mut txn, acl.id, None, AclCopyMode::Cow)
            .await
            .unwrap();
        assert_eq!(same, Some(acl.id));

        // Same change set, but the copy demands a version
        let changes = engine
            .set_access_control_entry(&mut txn, acl.id, &allow("a", "Read"))
            .await
            .unwrap();
        assert!(changes[0].is_remap());
    }

    #[tokio::test]
    async fn test_copy_mode_creates_independent_acl() {
        let pool = test_pool().await;
        let engine = AclEngine::new();
        let mut txn = test_txn(&pool).await;

        let acl = engine
            .create_acl(&mut txn, defining(false), &[allow("a", "Read")], None)
            .await
            .unwrap();
        let copy = engine
            .get_acl_copy(&mut txn, acl.id, None, AclCopyMode::Copy)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(copy, acl.id);
        let list = engine.get_access_control_list(&mut txn, copy).await.unwrap();
        assert_eq!(list.positions_of("a", "Read"), vec![0]);
    }

    #[tokio::test]
    async fn test_authority_removal_and_readers() {
        let pool = test_pool().await;
        let engine = AclEngine::new();
        let caches = AclCaches::shared();

        let mut txn = test_txn_with(&pool, caches.clone()).await;
        let acl = engine
            .create_acl(
                &mut txn,
                defining(false),
                &[allow("alice", "Read"), allow("bob", "Read"), deny("carol", "Read")],
                None,
            )
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let mut txn = test_txn_with(&pool, caches.clone()).await;
        let readers = engine.get_readers(&mut txn, acl.id).await.unwrap();
        assert_eq!(readers.iter().cloned().collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert!(caches.readers(acl.id).is_some());

        let changes = engine
            .delete_access_control_entries_for_authority(&mut txn, "bob")
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert!(caches.readers(acl.id).is_none());
        let readers = engine.get_readers(&mut txn, acl.id).await.unwrap();
        assert_eq!(readers.len(), 1);
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_layered_acl_merges_indirection() {
        let pool = test_pool().await;
        let engine = AclEngine::new();
        let mut txn = test_txn(&pool).await;

        let target = engine
            .create_acl(&mut txn, defining(false), &[allow("t", "Read")], None)
            .await
            .unwrap();
        let layered = engine.create_layered_acl(&mut txn, Some(target.id)).await.unwrap();
        let list = engine.get_access_control_list(&mut txn, layered).await.unwrap();
        assert_eq!(list.properties.acl_type, AclType::Layered);
        assert_eq!(list.positions_of("t", "Read"), vec![2]);
    }
}
