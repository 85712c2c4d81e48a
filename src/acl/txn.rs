//! Explicit transaction context threaded through every engine call
//!
//! Holds the database transaction, the lazily created change set, the
//! deferral budget and the cache-invalidation sink.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::debug;

use super::{AccessControlList, AclId, QName};
use crate::error::AclError;

/// Default wall-clock budget before cascades are deferred
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(10);

/// Process-wide caches keyed by ACL id and interned name
///
/// ACL entries are invalidated on write, never updated in place.
#[derive(Default)]
pub struct AclCaches {
    acls: Mutex<HashMap<AclId, Arc<AccessControlList>>>,
    readers: Mutex<HashMap<AclId, Arc<BTreeSet<String>>>>,
    qnames: Mutex<HashMap<QName, i64>>,
    permissions: Mutex<HashMap<(i64, String), i64>>,
    authorities: Mutex<HashMap<String, i64>>,
}

impl std::fmt::Debug for AclCaches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclCaches")
            .field("acls", &self.acls.lock().len())
            .field("readers", &self.readers.lock().len())
            .field("authorities", &self.authorities.lock().len())
            .finish()
    }
}

/// An interned id learned inside a transaction
#[derive(Debug, Clone)]
pub(crate) enum Interned {
    QName(QName, i64),
    Permission(i64, String, i64),
    Authority(String, i64),
}

impl AclCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared instance
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn acl(&self, id: AclId) -> Option<Arc<AccessControlList>> {
        self.acls.lock().get(&id).cloned()
    }

    pub(crate) fn put_acl(&self, id: AclId, acl: Arc<AccessControlList>) {
        self.acls.lock().insert(id, acl);
    }

    pub fn readers(&self, id: AclId) -> Option<Arc<BTreeSet<String>>> {
        self.readers.lock().get(&id).cloned()
    }

    pub(crate) fn put_readers(&self, id: AclId, readers: Arc<BTreeSet<String>>) {
        self.readers.lock().insert(id, readers);
    }

    /// Drop every cached view of `id`
    pub fn invalidate(&self, id: AclId) {
        self.acls.lock().remove(&id);
        self.readers.lock().remove(&id);
    }

    /// Drop all ACL content and readers
    pub fn invalidate_all(&self) {
        self.acls.lock().clear();
        self.readers.lock().clear();
    }

    pub(crate) fn qname(&self, qname: &QName) -> Option<i64> {
        self.qnames.lock().get(qname).copied()
    }

    pub(crate) fn permission(&self, type_id: i64, name: &str) -> Option<i64> {
        self.permissions
            .lock()
            .get(&(type_id, name.to_string()))
            .copied()
    }

    pub(crate) fn authority(&self, name: &str) -> Option<i64> {
        self.authorities.lock().get(name).copied()
    }

    pub(crate) fn forget_authority(&self, name: &str) {
        self.authorities.lock().remove(name);
    }

    fn promote(&self, staged: Vec<Interned>) {
        for entry in staged {
            match entry {
                Interned::QName(qname, id) => {
                    self.qnames.lock().insert(qname, id);
                }
                Interned::Permission(type_id, name, id) => {
                    self.permissions.lock().insert((type_id, name), id);
                }
                Interned::Authority(name, id) => {
                    self.authorities.lock().insert(name, id);
                }
            }
        }
    }
}

/// Summary of a committed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub change_set_id: Option<i64>,
    /// A cascade was deferred and the fixup worker should run
    pub async_required: bool,
}

/// Transaction context for ACL writes
pub struct AclTxn {
    tx: Transaction<'static, Sqlite>,
    caches: Arc<AclCaches>,
    change_set_id: Option<i64>,
    started: Instant,
    budget: Duration,
    async_call: bool,
    async_required: bool,
    touched: HashSet<AclId>,
    staged: Vec<Interned>,
}

impl std::fmt::Debug for AclTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclTxn")
            .field("change_set_id", &self.change_set_id)
            .field("elapsed", &self.started.elapsed())
            .field("budget", &self.budget)
            .field("async_call", &self.async_call)
            .field("async_required", &self.async_required)
            .field("touched", &self.touched.len())
            .finish()
    }
}

impl AclTxn {
    /// Begin a transaction with the default budget and async deferral disabled
    pub async fn begin(pool: &SqlitePool, caches: Arc<AclCaches>) -> Result<Self, AclError> {
        let tx = pool.begin().await?;
        Ok(Self {
            tx,
            caches,
            change_set_id: None,
            started: Instant::now(),
            budget: DEFAULT_BUDGET,
            async_call: false,
            async_required: false,
            touched: HashSet::new(),
            staged: Vec::new(),
        })
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Allow cascades to be deferred to the fixup worker
    pub fn allow_async(mut self, async_call: bool) -> Self {
        self.async_call = async_call;
        self
    }

    /// Connection bound to this transaction
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub fn caches(&self) -> &Arc<AclCaches> {
        &self.caches
    }

    /// Id of this transaction's change set, created on first use
    pub async fn change_set_id(&mut self) -> Result<i64, AclError> {
        if let Some(id) = self.change_set_id {
            return Ok(id);
        }
        let result = sqlx::query("INSERT INTO acl_change_sets DEFAULT VALUES")
            .execute(&mut *self.tx)
            .await?;
        let id = result.last_insert_rowid();
        debug!(change_set_id = id, "Opened ACL change set");
        self.change_set_id = Some(id);
        Ok(id)
    }

    /// Change set id if one was opened
    pub fn current_change_set(&self) -> Option<i64> {
        self.change_set_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn async_call(&self) -> bool {
        self.async_call
    }

    /// Whether the next recursion step should be deferred
    pub fn budget_exceeded(&self) -> bool {
        self.async_call && self.started.elapsed() >= self.budget
    }

    pub fn require_async(&mut self) {
        self.async_required = true;
    }

    pub fn async_required(&self) -> bool {
        self.async_required
    }

    /// Record a write to `id` and drop its cached views
    pub fn invalidate(&mut self, id: AclId) {
        self.caches.invalidate(id);
        self.touched.insert(id);
    }

    /// Whether this transaction wrote `id`
    pub fn touched(&self, id: AclId) -> bool {
        self.touched.contains(&id)
    }

    pub(crate) fn stage(&mut self, interned: Interned) {
        self.staged.push(interned);
    }

    pub(crate) fn unstage_authority(&mut self, name: &str) {
        self.staged
            .retain(|i| !matches!(i, Interned::Authority(n, _) if n == name));
    }

    /// Commit, stamp the change set and re-invalidate every touched id
    pub async fn commit(mut self) -> Result<CommitOutcome, AclError> {
        if let Some(id) = self.change_set_id {
            sqlx::query("UPDATE acl_change_sets SET commit_time_ms = ? WHERE id = ?")
                .bind(chrono::Utc::now().timestamp_millis())
                .bind(id)
                .execute(&mut *self.tx)
                .await?;
        }

        let AclTxn {
            tx,
            caches,
            change_set_id,
            async_required,
            touched,
            staged,
            ..
        } = self;

        tx.commit().await?;
        for id in touched {
            caches.invalidate(id);
        }
        caches.promote(staged);

        Ok(CommitOutcome {
            change_set_id,
            async_required,
        })
    }

    pub async fn rollback(self) -> Result<(), AclError> {
        let AclTxn {
            tx,
            caches,
            touched,
            ..
        } = self;
        tx.rollback().await?;
        for id in touched {
            caches.invalidate(id);
        }
        Ok(())
    }
}
