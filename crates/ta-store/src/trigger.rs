// trigger.rs — Commit observers and the events they receive.
//
// A write transaction that commits produces one CommitEvent describing
// every data and policy change it made. Every registered observer gets the
// event exactly once, synchronously, on the committing thread, in
// registration order.
//
// Observers are registered and unregistered through write transactions so
// the trigger table changes under the same serialization as the data.

use std::fmt;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::path::Path;
use crate::store::{Store, StoreInner};
use crate::transaction::{Transaction, TxnContext};
use crate::value::Value;

/// One data change made by a committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataEvent {
    pub path: Path,
    /// The written value; `None` for removals.
    pub data: Option<Value>,
    pub removed: bool,
}

/// One policy change made by a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyEvent {
    pub id: String,
    /// The module bytes; `None` for deletions.
    pub data: Option<Vec<u8>>,
    pub removed: bool,
}

/// Everything observers learn about a commit.
#[derive(Debug, Clone, Serialize)]
pub struct CommitEvent {
    pub txn_id: u64,
    /// Data changes in the order they were written.
    pub data: Vec<DataEvent>,
    /// Policy changes in the order they were written.
    pub policies: Vec<PolicyEvent>,
    /// Context supplied when the transaction was opened.
    pub context: TxnContext,
    pub committed_at: DateTime<Utc>,
}

impl CommitEvent {
    /// True when the transaction committed without changing anything.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.policies.is_empty()
    }

    pub fn data_changed(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn policy_changed(&self) -> bool {
        !self.policies.is_empty()
    }

    /// Whether any data change touched `path` or something under it.
    pub fn touches(&self, path: &Path) -> bool {
        self.data
            .iter()
            .any(|e| e.path.has_prefix(path) || path.has_prefix(&e.path))
    }
}

/// Receives commit notifications.
///
/// `store` and `txn` are the committing store and transaction. The
/// transaction is still readable during the callback and shows the
/// committed state; it is marked stale once every observer has returned.
/// Observers may open read transactions on `store`. Opening a write
/// transaction from inside an observer fails with
/// [`crate::StoreError::WriterReentry`].
pub trait CommitObserver: Send + Sync {
    fn on_commit(&self, store: &Store, txn: &Transaction, event: &CommitEvent);
}

impl<F> CommitObserver for F
where
    F: Fn(&Store, &Transaction, &CommitEvent) + Send + Sync,
{
    fn on_commit(&self, store: &Store, txn: &Transaction, event: &CommitEvent) {
        self(store, txn, event)
    }
}

/// What to register: the observer and an optional name used in logs.
#[derive(Clone)]
pub struct TriggerConfig {
    pub observer: Arc<dyn CommitObserver>,
    pub name: Option<String>,
}

impl TriggerConfig {
    pub fn new(observer: impl CommitObserver + 'static) -> Self {
        Self {
            observer: Arc::new(observer),
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Debug for TriggerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerConfig")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Returned by [`Store::register`]; pass a write transaction to
/// [`TriggerHandle::unregister`] to remove the trigger.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    pub(crate) id: Uuid,
    pub(crate) store: Weak<StoreInner>,
}

impl TriggerHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl PartialEq for TriggerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TriggerHandle {}

#[derive(Clone)]
pub(crate) struct TriggerEntry {
    pub(crate) id: Uuid,
    pub(crate) name: Option<String>,
    pub(crate) observer: Arc<dyn CommitObserver>,
}

/// Registered triggers in registration order.
#[derive(Default)]
pub(crate) struct TriggerTable {
    entries: Vec<TriggerEntry>,
}

impl TriggerTable {
    pub(crate) fn insert(&mut self, config: TriggerConfig) -> Uuid {
        let id = Uuid::new_v4();
        self.entries.push(TriggerEntry {
            id,
            name: config.name,
            observer: config.observer,
        });
        id
    }

    /// Remove by id. Returns whether anything was removed.
    pub(crate) fn remove(&mut self, id: Uuid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Copy of the current entries, so dispatch runs without the table lock.
    pub(crate) fn snapshot(&self) -> Vec<TriggerEntry> {
        self.entries.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
