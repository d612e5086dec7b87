// transaction.rs — Transaction handles.
//
// A Transaction owns the locks it acquired:
//
//   read txn:  a shared guard on the store state (its snapshot)
//   write txn: the writer mutex guard + a shared snapshot guard, plus the
//              staged copy of whatever it has changed so far
//
// Staged data is a private copy of the committed tree taken on the first
// write ("copy then patch"), so nothing a writer does is visible to anyone
// else until commit swaps it in. The guards are released exactly once, by
// commit, abort, or drop, whichever comes first.
//
// Handles are not `Send`: the guards are tied to the thread that took them,
// so only the call chain that opened a transaction can use it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::lock_api::{ArcMutexGuard, ArcRwLockReadGuard};
use parking_lot::{RawMutex, RawRwLock};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::patch::DataTree;
use crate::policy::PolicyRegistry;
use crate::store::{StoreInner, StoreState};
use crate::trigger::{DataEvent, PolicyEvent};
use crate::value::Value;

pub(crate) type SnapshotGuard = ArcRwLockReadGuard<RawRwLock, StoreState>;
pub(crate) type WriterGuard = ArcMutexGuard<RawMutex, ()>;

/// Read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnMode {
    Read,
    Write,
}

impl fmt::Display for TxnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnMode::Read => write!(f, "read"),
            TxnMode::Write => write!(f, "write"),
        }
    }
}

/// Caller-supplied metadata carried from `new_transaction` to the commit
/// event, e.g. which loader or request produced the write.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TxnContext {
    pub metadata: BTreeMap<String, Value>,
}

impl TxnContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

/// Parameters for [`crate::Store::new_transaction`].
#[derive(Debug, Clone, Default)]
pub struct TransactionParams {
    pub write: bool,
    pub context: TxnContext,
}

impl TransactionParams {
    pub fn read() -> Self {
        Self::default()
    }

    pub fn write() -> Self {
        Self {
            write: true,
            context: TxnContext::default(),
        }
    }

    pub fn with_context(mut self, context: TxnContext) -> Self {
        self.context = context;
        self
    }
}

/// Changes a write transaction has made but not yet published.
#[derive(Default)]
pub(crate) struct Staged {
    pub(crate) data: Option<DataTree>,
    pub(crate) policies: Option<PolicyRegistry>,
    pub(crate) data_events: Vec<DataEvent>,
    pub(crate) policy_events: Vec<PolicyEvent>,
}

/// A live transaction against one [`crate::Store`].
///
/// Obtain one from [`crate::Store::new_transaction`], pass it to the
/// store's operations, and finish it with [`crate::Store::commit`] or
/// [`crate::Store::abort`]. Any use after that fails with
/// [`StoreError::StaleTransaction`].
pub struct Transaction {
    pub(crate) id: u64,
    pub(crate) mode: TxnMode,
    pub(crate) context: TxnContext,
    pub(crate) store: Arc<StoreInner>,
    pub(crate) snapshot: Option<SnapshotGuard>,
    pub(crate) writer: Option<WriterGuard>,
    pub(crate) staged: Staged,
    pub(crate) stale: bool,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    pub fn is_write(&self) -> bool {
        self.mode == TxnMode::Write
    }

    /// True once the transaction has been committed or aborted.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn context(&self) -> &TxnContext {
        &self.context
    }

    pub(crate) fn ensure_active(&self) -> Result<(), StoreError> {
        if self.stale {
            return Err(StoreError::StaleTransaction { txn_id: self.id });
        }
        Ok(())
    }

    pub(crate) fn ensure_write(&self) -> Result<(), StoreError> {
        self.ensure_active()?;
        if !self.is_write() {
            return Err(StoreError::WrongTransactionType { txn_id: self.id });
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<&StoreState, StoreError> {
        self.snapshot
            .as_deref()
            .ok_or(StoreError::StaleTransaction { txn_id: self.id })
    }

    /// The tree this transaction sees: its staged copy, else its snapshot.
    pub(crate) fn data(&self) -> Result<&DataTree, StoreError> {
        match &self.staged.data {
            Some(data) => Ok(data),
            None => Ok(&self.snapshot()?.data),
        }
    }

    pub(crate) fn policies(&self) -> Result<&PolicyRegistry, StoreError> {
        match &self.staged.policies {
            Some(policies) => Ok(policies),
            None => Ok(&self.snapshot()?.policies),
        }
    }

    /// Staged tree, copied from the snapshot on first use.
    pub(crate) fn data_mut(&mut self) -> Result<&mut DataTree, StoreError> {
        let data = match self.staged.data.take() {
            Some(data) => data,
            None => self.snapshot()?.data.clone(),
        };
        Ok(self.staged.data.insert(data))
    }

    pub(crate) fn policies_mut(&mut self) -> Result<&mut PolicyRegistry, StoreError> {
        let policies = match self.staged.policies.take() {
            Some(policies) => policies,
            None => self.snapshot()?.policies.clone(),
        };
        Ok(self.staged.policies.insert(policies))
    }

    /// Mark stale and drop every guard. Safe to call more than once.
    pub(crate) fn release(&mut self) {
        if self.stale {
            return;
        }
        self.stale = true;
        self.staged = Staged::default();
        self.snapshot = None;
        if self.writer.is_some() {
            self.store.clear_writer_owner(self.id);
            self.writer = None;
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("stale", &self.stale)
            .finish_non_exhaustive()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.stale {
            tracing::warn!(
                txn_id = self.id,
                mode = %self.mode,
                "transaction dropped without commit or abort; aborting"
            );
            self.release();
        }
    }
}
