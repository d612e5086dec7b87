// store.rs — The transactional data and policy store.
//
// Locking uses a pair of parking_lot locks:
//
//   writer: Mutex<()>           at most one write transaction at a time
//   state:  RwLock<StoreState>  readers share; a committing writer takes
//                               it exclusively only to publish
//
// Commit sequence for a write transaction:
//
//   1. drop the writer's own shared snapshot guard
//   2. take `state` exclusively (waits for open readers; new readers only
//      get in while older ones are still open)
//   3. swap in the staged tree / policies
//   4. downgrade to shared, so observers and new readers see the new state
//   5. run every commit observer
//   6. mark stale, release the snapshot guard and the writer mutex
//
// Abort never touches `state` exclusively: nothing was published.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use chrono::Utc;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::patch::{DataTree, PatchOp};
use crate::path::Path;
use crate::policy::PolicyRegistry;
use crate::transaction::{Staged, Transaction, TransactionParams, TxnMode};
use crate::trigger::{
    CommitEvent, DataEvent, PolicyEvent, TriggerConfig, TriggerHandle, TriggerTable,
};
use crate::value::{Map, Value};

/// Committed contents of the store.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) data: DataTree,
    pub(crate) policies: PolicyRegistry,
}

pub(crate) struct StoreInner {
    config: StoreConfig,
    state: Arc<RwLock<StoreState>>,
    writer: Arc<Mutex<()>>,
    next_txn_id: AtomicU64,
    triggers: Mutex<TriggerTable>,
    /// Thread and txn id currently holding `writer`.
    writer_owner: Mutex<Option<(ThreadId, u64)>>,
}

impl StoreInner {
    pub(crate) fn clear_writer_owner(&self, txn_id: u64) {
        let mut owner = self.writer_owner.lock();
        if matches!(*owner, Some((_, id)) if id == txn_id) {
            *owner = None;
        }
    }
}

/// In-memory transactional store for policy data and policy modules.
///
/// `Store` is a cheap handle: clones share the same underlying state, so
/// hand a clone to every component that needs one.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Create an empty store (root = `{}`) with default config.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                state: Arc::new(RwLock::new(StoreState::default())),
                writer: Arc::new(Mutex::new(())),
                next_txn_id: AtomicU64::new(1),
                triggers: Mutex::new(TriggerTable::default()),
                writer_owner: Mutex::new(None),
            }),
        }
    }

    /// Create a store seeded with `data` as its root.
    pub fn from_object(data: Map) -> Result<Self> {
        Self::from_object_with_config(data, StoreConfig::default())
    }

    pub fn from_object_with_config(data: Map, config: StoreConfig) -> Result<Self> {
        let store = Self::with_config(config);
        let mut txn = store.write_transaction()?;
        if let Err(e) = store.write(&mut txn, PatchOp::Add, &Path::root(), Value::Object(data)) {
            store.abort(&mut txn);
            return Err(e);
        }
        store.commit(&mut txn)?;
        Ok(store)
    }

    /// Create a store seeded from a JSON document. The document must be an
    /// object.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let doc: Value = serde_json::from_reader(reader)?;
        match doc {
            Value::Object(map) => Self::from_object(map),
            _ => Err(StoreError::RootMustBeObject),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Open a transaction. Write transactions block until no other write
    /// transaction is open; read transactions block only while a commit is
    /// being published.
    ///
    /// Read transactions may open while a commit is waiting to publish, as
    /// long as other readers are still open. A steady stream of overlapping
    /// readers can therefore delay a commit indefinitely.
    ///
    /// A thread that holds an open read transaction must not commit a write
    /// transaction: the commit waits for every reader, including that one.
    pub fn new_transaction(&self, params: TransactionParams) -> Result<Transaction> {
        let mode = if params.write {
            TxnMode::Write
        } else {
            TxnMode::Read
        };

        let writer = if params.write {
            let me = thread::current().id();
            if let Some((owner, held_by)) = *self.inner.writer_owner.lock() {
                if owner == me {
                    return Err(StoreError::WriterReentry { held_by });
                }
            }
            Some(self.inner.writer.lock_arc())
        } else {
            None
        };

        let id = self.inner.next_txn_id.fetch_add(1, Ordering::SeqCst);
        if writer.is_some() {
            *self.inner.writer_owner.lock() = Some((thread::current().id(), id));
        }
        // Recursive so a reader is never queued behind a commit that is
        // itself waiting for readers this thread already holds.
        let snapshot = self.inner.state.read_arc_recursive();

        tracing::debug!(txn_id = id, mode = %mode, "transaction opened");
        Ok(Transaction {
            id,
            mode,
            context: params.context,
            store: Arc::clone(&self.inner),
            snapshot: Some(snapshot),
            writer,
            staged: Staged::default(),
            stale: false,
        })
    }

    pub fn read_transaction(&self) -> Result<Transaction> {
        self.new_transaction(TransactionParams::read())
    }

    pub fn write_transaction(&self) -> Result<Transaction> {
        self.new_transaction(TransactionParams::write())
    }

    pub(crate) fn check(&self, txn: &Transaction) -> Result<()> {
        if !Arc::ptr_eq(&self.inner, &txn.store) {
            return Err(StoreError::UnknownTransaction { txn_id: txn.id });
        }
        txn.ensure_active()
    }

    pub(crate) fn check_write(&self, txn: &Transaction) -> Result<()> {
        self.check(txn)?;
        txn.ensure_write()
    }

    /// Value at `path` as this transaction sees it.
    ///
    /// The returned reference borrows the transaction; it is shared with
    /// the store and must not be modified (copies happen on write).
    pub fn read<'t>(&self, txn: &'t Transaction, path: &Path) -> Result<&'t Value> {
        self.check(txn)?;
        txn.data()?
            .lookup(path)
            .ok_or_else(|| StoreError::NotFound {
                path: path.to_string(),
            })
    }

    /// Apply one patch operation in a write transaction.
    ///
    /// A failed write leaves the transaction open and its earlier writes in
    /// place; abort it if the partial state must not be committed.
    pub fn write(&self, txn: &mut Transaction, op: PatchOp, path: &Path, value: Value) -> Result<()> {
        self.check_write(txn)?;
        let value = if op != PatchOp::Remove && self.inner.config.round_trip_on_write {
            value.round_trip()?
        } else {
            value
        };
        let data = (op != PatchOp::Remove).then(|| value.clone());
        txn.data_mut()?.apply(op, path, value)?;
        txn.staged.data_events.push(DataEvent {
            path: path.clone(),
            data,
            removed: op == PatchOp::Remove,
        });
        Ok(())
    }

    /// [`Store::write`] for any serde-serializable value.
    pub fn write_serialize<T: Serialize + ?Sized>(
        &self,
        txn: &mut Transaction,
        op: PatchOp,
        path: &Path,
        value: &T,
    ) -> Result<()> {
        self.write(txn, op, path, Value::from_serialize(value)?)
    }

    /// Create every missing object along `path`.
    pub fn make_dir(&self, txn: &mut Transaction, path: &Path) -> Result<()> {
        self.check_write(txn)?;
        if txn.data()?.lookup(path).is_some_and(Value::is_object) {
            return Ok(());
        }
        txn.data_mut()?.make_dir(path)?;
        txn.staged.data_events.push(DataEvent {
            path: path.clone(),
            data: Some(Value::object()),
            removed: false,
        });
        Ok(())
    }

    /// Ids of every policy module, sorted.
    pub fn list_policies(&self, txn: &Transaction) -> Result<Vec<String>> {
        self.check(txn)?;
        Ok(txn.policies()?.ids())
    }

    pub fn get_policy<'t>(&self, txn: &'t Transaction, id: &str) -> Result<&'t [u8]> {
        self.check(txn)?;
        txn.policies()?.get(id)
    }

    pub fn upsert_policy(
        &self,
        txn: &mut Transaction,
        id: impl Into<String>,
        module: Vec<u8>,
    ) -> Result<()> {
        self.check_write(txn)?;
        let id = id.into();
        txn.policies_mut()?.upsert(id.clone(), module.clone());
        txn.staged.policy_events.push(PolicyEvent {
            id,
            data: Some(module),
            removed: false,
        });
        Ok(())
    }

    /// Delete a policy module. Fails with `PolicyNotFound` if the id does
    /// not exist in this transaction's view.
    pub fn delete_policy(&self, txn: &mut Transaction, id: &str) -> Result<()> {
        self.check_write(txn)?;
        if !txn.policies()?.contains(id) {
            return Err(StoreError::PolicyNotFound { id: id.to_string() });
        }
        txn.policies_mut()?.delete(id)?;
        txn.staged.policy_events.push(PolicyEvent {
            id: id.to_string(),
            data: None,
            removed: true,
        });
        Ok(())
    }

    /// Register a commit observer. It fires for this transaction's commit
    /// and every later one until unregistered.
    pub fn register(&self, txn: &mut Transaction, config: TriggerConfig) -> Result<TriggerHandle> {
        self.check_write(txn)?;
        let name = config.name.clone();
        let id = self.inner.triggers.lock().insert(config);
        tracing::debug!(txn_id = txn.id, trigger = %id, name = ?name, "trigger registered");
        Ok(TriggerHandle {
            id,
            store: Arc::downgrade(&self.inner),
        })
    }

    /// Number of registered triggers.
    pub fn trigger_count(&self) -> usize {
        self.inner.triggers.lock().len()
    }

    /// Finish a transaction.
    ///
    /// Read transactions just release their lock. Write transactions
    /// publish their staged changes, notify every registered observer, and
    /// then release.
    pub fn commit(&self, txn: &mut Transaction) -> Result<()> {
        self.check(txn)?;
        if !txn.is_write() {
            txn.release();
            tracing::debug!(txn_id = txn.id, "read transaction committed");
            return Ok(());
        }

        let staged = std::mem::take(&mut txn.staged);
        txn.snapshot = None;
        let mut state = self.inner.state.write_arc();
        if let Some(data) = staged.data {
            state.data = data;
        }
        if let Some(policies) = staged.policies {
            state.policies = policies;
        }
        txn.snapshot = Some(ArcRwLockWriteGuard::downgrade(state));

        let event = CommitEvent {
            txn_id: txn.id,
            data: staged.data_events,
            policies: staged.policy_events,
            context: txn.context.clone(),
            committed_at: Utc::now(),
        };
        tracing::debug!(
            txn_id = txn.id,
            data_changes = event.data.len(),
            policy_changes = event.policies.len(),
            "write transaction committed"
        );
        self.dispatch(txn, &event);

        txn.release();
        Ok(())
    }

    fn dispatch(&self, txn: &Transaction, event: &CommitEvent) {
        let entries = self.inner.triggers.lock().snapshot();
        for entry in entries {
            tracing::trace!(txn_id = txn.id, trigger = %entry.id, name = ?entry.name, "dispatching commit");
            entry.observer.on_commit(self, txn, event);
        }
    }

    /// Discard a transaction's changes and release its locks. Aborting a
    /// transaction that is already finished does nothing.
    pub fn abort(&self, txn: &mut Transaction) {
        if txn.stale {
            return;
        }
        tracing::debug!(txn_id = txn.id, mode = %txn.mode, "transaction aborted");
        txn.release();
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.inner.config)
            .field("triggers", &self.trigger_count())
            .finish_non_exhaustive()
    }
}

impl TriggerHandle {
    /// Remove this trigger. Requires a write transaction on the store that
    /// registered it; unregistering twice is harmless.
    pub fn unregister(&self, txn: &mut Transaction) -> Result<()> {
        if !std::ptr::eq(self.store.as_ptr(), Arc::as_ptr(&txn.store)) {
            return Err(StoreError::UnknownTransaction { txn_id: txn.id });
        }
        txn.ensure_write()?;
        let removed = txn.store.triggers.lock().remove(self.id);
        tracing::debug!(txn_id = txn.id, trigger = %self.id, removed, "trigger unregistered");
        Ok(())
    }
}
