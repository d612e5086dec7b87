//! # ta-store
//!
//! In-memory transactional store for policy evaluation in Trusted Autonomy.
//!
//! The store holds a tree of JSON-shaped data plus a set of named policy
//! modules. Callers open a [`Transaction`], read and write through the
//! [`Store`], then commit or abort. Commit observers registered with
//! [`Store::register`] are notified of every write commit.
//!
//! ## Key invariants
//!
//! - **Root is an object**: adding or replacing the root with anything else
//!   fails with "root must be object"; the root can never be removed.
//! - **Isolation**: a read transaction sees the tree as it was when it
//!   opened; nothing a writer stages is visible before commit.
//! - **Single writer**: write transactions are serialized; readers only wait
//!   while a commit is being published.
//! - **Stale handles fail**: any use of a committed or aborted transaction
//!   returns [`StoreError::StaleTransaction`].
//!
//! ## Key components
//!
//! - [`Store`] — locks, transaction ids, commit and trigger dispatch
//! - [`Transaction`] — handle owning the locks for one operation sequence
//! - [`DataTree`] / [`PatchOp`] — the patch engine over [`Value`] trees
//! - [`PolicyRegistry`] — id → policy module bytes
//! - [`CommitObserver`] / [`CommitEvent`] — commit notifications
//! - [`Update`] / [`TruncateParams`] — bulk reload via [`Store::truncate`]

pub mod config;
pub mod error;
pub mod patch;
pub mod path;
pub mod policy;
pub mod store;
pub mod transaction;
pub mod trigger;
pub mod truncate;
pub mod value;

pub use config::StoreConfig;
pub use error::{ErrorKind, Result, StoreError};
pub use patch::{DataTree, PatchOp};
pub use path::Path;
pub use policy::PolicyRegistry;
pub use store::Store;
pub use transaction::{Transaction, TransactionParams, TxnContext, TxnMode};
pub use trigger::{
    CommitEvent, CommitObserver, DataEvent, PolicyEvent, TriggerConfig, TriggerHandle,
};
pub use truncate::{TruncateParams, Update};
pub use value::{Map, Value};
