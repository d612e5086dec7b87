// truncate.rs — Bulk reload of data and policies.
//
// Loaders (bundle readers, config reload) stream updates into a write
// transaction. Policies are upserted as they arrive. Data updates are
// folded into one merged object first:
//
//   update /a/b = {"c": 1}   →   {"a": {"b": {"c": 1}}}   →   merge
//
// Merging is a recursive object union; two non-object values at the same
// location are a conflict. Once the stream ends, the merged object either
// replaces the root (root_overwrite) or is written one base path at a time.
// Base paths missing from the merged data are left as they are.

use crate::error::{Result, StoreError};
use crate::patch::{self, PatchOp};
use crate::path::Path;
use crate::store::Store;
use crate::transaction::Transaction;
use crate::value::{Map, Value};

/// One item from a bulk load.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Data to place at `path`. A `Null` value is skipped.
    Data { path: Path, value: Value },
    /// A policy module to upsert under `id`.
    Policy { id: String, module: Vec<u8> },
}

impl Update {
    pub fn data(path: impl Into<Path>, value: impl Into<Value>) -> Self {
        Update::Data {
            path: path.into(),
            value: value.into(),
        }
    }

    pub fn policy(id: impl Into<String>, module: impl Into<Vec<u8>>) -> Self {
        Update::Policy {
            id: id.into(),
            module: module.into(),
        }
    }

    pub fn is_policy(&self) -> bool {
        matches!(self, Update::Policy { .. })
    }
}

/// How the merged data is written back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TruncateParams {
    /// Replace the whole root with the merged data.
    pub root_overwrite: bool,
    /// Subtrees to replace when `root_overwrite` is false.
    pub base_paths: Vec<Path>,
}

impl TruncateParams {
    pub fn root_overwrite() -> Self {
        Self {
            root_overwrite: true,
            base_paths: Vec::new(),
        }
    }

    pub fn with_base_paths(base_paths: impl IntoIterator<Item = Path>) -> Self {
        Self {
            root_overwrite: false,
            base_paths: base_paths.into_iter().collect(),
        }
    }
}

impl Store {
    /// Load a stream of updates into a write transaction.
    ///
    /// The first error (from the stream, a merge conflict, or a write)
    /// stops the load; the transaction stays open for the caller to abort.
    pub fn truncate<I, E>(&self, txn: &mut Transaction, params: &TruncateParams, updates: I) -> Result<()>
    where
        I: IntoIterator<Item = std::result::Result<Update, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.check_write(txn)?;

        let mut merged = Map::new();
        let mut policies = 0usize;
        let mut files = 0usize;
        for item in updates {
            match item.map_err(|e| StoreError::Update(e.into()))? {
                Update::Policy { id, module } => {
                    self.upsert_policy(txn, id, module)?;
                    policies += 1;
                }
                Update::Data { path, value } => {
                    if value.is_null() {
                        continue;
                    }
                    let tree = nest(&path, value)?;
                    if !merge_into(&mut merged, tree) {
                        return Err(StoreError::MergeConflict {
                            path: path.to_string(),
                        });
                    }
                    files += 1;
                }
            }
        }

        tracing::debug!(
            txn_id = txn.id(),
            policies,
            data_updates = files,
            root_overwrite = params.root_overwrite,
            "truncate merged update stream"
        );

        if params.root_overwrite {
            return self.write(txn, PatchOp::Add, &Path::root(), Value::Object(merged));
        }

        let merged = Value::Object(merged);
        for base in &params.base_paths {
            let Some(value) = patch::lookup(&merged, base) else {
                continue;
            };
            if let Some(parent) = base.parent() {
                self.make_dir(txn, &parent)?;
            }
            self.write(txn, PatchOp::Add, base, value.clone())?;
        }
        Ok(())
    }
}

/// Wrap `value` in one object per path segment.
fn nest(path: &Path, value: Value) -> Result<Map> {
    let mut node = value;
    for segment in path.segments().iter().rev() {
        let mut wrapper = Map::new();
        wrapper.insert(segment.clone(), node);
        node = Value::Object(wrapper);
    }
    match node {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::RootMustBeObject),
    }
}

/// Recursive object union of `src` into `dst`. Returns false when both
/// sides hold a value at the same key and one of them is not an object.
fn merge_into(dst: &mut Map, src: Map) -> bool {
    for (key, incoming) in src {
        match dst.get_mut(&key) {
            None => {
                dst.insert(key, incoming);
            }
            Some(Value::Object(existing)) => match incoming {
                Value::Object(incoming) => {
                    if !merge_into(existing, incoming) {
                        return false;
                    }
                }
                _ => return false,
            },
            Some(_) => return false,
        }
    }
    true
}
