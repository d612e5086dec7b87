// policy.rs — Named policy modules.
//
// Policies live in their own namespace next to the data tree. The store
// never looks inside a module: it is an opaque byte blob keyed by id.

use std::collections::BTreeMap;

use crate::error::StoreError;

/// id → module bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyRegistry {
    modules: BTreeMap<String, Vec<u8>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a module.
    pub fn upsert(&mut self, id: impl Into<String>, module: Vec<u8>) {
        self.modules.insert(id.into(), module);
    }

    pub fn get(&self, id: &str) -> Result<&[u8], StoreError> {
        self.modules
            .get(id)
            .map(Vec::as_slice)
            .ok_or_else(|| StoreError::PolicyNotFound { id: id.to_string() })
    }

    /// Delete a module. Deleting an id that is not present is an error.
    pub fn delete(&mut self, id: &str) -> Result<(), StoreError> {
        self.modules
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::PolicyNotFound { id: id.to_string() })
    }

    /// All ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
