// config.rs — Store configuration.
//
// Loaded from a small TOML file (conventionally `.ta/store.toml`). Every
// field has a default, so an empty file or a missing file both yield the
// default config.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Tunables for a [`crate::Store`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Serialize and re-parse every written value so that anything which
    /// cannot be encoded fails at write time instead of at read time.
    #[serde(default = "default_round_trip_on_write")]
    pub round_trip_on_write: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            round_trip_on_write: default_round_trip_on_write(),
        }
    }
}

fn default_round_trip_on_write() -> bool {
    true
}

impl StoreConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path).map_err(|source| StoreError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Try to load config, returning the default if the file is missing or
    /// unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "using default store config");
                Self::default()
            }
        }
    }
}
