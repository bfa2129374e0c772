//! Scheduler-wide configuration, loaded once at startup (`risingwave_common`'s
//! `ComputeNodeConfig`/`FrontendConfig` pattern: a `Default`-able struct that
//! round-trips through TOML).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use parallax_common::{Result, SchedulerError};

use crate::plan::QueryOptions;

/// The defaults applied to any query that doesn't override them explicitly.
/// Distinct from a single request's `QueryOptions` in that this is the
/// persisted, cluster-wide preset a deployment ships with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub default_query_options: QueryOptions,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_query_options: QueryOptions::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load a config preset from a TOML file. Missing fields fall back to
    /// `QueryOptions::default()`'s values field by field.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            SchedulerError::internal(format!(
                "failed to open config file '{}': {e}",
                path.display()
            ))
        })?;
        toml::from_str(&raw).map_err(|e| SchedulerError::internal(format!("config parse error: {e}")))
    }
}
