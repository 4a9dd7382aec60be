// ABOUTME: Coordinator configuration loaded from TRELLIS_* environment variables with defaults.
// ABOUTME: Also defines the failure policy applied to errors a caller cannot recover from.

use std::path::PathBuf;

use thiserror::Error;
use trellis_store::StoreOptions;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TRELLIS_SCHEMA must not be empty")]
    EmptySchemaName,

    #[error("TRELLIS_ON_FATAL must be \"abort\" or \"report\", got {0:?}")]
    InvalidFailurePolicy(String),
}

/// What happens when bootstrap or a root save fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log and terminate the process.
    Abort,
    /// Log and hand the error back to the caller.
    Report,
}

impl FailurePolicy {
    /// Abort in debug builds, report in release builds.
    pub fn for_build() -> Self {
        if cfg!(debug_assertions) {
            FailurePolicy::Abort
        } else {
            FailurePolicy::Report
        }
    }

    /// Log `error` and, under `Abort`, terminate. Returns only under `Report`.
    pub fn handle(&self, what: &str, error: &dyn std::error::Error) {
        tracing::error!("{} failed: {}", what, error);
        if *self == FailurePolicy::Abort {
            tracing::error!("aborting: on-fatal policy is abort");
            std::process::abort();
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub data_dir: PathBuf,
    pub resources_dir: PathBuf,
    pub schema_name: String,
    pub on_fatal: FailurePolicy,
    pub store_options: StoreOptions,
}

impl CoordinatorConfig {
    pub fn new(data_dir: PathBuf, resources_dir: PathBuf, schema_name: impl Into<String>) -> Self {
        Self {
            data_dir,
            resources_dir,
            schema_name: schema_name.into(),
            on_fatal: FailurePolicy::for_build(),
            store_options: StoreOptions::default(),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_fatal = policy;
        self
    }

    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - TRELLIS_DATA_DIR: store directory (default: ~/.trellis)
    /// - TRELLIS_RESOURCES: schema and seed directory (default: ./resources)
    /// - TRELLIS_SCHEMA: schema name (default: DataModel)
    /// - TRELLIS_ON_FATAL: abort or report (default: abort in debug builds)
    /// - TRELLIS_AUTO_MIGRATE: migrate on schema change (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = lookup("TRELLIS_DATA_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                lookup("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".trellis")
            });

        let resources_dir = lookup("TRELLIS_RESOURCES")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("resources"));

        let schema_name = lookup("TRELLIS_SCHEMA").unwrap_or_else(|| "DataModel".to_string());
        if schema_name.trim().is_empty() {
            return Err(ConfigError::EmptySchemaName);
        }

        let on_fatal = match lookup("TRELLIS_ON_FATAL").as_deref() {
            None | Some("") => FailurePolicy::for_build(),
            Some("abort") => FailurePolicy::Abort,
            Some("report") => FailurePolicy::Report,
            Some(other) => return Err(ConfigError::InvalidFailurePolicy(other.to_string())),
        };

        let auto_migrate = lookup("TRELLIS_AUTO_MIGRATE")
            .map(|v| v == "true" || v == "1" || v == "yes")
            .unwrap_or(true);

        Ok(Self {
            data_dir,
            resources_dir,
            schema_name,
            on_fatal,
            store_options: StoreOptions {
                auto_migrate,
                ..StoreOptions::default()
            },
        })
    }
}
