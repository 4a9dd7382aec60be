// ABOUTME: Error types for opening a store and for operations on an open store.
// ABOUTME: OpenError unions the structural open failures with migration failures.

use std::path::PathBuf;

use thiserror::Error;
use trellis_core::{ObjectKey, SchemaError};

use crate::migration::StoreMigrationError;

/// Failures while locating, creating, or opening the store file.
#[derive(Debug, Error)]
pub enum StoreOpenError {
    #[error("invalid schema name: {0:?}")]
    InvalidName(String),

    #[error("schema descriptor not found: {0}")]
    SchemaNotFound(PathBuf),

    #[error("schema descriptor unreadable: {path}: {reason}")]
    SchemaUnreadable { path: PathBuf, reason: String },

    #[error("invalid schema descriptor: {0}")]
    InvalidSchema(#[from] SchemaError),

    #[error("store already open in this process: {0}")]
    AlreadyOpen(PathBuf),

    #[error("store file is not a usable database: {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("store metadata {key} holds an unreadable value: {value:?}")]
    CorruptMeta { key: String, value: String },

    #[error("stored schema descriptor is not valid json: {0}")]
    StoredSchema(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Anything that prevents a store handle from being produced.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Open(#[from] StoreOpenError),

    #[error(transparent)]
    Migration(#[from] StoreMigrationError),
}

/// Failures of reads and commits against an open store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored row is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("constraint violation: {0}")]
    Constraint(#[from] SchemaError),

    #[error("object already exists in store: {0}")]
    DuplicateObject(ObjectKey),
}
