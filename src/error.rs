//! Error taxonomy shared by the storage layer and the index façades.

use std::borrow::Cow;
use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FramewiseError>;

#[derive(Debug, Error)]
pub enum FramewiseError {
    #[error("no index found at {path}: {reason}")]
    IndexNotFound { path: PathBuf, reason: Cow<'static, str> },

    #[error("document {id} not found")]
    DocumentNotFound { id: i64 },

    #[error("frame {id} not found")]
    FrameNotFound { id: i64 },

    #[error("setting '{name}' not found")]
    SettingNotFound { name: String },

    #[error("term '{term}' not found in field '{field}'")]
    TermNotFound { term: String, field: String },

    #[error("index at {path} is locked by another writer")]
    WriteLocked { path: PathBuf },

    #[error("schema version mismatch: store is at {on_disk}, expected {expected}")]
    SchemaMismatch { on_disk: i64, expected: u32 },

    #[error(
        "migration from {from} to {to} failed at step {failed_at}; store left at version {last_successful}: {reason}"
    )]
    MigrationFailed {
        from: i64,
        to: u32,
        failed_at: u32,
        last_successful: i64,
        reason: String,
    },

    #[error("field '{field}' is not indexed for this kind of query")]
    NonIndexedField { field: String },

    #[error("field '{field}' is not part of the schema")]
    UnknownField { field: String },

    #[error("operator '{operator}' is not supported by field '{field}'")]
    UnsupportedOperator { operator: String, field: String },

    #[error("operator '{operator}' cannot be used in a search")]
    NonSearchableOperator { operator: String },

    #[error("no plugin state for {plugin}")]
    PluginNotFound { plugin: String },

    #[error("storage already exists at {path}")]
    DuplicateStorage { path: PathBuf },

    #[error("no storage found at {path}")]
    StorageNotFound { path: PathBuf },

    #[error("field '{field}' already exists in the schema")]
    FieldExists { field: String },

    #[error("invalid query: {reason}")]
    InvalidQuery { reason: Cow<'static, str> },

    #[error("invalid document: {reason}")]
    InvalidDocument { reason: Cow<'static, str> },

    #[error("invalid index config: {reason}")]
    InvalidConfig { reason: Cow<'static, str> },

    #[error("invalid state: {reason}")]
    InvalidState { reason: Cow<'static, str> },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FramewiseError {
    /// True for the single-item lookup failures (document, frame, setting, term, plugin).
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DocumentNotFound { .. }
                | Self::FrameNotFound { .. }
                | Self::SettingNotFound { .. }
                | Self::TermNotFound { .. }
                | Self::PluginNotFound { .. }
        )
    }

    pub(crate) fn invalid_query(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_document(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidDocument {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_state(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }
}
