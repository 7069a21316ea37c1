use thiserror::Error;

use crate::cell::CellRef;

/// Structural violations rejected by the document store.
///
/// These are never coerced: a caller that sees one of these must fix its
/// request (grow the document, re-resolve a position) and try again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("cell {cell} is outside the document ({rows} rows x {cols} columns)")]
    OutOfBounds { cell: CellRef, rows: usize, cols: usize },

    #[error("row {row} has {found} cells, schema expects {expected}")]
    WidthMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("row range {start}..{end} is invalid for {rows} rows")]
    RowRange { start: usize, end: usize, rows: usize },

    #[error("invalid cell name: {0}")]
    InvalidCellName(String),
}

/// Undo/redo exhaustion. A normal condition, callers may ignore it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryError {
    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("server answered {code}: {message}")]
    Status { code: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("malformed response: {0}")]
    Decode(String),
}

impl TransportError {
    /// 5xx, network failures and timeouts are transient. Every other status
    /// (403, 404, other 4xx) is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Status { code, .. } => *code >= 500,
            TransportError::Network(_) | TransportError::Timeout => true,
            TransportError::Decode(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("save failed after {attempts} attempt(s): {source}")]
    SaveFailed {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("access to document {0} was denied")]
    Forbidden(String),

    #[error("document {0} was not found")]
    NotFound(String),

    #[error("sync is suspended for document {0} until it is reopened")]
    Suspended(String),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SyncError {
    /// Maps a final (non-retryable) transport error to the permission /
    /// not-found variants the scheduler suspends on.
    pub fn from_final(document_id: &str, err: TransportError) -> Self {
        match err.status() {
            Some(403) | Some(401) => SyncError::Forbidden(document_id.to_string()),
            Some(404) => SyncError::NotFound(document_id.to_string()),
            _ => SyncError::Transport(err),
        }
    }

    /// True for errors after which no further sync is attempted.
    pub fn suspends_sync(&self) -> bool {
        matches!(self, SyncError::Forbidden(_) | SyncError::NotFound(_))
    }
}

/// Failures of the authoritative server-side store.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("document {0} was not found")]
    NotFound(String),

    #[error("document {0} already exists")]
    AlreadyExists(String),

    #[error(transparent)]
    Invalid(#[from] DocumentError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("no valid access token")]
    Unauthenticated,

    #[error("token does not grant {0} access to this document")]
    Denied(&'static str),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("config error: {0}")]
    Config(String),
}
