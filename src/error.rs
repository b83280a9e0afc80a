use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A source file that cannot be streamed at all.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path:?} starts with {found:?}; expected '[' (array) or '{{' (one object per line)")]
    UnrecognizedLayout { path: PathBuf, found: char },

    #[error("first record of {path:?} is not a JSON object: {reason}")]
    FirstRecord { path: PathBuf, reason: String },
}

/// Why the normalizer dropped a record. Never fatal; counted per source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("missing identifier (looked at {0})")]
    MissingIdentifier(&'static str),

    #[error("invalid url {0:?}")]
    InvalidUrl(String),

    #[error("{0} records are not ingested")]
    UnsupportedSource(&'static str),
}

/// Failure reported by a graph store.
///
/// Connectivity and authentication failures abort whatever operation is running.
/// Timeouts and transient failures may be retried; query failures are data errors
/// and are never retried.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("cannot reach graph store at {uri}: {detail}")]
    Unavailable { uri: String, detail: String },

    #[error("authentication rejected by {uri}: {detail}")]
    AuthenticationRejected { uri: String, detail: String },

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("query rejected: {0}")]
    Query(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable { .. } | StoreError::Timeout(_) | StoreError::Transient(_)
        )
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable { .. } | StoreError::AuthenticationRejected { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("full drop cancelled: confirmation phrase not entered")]
    Declined,

    #[error("confirmation was given for {confirmed}, refusing to drop {target}")]
    ConfirmationMismatch { confirmed: String, target: String },

    #[error("ingest worker failed: {0}")]
    Worker(String),
}

impl SyncError {
    /// Cancellation is a user decision, not a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SyncError::Declined)
    }
}
