//! Error types for the reconciliation engine.

use thiserror::Error;

/// Errors that can occur when deriving or parsing an object key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The object has no name.
    #[error("object name cannot be empty")]
    EmptyName,

    /// The namespace segment of a `namespace/name` key is empty.
    #[error("namespace segment cannot be empty in key '{0}'")]
    EmptyNamespace(String),

    /// The key has more than one `/` separator.
    #[error("unexpected key format: '{0}'")]
    InvalidFormat(String),
}

/// Errors reported by a [`Source`](crate::source::Source).
#[derive(Debug, Error)]
pub enum SourceError {
    /// Listing the current resource set failed.
    #[error("list failed: {0}")]
    List(String),

    /// Opening the watch stream failed.
    #[error("watch failed: {0}")]
    Watch(String),

    /// A notification could not be decoded.
    #[error("malformed notification: {0}")]
    Malformed(String),

    /// Any other source failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors returned by a [`Reconciler`](crate::reconciler::Reconciler).
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The resource is already gone; the key is dropped without retry.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Transient failure that should be retried with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent failure; retrying cannot help.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// The reconcile task panicked.
    #[error("reconcile panicked: {0}")]
    Panicked(String),

    /// Any other failure, retried with backoff.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReconcileError {
    /// Returns true if the key should be retried after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Panicked(_) | Self::Other(_)
        )
    }
}

/// Fatal controller errors. Only setup failures end up here; everything in
/// the steady-state loop is recovered locally.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The initial list of the source failed.
    #[error("initial list failed: {0}")]
    InitialList(#[source] SourceError),
}

/// Result alias for reconcile functions.
pub type ReconcileResult<T> = Result<T, ReconcileError>;
