//! Error types for remote bucket operations.

use thiserror::Error;

/// Errors from remote bucket operations.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Object (or the requested generation of it) does not exist.
    #[error("object not found: {name}")]
    NotFound {
        /// Name of the missing object.
        name: String,
    },

    /// A generation precondition did not hold.
    #[error("precondition failed for {name}: required generation {required}, found {found}")]
    Precondition {
        /// Name of the object the precondition applied to.
        name: String,
        /// Generation the caller required. Zero means "must not exist".
        required: i64,
        /// Generation actually present. Zero means the object is absent.
        found: i64,
    },

    /// The in-flight request was canceled.
    #[error("remote request canceled")]
    Canceled,

    /// Transport-level failure.
    #[error("remote transport: {0}")]
    Io(String),
}

impl RemoteError {
    /// True if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }

    /// True if this is a precondition failure.
    pub fn is_precondition(&self) -> bool {
        matches!(self, RemoteError::Precondition { .. })
    }
}
