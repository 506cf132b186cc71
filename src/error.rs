use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced to the dispatch caller.
///
/// Soft outcomes (already sent, delay active, exhausted) are *not* errors;
/// they are [`crate::DispatchOutcome::Skipped`] variants. An error here means
/// the request itself was bad, a dependency failed, or the store was
/// unreachable at claim time.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Client-caused, 400-class. Every violation is listed; the outcome was
    /// recorded before this was raised.
    #[error("validation failed: {}", .errors.join(", "))]
    Validation { errors: Vec<String> },

    /// Dependency-caused, 500-class. The failure outcome was recorded before
    /// this was raised.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The store was unreachable during the claim. The send did not proceed.
    #[error("storage failure during claim: {0}")]
    Storage(#[from] StorageError),
}

/// Failure of the backing store.
///
/// Fatal during a claim; swallowed and logged during outcome recording.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for StorageError {
    fn from(err: tokio_postgres::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
