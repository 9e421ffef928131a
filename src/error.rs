//! Error taxonomy for the vector database.
//!
//! Every public operation returns `Result<T, VectorDbError>`. Recoverable
//! kinds (`DimensionMismatch`, `NotFound`, `InvalidArgument`, `Cancelled`,
//! `DeadlineExceeded`) are returned to the caller verbatim; `StorageError`
//! implies the enclosing transaction was rolled back; `Corrupted` is only
//! raised at `open()` time.

use thiserror::Error;

/// The error type returned by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum VectorDbError {
    /// A vector's length does not match the store's dimension and the
    /// active [`crate::dim_adapter::AdaptMode`] is `Strict`.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The store's configured dimension.
        expected: usize,
        /// The length of the vector the caller supplied.
        actual: usize,
    },

    /// An ID, document, or node was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A quantizer operation requires an untrained quantizer but it is
    /// already trained.
    #[error("quantizer already trained")]
    AlreadyTrained,

    /// A quantizer operation (encode/decode) requires a trained quantizer.
    #[error("quantizer not trained")]
    NotTrained,

    /// A caller-supplied parameter is invalid (e.g. dimension not
    /// divisible by the PQ subspace count, K > 256, a negative weight).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The underlying relational engine failed. The active transaction,
    /// if any, has been rolled back.
    #[error("storage error: {0}")]
    StorageError(String),

    /// The caller's cancellation handle was triggered.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline elapsed before the operation could complete
    /// and the caller opted not to accept partial results.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// An on-disk invariant was violated, detected at `open()` time. The
    /// corrupted file is preserved; the caller may rebuild from the
    /// durable rows via [`crate::store::VectorStore::rebuild_from_rows`].
    #[error("corrupted store: {0}")]
    Corrupted(String),

    /// An internal HNSW invariant (bounded out-degree) was violated.
    /// This indicates a bug in the index, not caller misuse, and is
    /// fatal.
    #[error("degree overflow: {0}")]
    DegreeOverflow(String),
}

impl From<diesel::result::Error> for VectorDbError {
    fn from(e: diesel::result::Error) -> Self {
        VectorDbError::StorageError(e.to_string())
    }
}

impl From<diesel::ConnectionError> for VectorDbError {
    fn from(e: diesel::ConnectionError) -> Self {
        VectorDbError::StorageError(e.to_string())
    }
}

impl From<rusqlite::Error> for VectorDbError {
    fn from(e: rusqlite::Error) -> Self {
        VectorDbError::StorageError(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for VectorDbError {
    fn from(e: bincode::error::EncodeError) -> Self {
        VectorDbError::StorageError(format!("bincode encode: {e}"))
    }
}

impl From<bincode::error::DecodeError> for VectorDbError {
    fn from(e: bincode::error::DecodeError) -> Self {
        VectorDbError::Corrupted(format!("bincode decode: {e}"))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VectorDbError>;
