use eventide_core::event::{StreamId, StreamIdentity};

/// Error type for `PostgreSQL` store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Insert returned fewer sequences than events written.
    #[error("database returned {returned} sequences for {expected} inserted events")]
    MissingReturnedSequence { expected: usize, returned: usize },
    /// A stream id of the wrong kind for the store's identity.
    #[error("stream id `{id}` does not match the store identity {expected:?}")]
    IdentityMismatch {
        id: StreamId,
        expected: StreamIdentity,
    },
}
