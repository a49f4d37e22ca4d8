//! Optimistic concurrency failures raised by the stream writer.
//!
//! Appends may carry an expected version: the stream's version *before* the
//! new events are written. Starts insert a brand-new stream row and fail if
//! the identifier is already taken. Both checks run inside the commit
//! transaction, so a failure leaves the stream untouched.

use thiserror::Error;

use crate::event::StreamId;

/// An append's expected version did not match the stream's current version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(.stream_id, *.expected, *.actual))]
pub struct UnexpectedVersion {
    pub stream_id: StreamId,
    /// The version the caller expected the stream to be at.
    pub expected: i64,
    /// The version found in the store.
    pub actual: i64,
}

/// A start targeted an identifier that already has a stream row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "stream `{id}` already exists (hint: another process started this stream; append to it \
     instead, or tombstone it before reusing the identifier)"
)]
pub struct StreamIdCollision {
    pub id: StreamId,
}

fn format_conflict(stream_id: &StreamId, expected: i64, actual: i64) -> String {
    if actual == 0 {
        format!(
            "concurrency conflict on stream `{stream_id}`: expected version {expected}, but the \
             stream does not exist yet (hint: start the stream first)"
        )
    } else {
        format!(
            "concurrency conflict on stream `{stream_id}`: expected version {expected}, found \
             {actual} (hint: stream was modified; reload and retry)"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_includes_versions_and_hint() {
        let conflict = UnexpectedVersion {
            stream_id: StreamId::from("quest-1"),
            expected: 5,
            actual: 10,
        };
        let msg = conflict.to_string();
        assert!(msg.contains("quest-1"));
        assert!(msg.contains("expected version 5"));
        assert!(msg.contains("found 10"));
        assert!(msg.contains("reload and retry"));
    }

    #[test]
    fn conflict_on_missing_stream_says_so() {
        let conflict = UnexpectedVersion {
            stream_id: StreamId::from("quest-2"),
            expected: 3,
            actual: 0,
        };
        assert!(conflict.to_string().contains("does not exist yet"));
    }

    #[test]
    fn collision_names_the_stream() {
        let collision = StreamIdCollision {
            id: StreamId::from("quest-3"),
        };
        let msg = collision.to_string();
        assert!(msg.contains("`quest-3` already exists"));
    }
}
