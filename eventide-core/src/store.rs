//! Persistence layer abstractions.
//!
//! This module describes the storage contract ([`EventStore`] and
//! [`StoreTransaction`]), the row shapes exchanged with a backend, and a
//! reference in-memory implementation. Every write path in the crate (stream
//! writer, inline projections, projection daemon) goes through a
//! [`StoreTransaction`]; dropping one without calling
//! [`commit`](StoreTransaction::commit) rolls it back.
use std::future::Future;

use chrono::{DateTime, Utc};

use crate::event::{Event, StreamId};

pub mod inmemory;

/// Name of the `event_progression` row that holds the high-water mark.
pub const HIGH_WATER_MARK: &str = "HighWaterMark";

/// Current state of a stream row.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamState {
    pub id: StreamId,
    pub tenant_id: String,
    /// Current version: the number of events appended to the stream.
    pub version: i64,
    /// Aggregate type name recorded when the stream was started.
    pub aggregate_type: Option<String>,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub is_archived: bool,
    /// Version of the stored snapshot, if any.
    pub snapshot_version: Option<i64>,
}

/// Version and timestamp bounds for reading a single stream.
///
/// All bounds are inclusive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamRange {
    pub from_version: Option<i64>,
    pub to_version: Option<i64>,
    pub before: Option<DateTime<Utc>>,
}

impl StreamRange {
    /// The whole stream.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn from_version(mut self, version: i64) -> Self {
        self.from_version = Some(version);
        self
    }

    #[must_use]
    pub const fn to_version(mut self, version: i64) -> Self {
        self.to_version = Some(version);
        self
    }

    #[must_use]
    pub const fn before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.before = Some(timestamp);
        self
    }

    #[must_use]
    pub fn contains(&self, event: &Event) -> bool {
        self.from_version.is_none_or(|from| event.version >= from)
            && self.to_version.is_none_or(|to| event.version <= to)
            && self.before.is_none_or(|before| event.timestamp <= before)
    }
}

/// A serialized aggregate snapshot stored on the stream row.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    /// Stream version the snapshot reflects.
    pub version: i64,
    pub data: serde_json::Value,
}

/// Stream row to insert when starting (or implicitly creating) a stream.
#[derive(Clone, Debug, PartialEq)]
pub struct NewStream {
    pub id: StreamId,
    pub tenant_id: String,
    pub aggregate_type: Option<String>,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of [`StoreTransaction::insert_stream`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamInsert {
    Inserted,
    /// A row with the same tenant and identifier already exists.
    AlreadyExists,
}

/// Stream row locked for the remainder of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockedStream {
    pub version: i64,
    pub is_archived: bool,
}

/// Event selection applied by the event loader.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Restrict to these event aliases; `None` selects every type.
    pub aliases: Option<Vec<String>>,
    /// Include events of archived streams.
    pub include_archived: bool,
}

impl EventFilter {
    /// Every non-archived event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to the given aliases.
    #[must_use]
    pub fn for_aliases<I, A>(aliases: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            aliases: Some(aliases.into_iter().map(Into::into).collect()),
            include_archived: false,
        }
    }

    #[must_use]
    pub const fn including_archived(mut self) -> Self {
        self.include_archived = true;
        self
    }

    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        (self.include_archived || !event.is_archived)
            && self
                .aliases
                .as_ref()
                .is_none_or(|aliases| aliases.iter().any(|alias| *alias == event.alias))
    }
}

/// A deferred document or snapshot write produced by the write path or by a
/// projection.
#[derive(Clone, Debug, PartialEq)]
pub enum StorageOperation {
    UpsertDocument {
        tenant_id: String,
        kind: String,
        id: String,
        data: serde_json::Value,
    },
    DeleteDocument {
        tenant_id: String,
        kind: String,
        id: String,
    },
    StoreSnapshot {
        tenant_id: String,
        stream_id: StreamId,
        version: i64,
        data: serde_json::Value,
    },
    DeleteSnapshot {
        tenant_id: String,
        stream_id: StreamId,
    },
}

/// Per-shard progress row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardProgress {
    pub name: String,
    /// Last sequence fully processed by the shard.
    pub sequence: i64,
    pub last_updated: DateTime<Utc>,
}

/// The persisted high-water mark row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HighWaterRow {
    pub mark: i64,
    pub highest_sequence: i64,
    /// When the mark last advanced, or last had nothing to wait for.
    pub last_updated: DateTime<Utc>,
}

/// Read side of a storage backend and factory for write transactions.
///
/// Reads outside a transaction see committed data only.
pub trait EventStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;
    type Transaction: StoreTransaction<Error = Self::Error>;

    /// Begin a write transaction.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, Self::Error>> + Send;

    fn fetch_stream_state<'a>(
        &'a self,
        tenant_id: &'a str,
        id: &'a StreamId,
    ) -> impl Future<Output = Result<Option<StreamState>, Self::Error>> + Send + 'a;

    /// Events of one stream within `range`, in version order.
    fn fetch_stream<'a>(
        &'a self,
        tenant_id: &'a str,
        id: &'a StreamId,
        range: &'a StreamRange,
    ) -> impl Future<Output = Result<Vec<Event>, Self::Error>> + Send + 'a;

    fn load_snapshot<'a>(
        &'a self,
        tenant_id: &'a str,
        id: &'a StreamId,
    ) -> impl Future<Output = Result<Option<Snapshot>, Self::Error>> + Send + 'a;

    fn load_document<'a>(
        &'a self,
        tenant_id: &'a str,
        kind: &'a str,
        id: &'a str,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, Self::Error>> + Send + 'a;

    /// Highest committed sequence, or 0 for an empty store.
    fn highest_sequence(&self) -> impl Future<Output = Result<i64, Self::Error>> + Send;

    /// Committed sequences strictly greater than `after`, ascending, at most
    /// `limit` of them.
    fn sequences_after(
        &self,
        after: i64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<i64>, Self::Error>> + Send;

    /// Events with `floor < sequence <= ceiling` matching `filter`, ascending,
    /// at most `limit` of them.
    fn load_events_between<'a>(
        &'a self,
        floor: i64,
        ceiling: i64,
        limit: usize,
        filter: &'a EventFilter,
    ) -> impl Future<Output = Result<Vec<Event>, Self::Error>> + Send + 'a;

    fn fetch_progress<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Future<Output = Result<Option<ShardProgress>, Self::Error>> + Send + 'a;

    /// Progress of every shard, excluding the high-water mark row.
    fn all_progress(&self) -> impl Future<Output = Result<Vec<ShardProgress>, Self::Error>> + Send;

    /// Overwrite a shard's progress without any floor check.
    fn rewind_progress<'a>(
        &'a self,
        name: &'a str,
        sequence: i64,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    fn fetch_high_water(
        &self,
    ) -> impl Future<Output = Result<Option<HighWaterRow>, Self::Error>> + Send;

    /// Persist a detected mark and return the resulting row.
    ///
    /// The stored mark never decreases. `last_updated` is set to `at` when the
    /// row is created, when the mark advances, or when the previous row had no
    /// gap; while the mark is stuck behind a gap it keeps the time the stall
    /// began.
    fn save_high_water(
        &self,
        mark: i64,
        highest_sequence: i64,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<HighWaterRow, Self::Error>> + Send;
}

/// A write transaction against a storage backend.
///
/// Dropping a transaction without committing rolls back every change made
/// through it. Sequences handed out by [`insert_events`](Self::insert_events)
/// are not reused after a rollback.
pub trait StoreTransaction: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Insert a new stream row unless one already exists.
    fn insert_stream<'a>(
        &'a mut self,
        stream: &'a NewStream,
    ) -> impl Future<Output = Result<StreamInsert, Self::Error>> + Send + 'a;

    /// Insert a stream row if missing; an existing row is left untouched.
    fn ensure_stream<'a>(
        &'a mut self,
        stream: &'a NewStream,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Lock the stream row for the rest of the transaction.
    fn lock_stream<'a>(
        &'a mut self,
        tenant_id: &'a str,
        id: &'a StreamId,
    ) -> impl Future<Output = Result<Option<LockedStream>, Self::Error>> + Send + 'a;

    fn update_stream_version<'a>(
        &'a mut self,
        tenant_id: &'a str,
        id: &'a StreamId,
        version: i64,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Insert events and return their assigned sequences, in input order.
    ///
    /// The `sequence` field of the input is ignored.
    fn insert_events<'a>(
        &'a mut self,
        events: &'a [Event],
    ) -> impl Future<Output = Result<Vec<i64>, Self::Error>> + Send + 'a;

    /// Mark the stream and all of its events archived.
    fn archive_stream<'a>(
        &'a mut self,
        tenant_id: &'a str,
        id: &'a StreamId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Hard-delete the stream row and all of its events.
    fn tombstone_stream<'a>(
        &'a mut self,
        tenant_id: &'a str,
        id: &'a StreamId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    fn load_snapshot<'a>(
        &'a mut self,
        tenant_id: &'a str,
        id: &'a StreamId,
    ) -> impl Future<Output = Result<Option<Snapshot>, Self::Error>> + Send + 'a;

    fn load_document<'a>(
        &'a mut self,
        tenant_id: &'a str,
        kind: &'a str,
        id: &'a str,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, Self::Error>> + Send + 'a;

    fn apply<'a>(
        &'a mut self,
        operation: &'a StorageOperation,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Create a shard's progress row. Returns `false` if it already exists.
    fn insert_progress<'a>(
        &'a mut self,
        name: &'a str,
        sequence: i64,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

    /// Move a shard's progress from `floor` to `ceiling`.
    ///
    /// Returns `false` if the stored value is no longer `floor`.
    fn update_progress<'a>(
        &'a mut self,
        name: &'a str,
        floor: i64,
        ceiling: i64,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

    fn commit(self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use uuid::Uuid;

    use super::*;

    fn event(version: i64, alias: &str, archived: bool) -> Event {
        Event {
            sequence: version,
            id: Uuid::new_v4(),
            stream_id: StreamId::from("s"),
            version,
            alias: alias.to_owned(),
            type_name: alias.to_owned(),
            data: serde_json::Value::Null,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + chrono::TimeDelta::minutes(version),
            tenant_id: "*DEFAULT*".to_owned(),
            is_archived: archived,
        }
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let range = StreamRange::all().from_version(2).to_version(3);
        assert!(!range.contains(&event(1, "a", false)));
        assert!(range.contains(&event(2, "a", false)));
        assert!(range.contains(&event(3, "a", false)));
        assert!(!range.contains(&event(4, "a", false)));

        let cutoff = event(2, "a", false).timestamp;
        let range = StreamRange::all().before(cutoff);
        assert!(range.contains(&event(2, "a", false)));
        assert!(!range.contains(&event(3, "a", false)));
    }

    #[test]
    fn filter_excludes_archived_unless_asked() {
        let archived = event(1, "a", true);
        assert!(!EventFilter::all().matches(&archived));
        assert!(EventFilter::all().including_archived().matches(&archived));
    }

    #[test]
    fn filter_restricts_aliases() {
        let filter = EventFilter::for_aliases(["quest_started"]);
        assert!(filter.matches(&event(1, "quest_started", false)));
        assert!(!filter.matches(&event(1, "quest_ended", false)));
    }
}
