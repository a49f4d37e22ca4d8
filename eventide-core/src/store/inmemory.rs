//! In-memory event store implementation for testing.
//!
//! This module provides [`Store`], a thread-safe in-memory implementation of
//! [`EventStore`](super::EventStore) suitable for unit tests and examples.
//!
//! A [`Transaction`] holds the store's lock from `begin` until it is committed
//! or dropped, so transactions are fully serialized. Sequences are drawn from
//! a counter outside the transactional state: a rolled-back transaction leaves
//! a permanent gap, exactly like a database sequence would.
//!
//! # Example
//!
//! ```
//! use eventide_core::store::inmemory;
//!
//! let store = inmemory::Store::new();
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    event::{Event, StreamId},
    store::{
        EventFilter, EventStore, HIGH_WATER_MARK, HighWaterRow, LockedStream, NewStream,
        ShardProgress, Snapshot, StorageOperation, StoreTransaction, StreamInsert, StreamRange,
        StreamState,
    },
};

/// Key identifying a stream row: streams are unique per tenant.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct StreamKey {
    tenant_id: String,
    id: StreamId,
}

impl StreamKey {
    fn new(tenant_id: &str, id: &StreamId) -> Self {
        Self {
            tenant_id: tenant_id.to_owned(),
            id: id.clone(),
        }
    }
}

#[derive(Clone, Debug)]
struct StreamRow {
    state: StreamState,
    snapshot: Option<Snapshot>,
}

#[derive(Clone, Copy, Debug)]
struct ProgressionRow {
    last_seq_id: i64,
    highest_seq_id: Option<i64>,
    last_updated: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
struct State {
    streams: HashMap<StreamKey, StreamRow>,
    events: BTreeMap<i64, Event>,
    documents: HashMap<(String, String, String), serde_json::Value>,
    progression: HashMap<String, ProgressionRow>,
}

impl State {
    fn stream_events(&self, tenant_id: &str, id: &StreamId) -> impl Iterator<Item = &Event> {
        self.events
            .values()
            .filter(move |e| e.tenant_id == tenant_id && e.stream_id == *id)
    }

    fn snapshot(&self, tenant_id: &str, id: &StreamId) -> Option<Snapshot> {
        self.streams
            .get(&StreamKey::new(tenant_id, id))
            .and_then(|row| row.snapshot.clone())
    }

    fn document(&self, tenant_id: &str, kind: &str, id: &str) -> Option<serde_json::Value> {
        self.documents
            .get(&(tenant_id.to_owned(), kind.to_owned(), id.to_owned()))
            .cloned()
    }
}

/// In-memory event store.
#[derive(Clone, Debug, Default)]
pub struct Store {
    state: Arc<Mutex<State>>,
    sequence: Arc<AtomicI64>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete committed event rows outright, leaving holes in the sequence.
    ///
    /// Simulates transactions that reserved sequences but never committed.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn remove_events(&self, sequences: &[i64]) {
        let mut state = self.state.lock().await;
        for sequence in sequences {
            state.events.remove(sequence);
        }
    }

    /// Force the high-water mark row's `last_updated`, to age it in tests.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn set_high_water_updated(&self, at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        if let Some(row) = state.progression.get_mut(HIGH_WATER_MARK) {
            row.last_updated = at;
        }
    }
}

/// Error type for in-memory store.
///
/// The in-memory backend cannot fail today; the type exists so that generic
/// code is exercised against a real `Error` associated type.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    #[error("stream `{0}` not found")]
    StreamNotFound(StreamId),
}

impl EventStore for Store {
    type Error = InMemoryError;
    type Transaction = Transaction;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let staged = guard.clone();
        Ok(Transaction {
            guard,
            staged,
            sequence: Arc::clone(&self.sequence),
        })
    }

    async fn fetch_stream_state<'a>(
        &'a self,
        tenant_id: &'a str,
        id: &'a StreamId,
    ) -> Result<Option<StreamState>, Self::Error> {
        let state = self.state.lock().await;
        Ok(state.streams.get(&StreamKey::new(tenant_id, id)).map(|row| {
            let mut stream = row.state.clone();
            stream.snapshot_version = row.snapshot.as_ref().map(|s| s.version);
            stream
        }))
    }

    #[tracing::instrument(skip(self, id, range), fields(stream_id = %id))]
    async fn fetch_stream<'a>(
        &'a self,
        tenant_id: &'a str,
        id: &'a StreamId,
        range: &'a StreamRange,
    ) -> Result<Vec<Event>, Self::Error> {
        let state = self.state.lock().await;
        let mut events: Vec<Event> = state
            .stream_events(tenant_id, id)
            .filter(|e| range.contains(e))
            .cloned()
            .collect();
        drop(state);
        events.sort_by_key(|e| e.version);
        tracing::trace!(events_loaded = events.len(), "loaded stream");
        Ok(events)
    }

    async fn load_snapshot<'a>(
        &'a self,
        tenant_id: &'a str,
        id: &'a StreamId,
    ) -> Result<Option<Snapshot>, Self::Error> {
        Ok(self.state.lock().await.snapshot(tenant_id, id))
    }

    async fn load_document<'a>(
        &'a self,
        tenant_id: &'a str,
        kind: &'a str,
        id: &'a str,
    ) -> Result<Option<serde_json::Value>, Self::Error> {
        Ok(self.state.lock().await.document(tenant_id, kind, id))
    }

    async fn highest_sequence(&self) -> Result<i64, Self::Error> {
        let state = self.state.lock().await;
        Ok(state.events.last_key_value().map_or(0, |(seq, _)| *seq))
    }

    async fn sequences_after(&self, after: i64, limit: usize) -> Result<Vec<i64>, Self::Error> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(seq, _)| *seq)
            .collect())
    }

    async fn load_events_between<'a>(
        &'a self,
        floor: i64,
        ceiling: i64,
        limit: usize,
        filter: &'a EventFilter,
    ) -> Result<Vec<Event>, Self::Error> {
        if ceiling <= floor {
            return Ok(Vec::new());
        }
        let state = self.state.lock().await;
        Ok(state
            .events
            .range(floor + 1..=ceiling)
            .map(|(_, e)| e)
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn fetch_progress<'a>(
        &'a self,
        name: &'a str,
    ) -> Result<Option<ShardProgress>, Self::Error> {
        let state = self.state.lock().await;
        Ok(state.progression.get(name).map(|row| ShardProgress {
            name: name.to_owned(),
            sequence: row.last_seq_id,
            last_updated: row.last_updated,
        }))
    }

    async fn all_progress(&self) -> Result<Vec<ShardProgress>, Self::Error> {
        let state = self.state.lock().await;
        let mut progress: Vec<ShardProgress> = state
            .progression
            .iter()
            .filter(|(name, _)| name.as_str() != HIGH_WATER_MARK)
            .map(|(name, row)| ShardProgress {
                name: name.clone(),
                sequence: row.last_seq_id,
                last_updated: row.last_updated,
            })
            .collect();
        progress.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(progress)
    }

    async fn rewind_progress<'a>(&'a self, name: &'a str, sequence: i64) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        state.progression.insert(
            name.to_owned(),
            ProgressionRow {
                last_seq_id: sequence,
                highest_seq_id: None,
                last_updated: Utc::now(),
            },
        );
        Ok(())
    }

    async fn fetch_high_water(&self) -> Result<Option<HighWaterRow>, Self::Error> {
        let state = self.state.lock().await;
        Ok(state.progression.get(HIGH_WATER_MARK).map(|row| HighWaterRow {
            mark: row.last_seq_id,
            highest_sequence: row.highest_seq_id.unwrap_or_default(),
            last_updated: row.last_updated,
        }))
    }

    async fn save_high_water(
        &self,
        mark: i64,
        highest_sequence: i64,
        at: DateTime<Utc>,
    ) -> Result<HighWaterRow, Self::Error> {
        let mut state = self.state.lock().await;
        let row = state
            .progression
            .entry(HIGH_WATER_MARK.to_owned())
            .and_modify(|row| {
                let caught_up = row.highest_seq_id.unwrap_or_default() <= row.last_seq_id;
                if mark > row.last_seq_id || caught_up {
                    row.last_updated = at;
                }
                row.last_seq_id = row.last_seq_id.max(mark);
                row.highest_seq_id = Some(highest_sequence);
            })
            .or_insert(ProgressionRow {
                last_seq_id: mark,
                highest_seq_id: Some(highest_sequence),
                last_updated: at,
            });
        Ok(HighWaterRow {
            mark: row.last_seq_id,
            highest_sequence,
            last_updated: row.last_updated,
        })
    }
}

/// Write transaction over the in-memory store.
///
/// Holds the store lock and a staged copy of the state; the copy replaces the
/// committed state on [`commit`](StoreTransaction::commit).
pub struct Transaction {
    guard: OwnedMutexGuard<State>,
    staged: State,
    sequence: Arc<AtomicI64>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("staged_events", &self.staged.events.len())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    fn stream_mut(&mut self, tenant_id: &str, id: &StreamId) -> Result<&mut StreamRow, InMemoryError> {
        self.staged
            .streams
            .get_mut(&StreamKey::new(tenant_id, id))
            .ok_or_else(|| InMemoryError::StreamNotFound(id.clone()))
    }

    fn insert_row(&mut self, stream: &NewStream) {
        self.staged.streams.insert(
            StreamKey::new(&stream.tenant_id, &stream.id),
            StreamRow {
                state: StreamState {
                    id: stream.id.clone(),
                    tenant_id: stream.tenant_id.clone(),
                    version: stream.version,
                    aggregate_type: stream.aggregate_type.clone(),
                    created: stream.timestamp,
                    last_updated: stream.timestamp,
                    is_archived: false,
                    snapshot_version: None,
                },
                snapshot: None,
            },
        );
    }
}

impl StoreTransaction for Transaction {
    type Error = InMemoryError;

    async fn insert_stream<'a>(&'a mut self, stream: &'a NewStream) -> Result<StreamInsert, Self::Error> {
        let key = StreamKey::new(&stream.tenant_id, &stream.id);
        if self.staged.streams.contains_key(&key) {
            return Ok(StreamInsert::AlreadyExists);
        }
        self.insert_row(stream);
        Ok(StreamInsert::Inserted)
    }

    async fn ensure_stream<'a>(&'a mut self, stream: &'a NewStream) -> Result<(), Self::Error> {
        let key = StreamKey::new(&stream.tenant_id, &stream.id);
        if !self.staged.streams.contains_key(&key) {
            self.insert_row(stream);
        }
        Ok(())
    }

    async fn lock_stream<'a>(
        &'a mut self,
        tenant_id: &'a str,
        id: &'a StreamId,
    ) -> Result<Option<LockedStream>, Self::Error> {
        Ok(self
            .staged
            .streams
            .get(&StreamKey::new(tenant_id, id))
            .map(|row| LockedStream {
                version: row.state.version,
                is_archived: row.state.is_archived,
            }))
    }

    async fn update_stream_version<'a>(
        &'a mut self,
        tenant_id: &'a str,
        id: &'a StreamId,
        version: i64,
        at: DateTime<Utc>,
    ) -> Result<(), Self::Error> {
        let row = self.stream_mut(tenant_id, id)?;
        row.state.version = version;
        row.state.last_updated = at;
        Ok(())
    }

    async fn insert_events<'a>(&'a mut self, events: &'a [Event]) -> Result<Vec<i64>, Self::Error> {
        let mut sequences = Vec::with_capacity(events.len());
        for event in events {
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let mut stored = event.clone();
            stored.sequence = sequence;
            self.staged.events.insert(sequence, stored);
            sequences.push(sequence);
        }
        Ok(sequences)
    }

    async fn archive_stream<'a>(&'a mut self, tenant_id: &'a str, id: &'a StreamId) -> Result<(), Self::Error> {
        if let Some(row) = self.staged.streams.get_mut(&StreamKey::new(tenant_id, id)) {
            row.state.is_archived = true;
        }
        for event in self.staged.events.values_mut() {
            if event.tenant_id == tenant_id && event.stream_id == *id {
                event.is_archived = true;
            }
        }
        Ok(())
    }

    async fn tombstone_stream<'a>(&'a mut self, tenant_id: &'a str, id: &'a StreamId) -> Result<(), Self::Error> {
        self.staged.streams.remove(&StreamKey::new(tenant_id, id));
        self.staged
            .events
            .retain(|_, e| !(e.tenant_id == tenant_id && e.stream_id == *id));
        Ok(())
    }

    async fn load_snapshot<'a>(
        &'a mut self,
        tenant_id: &'a str,
        id: &'a StreamId,
    ) -> Result<Option<Snapshot>, Self::Error> {
        Ok(self.staged.snapshot(tenant_id, id))
    }

    async fn load_document<'a>(
        &'a mut self,
        tenant_id: &'a str,
        kind: &'a str,
        id: &'a str,
    ) -> Result<Option<serde_json::Value>, Self::Error> {
        Ok(self.staged.document(tenant_id, kind, id))
    }

    async fn apply<'a>(&'a mut self, operation: &'a StorageOperation) -> Result<(), Self::Error> {
        match operation {
            StorageOperation::UpsertDocument {
                tenant_id,
                kind,
                id,
                data,
            } => {
                self.staged
                    .documents
                    .insert((tenant_id.clone(), kind.clone(), id.clone()), data.clone());
            }
            StorageOperation::DeleteDocument {
                tenant_id,
                kind,
                id,
            } => {
                self.staged
                    .documents
                    .remove(&(tenant_id.clone(), kind.clone(), id.clone()));
            }
            StorageOperation::StoreSnapshot {
                tenant_id,
                stream_id,
                version,
                data,
            } => {
                // a stream tombstoned before an async shard reached it
                // has nowhere to hold a snapshot
                if let Some(row) = self
                    .staged
                    .streams
                    .get_mut(&StreamKey::new(tenant_id, stream_id))
                {
                    row.snapshot = Some(Snapshot {
                        version: *version,
                        data: data.clone(),
                    });
                }
            }
            StorageOperation::DeleteSnapshot {
                tenant_id,
                stream_id,
            } => {
                if let Some(row) = self
                    .staged
                    .streams
                    .get_mut(&StreamKey::new(tenant_id, stream_id))
                {
                    row.snapshot = None;
                }
            }
        }
        Ok(())
    }

    async fn insert_progress<'a>(&'a mut self, name: &'a str, sequence: i64) -> Result<bool, Self::Error> {
        if self.staged.progression.contains_key(name) {
            return Ok(false);
        }
        self.staged.progression.insert(
            name.to_owned(),
            ProgressionRow {
                last_seq_id: sequence,
                highest_seq_id: None,
                last_updated: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn update_progress<'a>(
        &'a mut self,
        name: &'a str,
        floor: i64,
        ceiling: i64,
    ) -> Result<bool, Self::Error> {
        match self.staged.progression.get_mut(name) {
            Some(row) if row.last_seq_id == floor => {
                row.last_seq_id = ceiling;
                row.last_updated = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn commit(mut self) -> Result<(), Self::Error> {
        *self.guard = self.staged;
        tracing::trace!("in-memory transaction committed");
        Ok(())
    }
}
