//! Stream writer: turns a unit of work into rows inside one transaction.
//!
//! Commit order is fixed: stream actions (in the order they were first
//! queued), then archive/tombstone commands, then inline projections over the
//! freshly written events, then queued document operations. Any failure drops
//! the transaction, so a unit of work is all-or-nothing.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    concurrency::{StreamIdCollision, UnexpectedVersion},
    event::{Event, StreamId},
    options::StoreOptions,
    projection::TransactionContext,
    session::SessionError,
    store::{EventStore, NewStream, StoreTransaction, StreamInsert},
    tracker::{ActionKind, StreamAction, StreamCommand, WorkTracker},
};

/// Outcome of one stream action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedStream {
    pub stream_id: StreamId,
    /// Stream version after the commit.
    pub version: i64,
    /// Sequences assigned to the appended events, in append order.
    pub sequences: Vec<i64>,
}

/// What a successful `save_changes` wrote.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub streams: Vec<CommittedStream>,
}

impl CommitSummary {
    #[must_use]
    pub fn stream(&self, id: &StreamId) -> Option<&CommittedStream> {
        self.streams.iter().find(|s| s.stream_id == *id)
    }

    /// Highest sequence written, or `None` if no events were appended.
    #[must_use]
    pub fn last_sequence(&self) -> Option<i64> {
        self.streams
            .iter()
            .filter_map(|s| s.sequences.last().copied())
            .max()
    }
}

fn count(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

#[tracing::instrument(
    skip(store, options, work),
    fields(
        actions = work.actions().len(),
        events = work.event_count(),
        commands = work.commands().len(),
    )
)]
pub(crate) async fn commit<S: EventStore>(
    store: &S,
    options: &StoreOptions,
    tenant_id: &str,
    work: WorkTracker,
) -> Result<CommitSummary, SessionError<S::Error>> {
    if work.is_empty() {
        return Ok(CommitSummary::default());
    }

    let (actions, commands, operations) = work.into_parts();
    let now = Utc::now();
    let mut tx = store.begin().await.map_err(SessionError::Store)?;
    let mut summary = CommitSummary::default();
    let mut written = Vec::new();

    for action in actions {
        let events = write_action(&mut tx, tenant_id, action, now).await?;
        if let Some(last) = events.last() {
            summary.streams.push(CommittedStream {
                stream_id: last.stream_id.clone(),
                version: last.version,
                sequences: events.iter().map(|e| e.sequence).collect(),
            });
        }
        written.extend(events);
    }

    for command in &commands {
        match command {
            StreamCommand::Archive(id) => {
                tx.archive_stream(tenant_id, id)
                    .await
                    .map_err(SessionError::Store)?;
                tracing::debug!(stream_id = %id, "stream archived");
            }
            StreamCommand::Tombstone(id) => {
                tx.tombstone_stream(tenant_id, id)
                    .await
                    .map_err(SessionError::Store)?;
                tracing::debug!(stream_id = %id, "stream tombstoned");
            }
        }
    }

    if !written.is_empty() && !options.inline.is_empty() {
        let mut ctx = TransactionContext::new(&mut tx);
        for projection in &options.inline {
            tracing::trace!(projection = projection.name(), "applying inline projection");
            projection
                .apply(&mut ctx, &written)
                .await
                .map_err(SessionError::Projection)?;
        }
    }

    for operation in &operations {
        tx.apply(operation).await.map_err(SessionError::Store)?;
    }

    tx.commit().await.map_err(SessionError::Store)?;
    tracing::debug!(events_written = written.len(), "unit of work committed");
    Ok(summary)
}

/// Write one stream action and return its events with sequences assigned.
async fn write_action<T: StoreTransaction>(
    tx: &mut T,
    tenant_id: &str,
    action: StreamAction,
    now: DateTime<Utc>,
) -> Result<Vec<Event>, SessionError<T::Error>> {
    let StreamAction {
        stream_id,
        kind,
        aggregate_type,
        expected_version,
        events: pending,
    } = action;
    let appended = count(pending.len());

    let current = match kind {
        ActionKind::Start => {
            let stream = NewStream {
                id: stream_id.clone(),
                tenant_id: tenant_id.to_owned(),
                aggregate_type,
                version: appended,
                timestamp: now,
            };
            match tx.insert_stream(&stream).await.map_err(SessionError::Store)? {
                StreamInsert::Inserted => 0,
                StreamInsert::AlreadyExists => {
                    return Err(StreamIdCollision { id: stream_id }.into());
                }
            }
        }
        ActionKind::Append => {
            let stream = NewStream {
                id: stream_id.clone(),
                tenant_id: tenant_id.to_owned(),
                aggregate_type,
                version: 0,
                timestamp: now,
            };
            tx.ensure_stream(&stream).await.map_err(SessionError::Store)?;
            let locked = tx
                .lock_stream(tenant_id, &stream_id)
                .await
                .map_err(SessionError::Store)?;
            let (version, is_archived) = locked.map_or((0, false), |l| (l.version, l.is_archived));

            if is_archived {
                return Err(SessionError::StreamArchived(stream_id));
            }
            if let Some(expected) = expected_version
                && expected != version
            {
                return Err(UnexpectedVersion {
                    stream_id,
                    expected,
                    actual: version,
                }
                .into());
            }
            version
        }
    };

    let mut events: Vec<Event> = pending
        .into_iter()
        .zip(1..)
        .map(|(pending, offset)| Event {
            sequence: 0,
            id: pending.id.unwrap_or_else(Uuid::new_v4),
            stream_id: stream_id.clone(),
            version: current + offset,
            alias: pending.alias,
            type_name: pending.type_name,
            data: pending.data,
            timestamp: now,
            tenant_id: tenant_id.to_owned(),
            is_archived: false,
        })
        .collect();

    let sequences = tx.insert_events(&events).await.map_err(SessionError::Store)?;
    for (event, sequence) in events.iter_mut().zip(sequences) {
        event.sequence = sequence;
    }

    if kind == ActionKind::Append {
        tx.update_stream_version(tenant_id, &stream_id, current + appended, now)
            .await
            .map_err(SessionError::Store)?;
    }

    tracing::trace!(
        stream_id = %stream_id,
        from_version = current + 1,
        to_version = current + appended,
        "stream action written"
    );
    Ok(events)
}
