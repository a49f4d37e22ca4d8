//! Units of work.
//!
//! A [`Session`] queues stream starts, appends, archive/tombstone commands and
//! document writes, then commits all of them atomically with
//! [`save_changes`](Session::save_changes).
//!
//! ```ignore
//! let mut session = repo.session();
//! session.start_stream_for::<QuestParty>(quest_id, [repo.wrap(QuestStarted { .. })?])?;
//! session.append(quest_id, [repo.wrap(MembersJoined { .. })?])?;
//! session.save_changes().await?;
//! ```

use nonempty::NonEmpty;
use serde::Serialize;
use thiserror::Error;

use crate::{
    aggregate::Aggregate,
    concurrency::{StreamIdCollision, UnexpectedVersion},
    event::{PendingEvent, StreamId, StreamIdentity},
    options::{DEFAULT_TENANT, StoreOptions, Tenancy},
    projection::ProjectionError,
    store::{EventStore, StorageOperation},
    tracker::WorkTracker,
    writer::{self, CommitSummary},
};

/// Errors raised while queuing or committing a unit of work.
#[derive(Debug, Error)]
pub enum SessionError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error("stream identifier must not be empty")]
    EmptyStreamId,
    #[error("stream identifier `{id}` does not match the store's {expected:?} identity")]
    IdentityMismatch {
        id: StreamId,
        expected: StreamIdentity,
    },
    #[error("a tenant id is required when the store uses conjoined tenancy")]
    TenantRequired,
    #[error("cannot append an empty event batch to stream `{0}`")]
    EmptyAppend(StreamId),
    #[error(transparent)]
    StreamIdCollision(#[from] StreamIdCollision),
    #[error(transparent)]
    UnexpectedVersion(#[from] UnexpectedVersion),
    #[error("stream `{0}` is archived and cannot be appended to")]
    StreamArchived(StreamId),
    #[error("failed to serialize document: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("inline projection failed: {0}")]
    Projection(#[source] ProjectionError),
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

/// A unit of work against an [`EventStore`].
pub struct Session<'r, S: EventStore> {
    store: &'r S,
    options: &'r StoreOptions,
    tenant_id: Option<String>,
    tracker: WorkTracker,
}

impl<S: EventStore> std::fmt::Debug for Session<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tenant_id", &self.tenant_id)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl<'r, S: EventStore> Session<'r, S> {
    /// Single-tenant stores ignore `tenant_id` and always write as
    /// [`DEFAULT_TENANT`].
    pub(crate) fn new(store: &'r S, options: &'r StoreOptions, tenant_id: Option<String>) -> Self {
        let tenant_id = match options.tenancy {
            Tenancy::Single => Some(DEFAULT_TENANT.to_owned()),
            Tenancy::Conjoined => tenant_id,
        };
        Self {
            store,
            options,
            tenant_id,
            tracker: WorkTracker::new(),
        }
    }

    /// Tenant this session writes as.
    #[must_use]
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Work queued so far.
    #[must_use]
    pub const fn pending(&self) -> &WorkTracker {
        &self.tracker
    }

    fn check_id(&self, id: &StreamId) -> Result<(), SessionError<S::Error>> {
        if id.is_empty() {
            return Err(SessionError::EmptyStreamId);
        }
        let expected = self.options.identity;
        if id.identity() != expected {
            return Err(SessionError::IdentityMismatch {
                id: id.clone(),
                expected,
            });
        }
        Ok(())
    }

    fn batch<I>(id: &StreamId, events: I) -> Result<NonEmpty<PendingEvent>, SessionError<S::Error>>
    where
        I: IntoIterator<Item = PendingEvent>,
    {
        NonEmpty::collect(events).ok_or_else(|| SessionError::EmptyAppend(id.clone()))
    }

    /// Queue a new stream. Commit fails with a collision if the identifier is
    /// already in use.
    ///
    /// # Errors
    ///
    /// Fails immediately on an empty or wrongly-typed identifier or an empty
    /// batch.
    pub fn start_stream<I>(
        &mut self,
        id: impl Into<StreamId>,
        events: I,
    ) -> Result<(), SessionError<S::Error>>
    where
        I: IntoIterator<Item = PendingEvent>,
    {
        let id = id.into();
        self.check_id(&id)?;
        let events = Self::batch(&id, events)?;
        self.tracker.start(id, None, events);
        Ok(())
    }

    /// Queue a new stream tagged with aggregate type `A`.
    ///
    /// # Errors
    ///
    /// See [`start_stream`](Self::start_stream).
    pub fn start_stream_for<A: Aggregate>(
        &mut self,
        id: impl Into<StreamId>,
        events: impl IntoIterator<Item = PendingEvent>,
    ) -> Result<(), SessionError<S::Error>> {
        let id = id.into();
        self.check_id(&id)?;
        let events = Self::batch(&id, events)?;
        self.tracker.start(id, Some(A::KIND.to_owned()), events);
        Ok(())
    }

    /// Queue an append. A missing stream is created at version 0.
    ///
    /// # Errors
    ///
    /// Fails immediately on an empty or wrongly-typed identifier or an empty
    /// batch.
    pub fn append(
        &mut self,
        id: impl Into<StreamId>,
        events: impl IntoIterator<Item = PendingEvent>,
    ) -> Result<(), SessionError<S::Error>> {
        let id = id.into();
        self.check_id(&id)?;
        let events = Self::batch(&id, events)?;
        self.tracker.append(id, None, events);
        Ok(())
    }

    /// Queue an append that requires the stream to be at `expected` *before*
    /// these events are added.
    ///
    /// # Errors
    ///
    /// See [`append`](Self::append).
    pub fn append_expected(
        &mut self,
        id: impl Into<StreamId>,
        expected: i64,
        events: impl IntoIterator<Item = PendingEvent>,
    ) -> Result<(), SessionError<S::Error>> {
        let id = id.into();
        self.check_id(&id)?;
        let events = Self::batch(&id, events)?;
        self.tracker.append(id, Some(expected), events);
        Ok(())
    }

    /// Queue archiving: the stream and its events stay stored but are skipped
    /// by async projections, and further appends are rejected.
    ///
    /// # Errors
    ///
    /// Fails immediately on an empty or wrongly-typed identifier.
    pub fn archive_stream(&mut self, id: impl Into<StreamId>) -> Result<(), SessionError<S::Error>> {
        let id = id.into();
        self.check_id(&id)?;
        self.tracker.archive(id);
        Ok(())
    }

    /// Queue a hard delete of the stream and all of its events. The
    /// identifier can be started again afterwards.
    ///
    /// # Errors
    ///
    /// Fails immediately on an empty or wrongly-typed identifier.
    pub fn tombstone_stream(&mut self, id: impl Into<StreamId>) -> Result<(), SessionError<S::Error>> {
        let id = id.into();
        self.check_id(&id)?;
        self.tracker.tombstone(id);
        Ok(())
    }

    /// Queue an upsert of a document.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Serialization`] if `document` cannot be
    /// serialized.
    pub fn store_document<T: Serialize>(
        &mut self,
        kind: &str,
        id: &str,
        document: &T,
    ) -> Result<(), SessionError<S::Error>> {
        let data = serde_json::to_value(document).map_err(SessionError::Serialization)?;
        self.tracker.queue(StorageOperation::UpsertDocument {
            tenant_id: self.write_tenant().to_owned(),
            kind: kind.to_owned(),
            id: id.to_owned(),
            data,
        });
        Ok(())
    }

    pub fn delete_document(&mut self, kind: &str, id: &str) {
        self.tracker.queue(StorageOperation::DeleteDocument {
            tenant_id: self.write_tenant().to_owned(),
            kind: kind.to_owned(),
            id: id.to_owned(),
        });
    }

    fn write_tenant(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or(DEFAULT_TENANT)
    }

    /// Commit every queued change in one transaction.
    ///
    /// Once the commit is attempted the queued work is consumed, whether or
    /// not it succeeds. A missing tenant is reported before that point and
    /// leaves the queue intact.
    ///
    /// # Errors
    ///
    /// Returns the first failure; nothing from the unit of work is persisted
    /// in that case.
    pub async fn save_changes(&mut self) -> Result<CommitSummary, SessionError<S::Error>> {
        if self.tracker.is_empty() {
            return Ok(CommitSummary::default());
        }
        let Some(tenant_id) = self.tenant_id.as_deref() else {
            return Err(SessionError::TenantRequired);
        };
        let work = std::mem::take(&mut self.tracker);
        writer::commit(self.store, self.options, tenant_id, work).await
    }
}
