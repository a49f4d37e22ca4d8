//! Entry point tying a backend to its configuration.
//!
//! A [`Repository`] owns the [`EventStore`] and the [`StoreOptions`]. It opens
//! write [`Session`]s, read-only [`QuerySession`]s and builds the
//! [`ProjectionDaemon`] for async projections.
//!
//! Aggregation is read-only: [`QuerySession::aggregate_stream`] folds events on
//! demand, using the stored snapshot when the request allows it, and never
//! writes anything back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    aggregate::{Aggregate, Aggregation},
    daemon::{DaemonSettings, ProjectionDaemon},
    event::{DecodeError, Event, PendingEvent, StreamId, UnknownEventType},
    options::{DEFAULT_TENANT, StoreOptions, Tenancy},
    session::Session,
    store::{EventStore, StreamRange, StreamState},
};

/// Errors raised on the read path.
#[derive(Debug, Error)]
pub enum ReadError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error(transparent)]
    UnknownEventType(#[from] UnknownEventType),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("failed to deserialize stored state: {0}")]
    Deserialization(#[source] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

/// Knobs for [`QuerySession::aggregate_stream`].
#[derive(Clone, Debug)]
pub struct AggregateOptions<A> {
    /// Fold only events up to and including this version.
    pub max_version: Option<i64>,
    /// Fold only events with a timestamp at or before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Start from this state instead of an empty one.
    pub seed: Option<A>,
    /// Fold only events from this version on.
    pub from_version: Option<i64>,
}

impl<A> Default for AggregateOptions<A> {
    fn default() -> Self {
        Self {
            max_version: None,
            before: None,
            seed: None,
            from_version: None,
        }
    }
}

impl<A> AggregateOptions<A> {
    #[must_use]
    pub const fn max_version(mut self, version: i64) -> Self {
        self.max_version = Some(version);
        self
    }

    #[must_use]
    pub const fn before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.before = Some(timestamp);
        self
    }

    #[must_use]
    pub fn seed(mut self, state: A) -> Self {
        self.seed = Some(state);
        self
    }

    #[must_use]
    pub const fn from_version(mut self, version: i64) -> Self {
        self.from_version = Some(version);
        self
    }

    /// The stored snapshot may only stand in for a plain "latest up to
    /// version" read.
    const fn allows_snapshot(&self) -> bool {
        self.seed.is_none() && self.from_version.is_none() && self.before.is_none()
    }
}

/// Backend plus configuration.
pub struct Repository<S> {
    store: Arc<S>,
    options: Arc<StoreOptions>,
}

impl<S> Clone for Repository<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            options: Arc::clone(&self.options),
        }
    }
}

impl<S> std::fmt::Debug for Repository<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<S: EventStore> Repository<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_options(store, StoreOptions::default())
    }

    #[must_use]
    pub fn with_options(store: S, options: StoreOptions) -> Self {
        Self {
            store: Arc::new(store),
            options: Arc::new(options),
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Wrap a payload as a pending event, registering its type.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the payload cannot be converted to JSON.
    pub fn wrap<E: Serialize + 'static>(&self, payload: E) -> Result<PendingEvent, serde_json::Error> {
        self.options.events.wrap(payload)
    }

    /// Open a unit of work for the default tenant.
    #[must_use]
    pub fn session(&self) -> Session<'_, S> {
        Session::new(&self.store, &self.options, None)
    }

    /// Open a unit of work writing as `tenant_id`.
    #[must_use]
    pub fn session_for_tenant(&self, tenant_id: impl Into<String>) -> Session<'_, S> {
        Session::new(&self.store, &self.options, Some(tenant_id.into()))
    }

    /// Open a read-only view for the default tenant.
    #[must_use]
    pub fn query(&self) -> QuerySession<'_, S> {
        self.query_for_tenant(DEFAULT_TENANT)
    }

    /// Open a read-only view of one tenant's data. Single-tenant stores
    /// ignore `tenant_id`.
    #[must_use]
    pub fn query_for_tenant(&self, tenant_id: impl Into<String>) -> QuerySession<'_, S> {
        let tenant_id = match self.options.tenancy {
            Tenancy::Single => DEFAULT_TENANT.to_owned(),
            Tenancy::Conjoined => tenant_id.into(),
        };
        QuerySession {
            store: &self.store,
            options: &self.options,
            tenant_id,
        }
    }

    /// Build a daemon for every registered async projection.
    #[must_use]
    pub fn build_daemon(&self, settings: DaemonSettings) -> ProjectionDaemon<S> {
        ProjectionDaemon::new(Arc::clone(&self.store), Arc::clone(&self.options), settings)
    }
}

/// Read-only access to one tenant's streams and documents.
pub struct QuerySession<'r, S> {
    store: &'r S,
    options: &'r StoreOptions,
    tenant_id: String,
}

impl<S> std::fmt::Debug for QuerySession<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySession")
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

impl<S: EventStore> QuerySession<'_, S> {
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Stream row, or `None` if the stream does not exist.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn fetch_stream_state(
        &self,
        id: impl Into<StreamId>,
    ) -> Result<Option<StreamState>, ReadError<S::Error>> {
        let id = id.into();
        self.store
            .fetch_stream_state(&self.tenant_id, &id)
            .await
            .map_err(ReadError::Store)
    }

    /// Every event of a stream, in version order.
    ///
    /// # Errors
    ///
    /// See [`fetch_stream_range`](Self::fetch_stream_range).
    pub async fn fetch_stream(&self, id: impl Into<StreamId>) -> Result<Vec<Event>, ReadError<S::Error>> {
        self.fetch_stream_range(id, &StreamRange::all()).await
    }

    /// Events of a stream within `range`, with the store's unknown-type policy
    /// applied.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::UnknownEventType`] under the failing policy, or a
    /// backend failure.
    pub async fn fetch_stream_range(
        &self,
        id: impl Into<StreamId>,
        range: &StreamRange,
    ) -> Result<Vec<Event>, ReadError<S::Error>> {
        let id = id.into();
        self.load_range(&id, range).await
    }

    async fn load_range(&self, id: &StreamId, range: &StreamRange) -> Result<Vec<Event>, ReadError<S::Error>> {
        let events = self
            .store
            .fetch_stream(&self.tenant_id, id, range)
            .await
            .map_err(ReadError::Store)?;
        Ok(self
            .options
            .events
            .screen(events, self.options.unknown_events)?)
    }

    /// Fold a stream into `A` without writing anything.
    ///
    /// The stored snapshot is used only when no seed, start version or
    /// timestamp bound is given. A snapshot newer than `max_version` is
    /// ignored and the stream is replayed from the start.
    ///
    /// Returns `None` when there is nothing to fold and no seed, or when a
    /// delete handler fired and no later event rebuilt the aggregate.
    ///
    /// # Errors
    ///
    /// Returns decode failures for handled events or the snapshot, unknown
    /// types under the failing policy, and backend failures.
    #[tracing::instrument(skip(self, id, aggregation, options), fields(kind = A::KIND))]
    pub async fn aggregate_stream<A: Aggregate>(
        &self,
        id: impl Into<StreamId>,
        aggregation: &Aggregation<A>,
        options: AggregateOptions<A>,
    ) -> Result<Option<A>, ReadError<S::Error>> {
        let id = id.into();
        aggregation.register_events(&self.options.events);

        let use_snapshot = options.allows_snapshot();
        let AggregateOptions {
            max_version,
            before,
            seed,
            from_version,
        } = options;
        let mut range = StreamRange {
            from_version,
            to_version: max_version,
            before,
        };
        let mut state = seed;

        if use_snapshot
            && let Some(snapshot) = self
                .store
                .load_snapshot(&self.tenant_id, &id)
                .await
                .map_err(ReadError::Store)?
        {
            match max_version {
                Some(max) if max < snapshot.version => {
                    tracing::debug!(
                        snapshot_version = snapshot.version,
                        max_version = max,
                        "snapshot is newer than requested version, replaying from start"
                    );
                }
                Some(max) if max == snapshot.version => {
                    let mut aggregate: A =
                        serde_json::from_value(snapshot.data).map_err(ReadError::Deserialization)?;
                    aggregate.assign_id(&id);
                    return Ok(Some(aggregate));
                }
                _ => {
                    tracing::trace!(snapshot_version = snapshot.version, "seeding from snapshot");
                    state = Some(
                        serde_json::from_value(snapshot.data).map_err(ReadError::Deserialization)?,
                    );
                    range.from_version = Some(snapshot.version + 1);
                }
            }
        }

        let events = self.load_range(&id, &range).await?;
        if events.is_empty() && state.is_none() {
            return Ok(None);
        }

        let folded = aggregation.fold(state, &events)?;
        Ok(folded.into_option().map(|mut aggregate| {
            aggregate.assign_id(&id);
            aggregate
        }))
    }

    /// Load a projected document.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::Deserialization`] if the stored document does not
    /// match `T`, or a backend failure.
    pub async fn load_document<T: DeserializeOwned>(
        &self,
        kind: &str,
        id: &str,
    ) -> Result<Option<T>, ReadError<S::Error>> {
        self.store
            .load_document(&self.tenant_id, kind, id)
            .await
            .map_err(ReadError::Store)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(ReadError::Deserialization)
    }
}
