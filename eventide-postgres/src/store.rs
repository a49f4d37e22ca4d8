mod load;
mod progress;
mod transaction;

use chrono::{DateTime, Utc};
use eventide_core::{
    event::{Event, StreamId, StreamIdentity},
    store::{EventFilter, EventStore, HighWaterRow, ShardProgress, Snapshot, StreamRange, StreamState},
};
use sqlx::{PgPool, Postgres, QueryBuilder};
pub use transaction::Transaction;

use crate::Error;

/// A PostgreSQL-backed [`EventStore`].
///
/// - Sequences are global and monotonic (`BIGSERIAL seq_id`). Like any
///   database sequence they may show temporary gaps while concurrent
///   transactions are in flight, and permanent ones after a rollback.
/// - Event payloads and documents are stored as `jsonb`.
/// - Stream ids are `UUID` or `TEXT` depending on the configured
///   [`StreamIdentity`]; the identity must match the one given to the
///   repository's `StoreOptions`.
#[derive(Clone, Debug)]
pub struct Store {
    pool: PgPool,
    identity: StreamIdentity,
}

impl Store {
    /// Construct a store keyed by UUID stream ids.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self::with_identity(pool, StreamIdentity::AsGuid)
    }

    #[must_use]
    pub const fn with_identity(pool: PgPool, identity: StreamIdentity) -> Self {
        Self { pool, identity }
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[must_use]
    pub const fn identity(&self) -> StreamIdentity {
        self.identity
    }

    /// Apply the schema (idempotent).
    ///
    /// This uses `CREATE TABLE IF NOT EXISTS` style DDL so it can be run on
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any of the schema creation queries fail.
    #[tracing::instrument(skip(self), fields(identity = ?self.identity))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        let id_type = match self.identity {
            StreamIdentity::AsGuid => "UUID",
            StreamIdentity::AsString => "TEXT",
        };

        let streams = format!(
            r"
            CREATE TABLE IF NOT EXISTS streams (
                tenant_id        TEXT NOT NULL,
                id               {id_type} NOT NULL,
                type             TEXT NULL,
                version          BIGINT NOT NULL,
                timestamp        TIMESTAMPTZ NOT NULL,
                created          TIMESTAMPTZ NOT NULL,
                is_archived      BOOLEAN NOT NULL DEFAULT FALSE,
                snapshot         JSONB NULL,
                snapshot_version BIGINT NULL,
                PRIMARY KEY (tenant_id, id)
            )
            "
        );
        sqlx::query(&streams).execute(&self.pool).await?;

        let events = format!(
            r"
            CREATE TABLE IF NOT EXISTS events (
                seq_id      BIGSERIAL PRIMARY KEY,
                id          UUID NOT NULL,
                stream_id   {id_type} NOT NULL,
                version     BIGINT NOT NULL,
                data        JSONB NOT NULL,
                type        TEXT NOT NULL,
                dotnet_type TEXT NOT NULL,
                timestamp   TIMESTAMPTZ NOT NULL,
                tenant_id   TEXT NOT NULL,
                is_archived BOOLEAN NOT NULL DEFAULT FALSE
            )
            "
        );
        sqlx::query(&events).execute(&self.pool).await?;

        sqlx::query(
            r"CREATE UNIQUE INDEX IF NOT EXISTS events_by_stream_and_version ON events(tenant_id, stream_id, version)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(r"CREATE INDEX IF NOT EXISTS events_by_type_and_seq ON events(type, seq_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS event_progression (
                name           TEXT PRIMARY KEY,
                last_seq_id    BIGINT NOT NULL,
                highest_seq_id BIGINT NULL,
                last_updated   TIMESTAMPTZ NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS projected_documents (
                tenant_id     TEXT NOT NULL,
                kind          TEXT NOT NULL,
                id            TEXT NOT NULL,
                data          JSONB NOT NULL,
                last_modified TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (tenant_id, kind, id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Reject ids of the wrong kind before they reach a typed column.
    pub(crate) fn check_identity(identity: StreamIdentity, id: &StreamId) -> Result<(), Error> {
        if id.identity() == identity {
            Ok(())
        } else {
            Err(Error::IdentityMismatch {
                id: id.clone(),
                expected: identity,
            })
        }
    }
}

impl EventStore for Store {
    type Error = Error;
    type Transaction = Transaction;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        let tx = self.pool.begin().await?;
        Ok(Transaction::new(tx, self.identity))
    }

    async fn fetch_stream_state<'a>(
        &'a self,
        tenant_id: &'a str,
        id: &'a StreamId,
    ) -> Result<Option<StreamState>, Self::Error> {
        Self::check_identity(self.identity, id)?;
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT tenant_id, id, type, version, created, timestamp, is_archived, \
             snapshot_version FROM streams WHERE tenant_id = ",
        );
        qb.push_bind(tenant_id).push(" AND id = ");
        load::push_stream_id(&mut qb, id);

        let row = qb.build().fetch_optional(&self.pool).await?;
        row.map(|row| load::decode_stream_state(&row, self.identity))
            .transpose()
            .map_err(Error::from)
    }

    #[tracing::instrument(skip(self, id, range), fields(stream_id = %id))]
    async fn fetch_stream<'a>(
        &'a self,
        tenant_id: &'a str,
        id: &'a StreamId,
        range: &'a StreamRange,
    ) -> Result<Vec<Event>, Self::Error> {
        Self::check_identity(self.identity, id)?;
        let mut qb = QueryBuilder::<Postgres>::new(load::SELECT_EVENTS);
        qb.push(" WHERE tenant_id = ").push_bind(tenant_id);
        qb.push(" AND stream_id = ");
        load::push_stream_id(&mut qb, id);
        if let Some(from) = range.from_version {
            qb.push(" AND version >= ").push_bind(from);
        }
        if let Some(to) = range.to_version {
            qb.push(" AND version <= ").push_bind(to);
        }
        if let Some(before) = range.before {
            qb.push(" AND timestamp <= ").push_bind(before);
        }
        qb.push(" ORDER BY version ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let events = load::decode_events(&rows, self.identity)?;
        tracing::trace!(events_loaded = events.len(), "loaded stream");
        Ok(events)
    }

    async fn load_snapshot<'a>(
        &'a self,
        tenant_id: &'a str,
        id: &'a StreamId,
    ) -> Result<Option<Snapshot>, Self::Error> {
        Self::check_identity(self.identity, id)?;
        let mut conn = self.pool.acquire().await?;
        load::select_snapshot(&mut conn, tenant_id, id).await
    }

    async fn load_document<'a>(
        &'a self,
        tenant_id: &'a str,
        kind: &'a str,
        id: &'a str,
    ) -> Result<Option<serde_json::Value>, Self::Error> {
        let mut conn = self.pool.acquire().await?;
        load::select_document(&mut conn, tenant_id, kind, id).await
    }

    async fn highest_sequence(&self) -> Result<i64, Self::Error> {
        let highest: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq_id), 0) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(highest)
    }

    async fn sequences_after(&self, after: i64, limit: usize) -> Result<Vec<i64>, Self::Error> {
        let sequences: Vec<i64> = sqlx::query_scalar(
            "SELECT seq_id FROM events WHERE seq_id > $1 ORDER BY seq_id ASC LIMIT $2",
        )
        .bind(after)
        .bind(load::limit(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(sequences)
    }

    #[tracing::instrument(skip(self, filter))]
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

        let mut qb = QueryBuilder::<Postgres>::new(load::SELECT_EVENTS);
        qb.push(" WHERE seq_id > ").push_bind(floor);
        qb.push(" AND seq_id <= ").push_bind(ceiling);
        if let Some(aliases) = &filter.aliases {
            qb.push(" AND type = ANY(").push_bind(aliases.clone()).push(")");
        }
        if !filter.include_archived {
            qb.push(" AND is_archived = FALSE");
        }
        qb.push(" ORDER BY seq_id ASC LIMIT ").push_bind(load::limit(limit));

        let rows = qb.build().fetch_all(&self.pool).await?;
        load::decode_events(&rows, self.identity).map_err(Error::from)
    }

    async fn fetch_progress<'a>(
        &'a self,
        name: &'a str,
    ) -> Result<Option<ShardProgress>, Self::Error> {
        progress::fetch(&self.pool, name).await
    }

    async fn all_progress(&self) -> Result<Vec<ShardProgress>, Self::Error> {
        progress::fetch_all(&self.pool).await
    }

    #[tracing::instrument(skip(self))]
    async fn rewind_progress<'a>(&'a self, name: &'a str, sequence: i64) -> Result<(), Self::Error> {
        progress::overwrite(&self.pool, name, sequence).await
    }

    async fn fetch_high_water(&self) -> Result<Option<HighWaterRow>, Self::Error> {
        progress::fetch_high_water(&self.pool).await
    }

    async fn save_high_water(
        &self,
        mark: i64,
        highest_sequence: i64,
        at: DateTime<Utc>,
    ) -> Result<HighWaterRow, Self::Error> {
        progress::save_high_water(&self.pool, mark, highest_sequence, at).await
    }
}
