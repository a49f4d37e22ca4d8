use chrono::{DateTime, Utc};
use eventide_core::{
    event::{Event, StreamId, StreamIdentity},
    store::{LockedStream, NewStream, Snapshot, StorageOperation, StoreTransaction, StreamInsert},
};
use sqlx::{Postgres, QueryBuilder, Row};

use super::{Store, load};
use crate::Error;

/// Rows per multi-row `INSERT`; ten binds each keeps a chunk well under the
/// 65535 parameter limit.
const INSERT_CHUNK: usize = 1000;

/// One `PostgreSQL` transaction. Dropping it without committing rolls back.
pub struct Transaction {
    tx: sqlx::Transaction<'static, Postgres>,
    identity: StreamIdentity,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(in crate::store) fn new(tx: sqlx::Transaction<'static, Postgres>, identity: StreamIdentity) -> Self {
        Self { tx, identity }
    }

    async fn write_stream(&mut self, stream: &NewStream) -> Result<u64, Error> {
        Store::check_identity(self.identity, &stream.id)?;
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO streams (tenant_id, id, type, version, timestamp, created, is_archived) VALUES (",
        );
        let mut values = qb.separated(", ");
        values.push_bind(stream.tenant_id.clone());
        match &stream.id {
            StreamId::Guid(guid) => values.push_bind(*guid),
            StreamId::Key(key) => values.push_bind(key.clone()),
        };
        values.push_bind(stream.aggregate_type.clone());
        values.push_bind(stream.version);
        values.push_bind(stream.timestamp);
        values.push_bind(stream.timestamp);
        values.push("FALSE");
        qb.push(") ON CONFLICT (tenant_id, id) DO NOTHING");

        let result = qb.build().execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    /// Run an `UPDATE`/`DELETE` whose statement ends in `tenant_id = ? AND
    /// {id_column} = ?`.
    async fn execute_for_stream(
        &mut self,
        statement: &str,
        id_column: &str,
        tenant_id: &str,
        id: &StreamId,
    ) -> Result<u64, Error> {
        Store::check_identity(self.identity, id)?;
        let mut qb = QueryBuilder::<Postgres>::new(statement);
        qb.push(" WHERE tenant_id = ").push_bind(tenant_id.to_owned());
        qb.push(format_args!(" AND {id_column} = "));
        load::push_stream_id(&mut qb, id);
        let result = qb.build().execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }
}

impl StoreTransaction for Transaction {
    type Error = Error;

    #[tracing::instrument(skip(self, stream), fields(stream_id = %stream.id))]
    async fn insert_stream<'a>(&'a mut self, stream: &'a NewStream) -> Result<StreamInsert, Self::Error> {
        if self.write_stream(stream).await? == 0 {
            Ok(StreamInsert::AlreadyExists)
        } else {
            Ok(StreamInsert::Inserted)
        }
    }

    async fn ensure_stream<'a>(&'a mut self, stream: &'a NewStream) -> Result<(), Self::Error> {
        self.write_stream(stream).await.map(|_| ())
    }

    async fn lock_stream<'a>(
        &'a mut self,
        tenant_id: &'a str,
        id: &'a StreamId,
    ) -> Result<Option<LockedStream>, Self::Error> {
        Store::check_identity(self.identity, id)?;
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT version, is_archived FROM streams WHERE tenant_id = ",
        );
        qb.push_bind(tenant_id).push(" AND id = ");
        load::push_stream_id(&mut qb, id);
        qb.push(" FOR UPDATE");

        let Some(row) = qb.build().fetch_optional(&mut *self.tx).await? else {
            return Ok(None);
        };
        Ok(Some(LockedStream {
            version: row.try_get("version")?,
            is_archived: row.try_get("is_archived")?,
        }))
    }

    async fn update_stream_version<'a>(
        &'a mut self,
        tenant_id: &'a str,
        id: &'a StreamId,
        version: i64,
        at: DateTime<Utc>,
    ) -> Result<(), Self::Error> {
        Store::check_identity(self.identity, id)?;
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE streams SET version = ");
        qb.push_bind(version).push(", timestamp = ").push_bind(at);
        qb.push(" WHERE tenant_id = ").push_bind(tenant_id).push(" AND id = ");
        load::push_stream_id(&mut qb, id);
        qb.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, events), fields(events_len = events.len()))]
    async fn insert_events<'a>(&'a mut self, events: &'a [Event]) -> Result<Vec<i64>, Self::Error> {
        let mut sequences = Vec::with_capacity(events.len());
        for chunk in events.chunks(INSERT_CHUNK) {
            for event in chunk {
                Store::check_identity(self.identity, &event.stream_id)?;
            }
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO events (id, stream_id, version, data, type, dotnet_type, timestamp, tenant_id, is_archived) ",
            );
            qb.push_values(chunk, |mut b, event| {
                b.push_bind(event.id);
                match &event.stream_id {
                    StreamId::Guid(guid) => b.push_bind(*guid),
                    StreamId::Key(key) => b.push_bind(key.clone()),
                };
                b.push_bind(event.version);
                b.push_bind(sqlx::types::Json(event.data.clone()));
                b.push_bind(event.alias.clone());
                b.push_bind(event.type_name.clone());
                b.push_bind(event.timestamp);
                b.push_bind(event.tenant_id.clone());
                b.push_bind(event.is_archived);
            });
            qb.push(" RETURNING seq_id");

            let returned: Vec<i64> = qb.build_query_scalar().fetch_all(&mut *self.tx).await?;
            if returned.len() != chunk.len() {
                return Err(Error::MissingReturnedSequence {
                    expected: chunk.len(),
                    returned: returned.len(),
                });
            }
            sequences.extend(returned);
        }
        Ok(sequences)
    }

    async fn archive_stream<'a>(&'a mut self, tenant_id: &'a str, id: &'a StreamId) -> Result<(), Self::Error> {
        self.execute_for_stream("UPDATE streams SET is_archived = TRUE", "id", tenant_id, id)
            .await?;
        self.execute_for_stream("UPDATE events SET is_archived = TRUE", "stream_id", tenant_id, id)
            .await?;
        Ok(())
    }

    async fn tombstone_stream<'a>(&'a mut self, tenant_id: &'a str, id: &'a StreamId) -> Result<(), Self::Error> {
        let events = self
            .execute_for_stream("DELETE FROM events", "stream_id", tenant_id, id)
            .await?;
        self.execute_for_stream("DELETE FROM streams", "id", tenant_id, id)
            .await?;
        tracing::trace!(stream_id = %id, events_deleted = events, "stream tombstoned");
        Ok(())
    }

    async fn load_snapshot<'a>(
        &'a mut self,
        tenant_id: &'a str,
        id: &'a StreamId,
    ) -> Result<Option<Snapshot>, Self::Error> {
        Store::check_identity(self.identity, id)?;
        load::select_snapshot(&mut self.tx, tenant_id, id).await
    }

    async fn load_document<'a>(
        &'a mut self,
        tenant_id: &'a str,
        kind: &'a str,
        id: &'a str,
    ) -> Result<Option<serde_json::Value>, Self::Error> {
        load::select_document(&mut self.tx, tenant_id, kind, id).await
    }

    async fn apply<'a>(&'a mut self, operation: &'a StorageOperation) -> Result<(), Self::Error> {
        match operation {
            StorageOperation::UpsertDocument {
                tenant_id,
                kind,
                id,
                data,
            } => {
                sqlx::query(
                    r"
                    INSERT INTO projected_documents (tenant_id, kind, id, data, last_modified)
                    VALUES ($1, $2, $3, $4, now())
                    ON CONFLICT (tenant_id, kind, id) DO UPDATE
                    SET data = EXCLUDED.data, last_modified = EXCLUDED.last_modified
                    ",
                )
                .bind(tenant_id)
                .bind(kind)
                .bind(id)
                .bind(sqlx::types::Json(data))
                .execute(&mut *self.tx)
                .await?;
            }
            StorageOperation::DeleteDocument {
                tenant_id,
                kind,
                id,
            } => {
                sqlx::query("DELETE FROM projected_documents WHERE tenant_id = $1 AND kind = $2 AND id = $3")
                    .bind(tenant_id)
                    .bind(kind)
                    .bind(id)
                    .execute(&mut *self.tx)
                    .await?;
            }
            StorageOperation::StoreSnapshot {
                tenant_id,
                stream_id,
                version,
                data,
            } => {
                Store::check_identity(self.identity, stream_id)?;
                let mut qb = QueryBuilder::<Postgres>::new("UPDATE streams SET snapshot = ");
                qb.push_bind(sqlx::types::Json(data.clone()))
                    .push(", snapshot_version = ")
                    .push_bind(*version);
                qb.push(" WHERE tenant_id = ")
                    .push_bind(tenant_id.clone())
                    .push(" AND id = ");
                load::push_stream_id(&mut qb, stream_id);
                qb.build().execute(&mut *self.tx).await?;
            }
            StorageOperation::DeleteSnapshot {
                tenant_id,
                stream_id,
            } => {
                self.execute_for_stream(
                    "UPDATE streams SET snapshot = NULL, snapshot_version = NULL",
                    "id",
                    tenant_id,
                    stream_id,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn insert_progress<'a>(&'a mut self, name: &'a str, sequence: i64) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            r"
                INSERT INTO event_progression (name, last_seq_id, last_updated)
                VALUES ($1, $2, now())
                ON CONFLICT (name) DO NOTHING
                ",
        )
        .bind(name)
        .bind(sequence)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_progress<'a>(
        &'a mut self,
        name: &'a str,
        floor: i64,
        ceiling: i64,
    ) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            r"
                UPDATE event_progression
                SET last_seq_id = $3, last_updated = now()
                WHERE name = $1 AND last_seq_id = $2
                ",
        )
        .bind(name)
        .bind(floor)
        .bind(ceiling)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit(self) -> Result<(), Self::Error> {
        self.tx.commit().await?;
        tracing::trace!("transaction committed");
        Ok(())
    }
}
