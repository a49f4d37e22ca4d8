use eventide_core::{
    event::{Event, StreamId, StreamIdentity},
    store::{Snapshot, StreamState},
};
use sqlx::{PgConnection, Postgres, QueryBuilder, Row, postgres::PgRow};

use crate::Error;

pub(in crate::store) const SELECT_EVENTS: &str = "SELECT seq_id, id, stream_id, version, data, \
                                                  type, dotnet_type, timestamp, tenant_id, \
                                                  is_archived FROM events";

/// Bind a stream id with the column type of its kind.
pub(in crate::store) fn push_stream_id(qb: &mut QueryBuilder<'_, Postgres>, id: &StreamId) {
    match id {
        StreamId::Guid(guid) => qb.push_bind(*guid),
        StreamId::Key(key) => qb.push_bind(key.clone()),
    };
}

/// `LIMIT` argument; Postgres has no unsigned integers.
pub(in crate::store) fn limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn decode_stream_id(row: &PgRow, column: &str, identity: StreamIdentity) -> Result<StreamId, sqlx::Error> {
    match identity {
        StreamIdentity::AsGuid => row.try_get::<uuid::Uuid, _>(column).map(StreamId::Guid),
        StreamIdentity::AsString => row.try_get::<String, _>(column).map(StreamId::Key),
    }
}

pub(in crate::store) fn decode_event(row: &PgRow, identity: StreamIdentity) -> Result<Event, sqlx::Error> {
    let data: sqlx::types::Json<serde_json::Value> = row.try_get("data")?;
    Ok(Event {
        sequence: row.try_get("seq_id")?,
        id: row.try_get("id")?,
        stream_id: decode_stream_id(row, "stream_id", identity)?,
        version: row.try_get("version")?,
        alias: row.try_get("type")?,
        type_name: row.try_get("dotnet_type")?,
        data: data.0,
        timestamp: row.try_get("timestamp")?,
        tenant_id: row.try_get("tenant_id")?,
        is_archived: row.try_get("is_archived")?,
    })
}

pub(in crate::store) fn decode_events(rows: &[PgRow], identity: StreamIdentity) -> Result<Vec<Event>, sqlx::Error> {
    rows.iter().map(|row| decode_event(row, identity)).collect()
}

pub(in crate::store) fn decode_stream_state(
    row: &PgRow,
    identity: StreamIdentity,
) -> Result<StreamState, sqlx::Error> {
    Ok(StreamState {
        id: decode_stream_id(row, "id", identity)?,
        tenant_id: row.try_get("tenant_id")?,
        version: row.try_get("version")?,
        aggregate_type: row.try_get("type")?,
        created: row.try_get("created")?,
        last_updated: row.try_get("timestamp")?,
        is_archived: row.try_get("is_archived")?,
        snapshot_version: row.try_get("snapshot_version")?,
    })
}

pub(in crate::store) async fn select_snapshot(
    conn: &mut PgConnection,
    tenant_id: &str,
    id: &StreamId,
) -> Result<Option<Snapshot>, Error> {
    let mut qb = QueryBuilder::<Postgres>::new(
        "SELECT snapshot_version, snapshot FROM streams WHERE snapshot IS NOT NULL AND tenant_id = ",
    );
    qb.push_bind(tenant_id).push(" AND id = ");
    push_stream_id(&mut qb, id);

    let Some(row) = qb.build().fetch_optional(&mut *conn).await? else {
        return Ok(None);
    };
    let data: sqlx::types::Json<serde_json::Value> = row.try_get("snapshot")?;
    Ok(Some(Snapshot {
        version: row.try_get("snapshot_version")?,
        data: data.0,
    }))
}

pub(in crate::store) async fn select_document(
    conn: &mut PgConnection,
    tenant_id: &str,
    kind: &str,
    id: &str,
) -> Result<Option<serde_json::Value>, Error> {
    let data: Option<sqlx::types::Json<serde_json::Value>> = sqlx::query_scalar(
        "SELECT data FROM projected_documents WHERE tenant_id = $1 AND kind = $2 AND id = $3",
    )
    .bind(tenant_id)
    .bind(kind)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(data.map(|json| json.0))
}
