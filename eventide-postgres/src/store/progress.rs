//! Queries against `event_progression`.

use chrono::{DateTime, Utc};
use eventide_core::store::{HIGH_WATER_MARK, HighWaterRow, ShardProgress};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::Error;

fn decode(row: &PgRow) -> Result<ShardProgress, sqlx::Error> {
    Ok(ShardProgress {
        name: row.try_get("name")?,
        sequence: row.try_get("last_seq_id")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn decode_high_water(row: &PgRow) -> Result<HighWaterRow, sqlx::Error> {
    let highest: Option<i64> = row.try_get("highest_seq_id")?;
    Ok(HighWaterRow {
        mark: row.try_get("last_seq_id")?,
        highest_sequence: highest.unwrap_or_default(),
        last_updated: row.try_get("last_updated")?,
    })
}

pub(in crate::store) async fn fetch(pool: &PgPool, name: &str) -> Result<Option<ShardProgress>, Error> {
    let row = sqlx::query("SELECT name, last_seq_id, last_updated FROM event_progression WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(decode).transpose().map_err(Error::from)
}

pub(in crate::store) async fn fetch_all(pool: &PgPool) -> Result<Vec<ShardProgress>, Error> {
    let rows = sqlx::query(
        "SELECT name, last_seq_id, last_updated FROM event_progression WHERE name <> $1 ORDER BY name",
    )
    .bind(HIGH_WATER_MARK)
    .fetch_all(pool)
    .await?;
    rows.iter().map(decode).collect::<Result<_, _>>().map_err(Error::from)
}

pub(in crate::store) async fn overwrite(pool: &PgPool, name: &str, sequence: i64) -> Result<(), Error> {
    sqlx::query(
        r"
            INSERT INTO event_progression (name, last_seq_id, last_updated)
            VALUES ($1, $2, now())
            ON CONFLICT (name) DO UPDATE
            SET last_seq_id = EXCLUDED.last_seq_id, last_updated = EXCLUDED.last_updated
            ",
    )
    .bind(name)
    .bind(sequence)
    .execute(pool)
    .await?;
    Ok(())
}

pub(in crate::store) async fn fetch_high_water(pool: &PgPool) -> Result<Option<HighWaterRow>, Error> {
    let row = sqlx::query(
        "SELECT last_seq_id, highest_seq_id, last_updated FROM event_progression WHERE name = $1",
    )
    .bind(HIGH_WATER_MARK)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(decode_high_water).transpose().map_err(Error::from)
}

/// Upsert the high-water row. The mark never decreases, and `last_updated`
/// only moves when the mark advances or the previous row had no gap.
pub(in crate::store) async fn save_high_water(
    pool: &PgPool,
    mark: i64,
    highest_sequence: i64,
    at: DateTime<Utc>,
) -> Result<HighWaterRow, Error> {
    let row = sqlx::query(
        r"
            INSERT INTO event_progression AS p (name, last_seq_id, highest_seq_id, last_updated)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE
            SET last_updated = CASE
                    WHEN EXCLUDED.last_seq_id > p.last_seq_id
                      OR COALESCE(p.highest_seq_id, 0) <= p.last_seq_id
                    THEN EXCLUDED.last_updated
                    ELSE p.last_updated
                END,
                last_seq_id = GREATEST(p.last_seq_id, EXCLUDED.last_seq_id),
                highest_seq_id = EXCLUDED.highest_seq_id
            RETURNING last_seq_id, highest_seq_id, last_updated
            ",
    )
    .bind(HIGH_WATER_MARK)
    .bind(mark)
    .bind(highest_sequence)
    .bind(at)
    .fetch_one(pool)
    .await?;
    Ok(decode_high_water(&row)?)
}
