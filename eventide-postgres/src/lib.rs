//! PostgreSQL backend for eventide.
//!
//! [`Store`] implements [`eventide_core::store::EventStore`] on a
//! [`sqlx::PgPool`], and [`Transaction`] implements
//! [`eventide_core::store::StoreTransaction`] on one database transaction.
//! Run [`Store::migrate`] once at startup to create the tables:
//!
//! - `events` - one row per event, `seq_id` assigned by a `BIGSERIAL`
//! - `streams` - one row per stream with its version and snapshot cache
//! - `event_progression` - shard progress and the high-water mark
//! - `projected_documents` - JSONB documents written by projections
//!
//! The stream id column type follows the store's
//! [`StreamIdentity`](eventide_core::event::StreamIdentity): `UUID` for
//! `AsGuid`, `TEXT` for `AsString`.

mod error;
mod store;

pub use error::Error;
pub use store::{Store, Transaction};
