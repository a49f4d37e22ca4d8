//! Core machinery for the eventide event store.
//!
//! - [`event`] - Stream ids, stored events and the event type registry
//! - [`tracker`] - Pending stream actions collected by a session
//! - [`session`] - Unit of work and the atomic commit (`Session`)
//! - [`repository`] - Entry point, query sessions and live aggregation
//! - [`aggregate`] - Aggregate folding (`Aggregation`, `Apply`, `Create`)
//! - [`projection`] - Inline and async projections
//! - [`daemon`] - High-water detection and the async projection daemon
//! - [`store`] - Storage abstraction (`EventStore`, `StoreTransaction`)
//! - [`concurrency`] - Concurrency conflict errors
//! - [`options`] - Store-wide configuration
//!
//! # Example
//!
//! ```
//! use eventide_core::{repository::Repository, store::inmemory};
//!
//! let repo = Repository::new(inmemory::Store::new());
//! let session = repo.session();
//! assert!(session.pending().is_empty());
//! ```
//!
//! Most users should depend on the [`eventide`](https://docs.rs/eventide)
//! crate, which re-exports these types.

pub mod aggregate;
pub mod concurrency;
pub mod daemon;
pub mod event;
pub mod options;
pub mod projection;
pub mod repository;
pub mod session;
pub mod store;
pub mod tracker;
mod writer;

pub use writer::{CommitSummary, CommittedStream};
