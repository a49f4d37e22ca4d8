#![doc = include_str!("../README.md")]

pub use eventide_core::{
    CommitSummary, CommittedStream, aggregate,
    aggregate::{Aggregate, Aggregation, Apply, Create, ShouldDelete},
    concurrency,
    concurrency::{StreamIdCollision, UnexpectedVersion},
    daemon,
    daemon::{DaemonSettings, ProjectionDaemon, ShardState},
    event,
    event::{Event, EventRegistry, PendingEvent, StreamId, StreamIdentity, UnknownEventPolicy},
    options,
    options::{ProjectionLifecycle, StoreOptions, Tenancy},
    projection,
    projection::{
        CompositeProjection, MultiStreamProjection, Projection, SingleStreamProjection,
        SnapshotProjection,
    },
    repository,
    repository::{AggregateOptions, QuerySession, Repository},
    session,
    session::{Session, SessionError},
    tracker,
};

pub mod store {

    pub use eventide_core::store::{
        EventFilter, EventStore, HighWaterRow, ShardProgress, Snapshot, StorageOperation,
        StoreTransaction, StreamRange, StreamState,
    };

    // Row shapes exchanged with a backend; only backend implementors need them.
    #[doc(hidden)]
    pub use eventide_core::store::{LockedStream, NewStream, StreamInsert};

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use eventide_postgres::{Error, Store, Transaction};
    }

    pub use eventide_core::store::inmemory;
}
