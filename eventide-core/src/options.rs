//! Store-wide configuration.
//!
//! Configuration is programmatic: build a [`StoreOptions`] once at startup and
//! hand it to [`Repository::with_options`](crate::repository::Repository::with_options).

use std::sync::Arc;

use crate::{
    daemon::ShardDefinition,
    event::{EventRegistry, StreamIdentity, UnknownEventPolicy},
    projection::Projection,
    store::EventFilter,
};

/// Tenant id used for every row when the store is not multi-tenant.
pub const DEFAULT_TENANT: &str = "*DEFAULT*";

/// How streams are partitioned between tenants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Tenancy {
    /// One implicit tenant, [`DEFAULT_TENANT`].
    #[default]
    Single,
    /// Every row carries the tenant id of the session that wrote it, and
    /// sessions must name their tenant.
    Conjoined,
}

/// When a projection runs relative to the write that produced its events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProjectionLifecycle {
    /// Inside the same transaction as the events.
    #[default]
    Inline,
    /// Later, by the projection daemon.
    Async,
}

/// Store configuration: identity, tenancy, event types and projections.
pub struct StoreOptions {
    pub(crate) identity: StreamIdentity,
    pub(crate) tenancy: Tenancy,
    pub(crate) unknown_events: UnknownEventPolicy,
    pub(crate) events: EventRegistry,
    pub(crate) inline: Vec<Arc<dyn Projection>>,
    pub(crate) shards: Vec<Arc<ShardDefinition>>,
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("identity", &self.identity)
            .field("tenancy", &self.tenancy)
            .field("unknown_events", &self.unknown_events)
            .field(
                "inline",
                &self.inline.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field(
                "shards",
                &self.shards.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreOptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            identity: StreamIdentity::default(),
            tenancy: Tenancy::default(),
            unknown_events: UnknownEventPolicy::default(),
            events: EventRegistry::new(),
            inline: Vec::new(),
            shards: Vec::new(),
        }
    }

    #[must_use]
    pub const fn identity(mut self, identity: StreamIdentity) -> Self {
        self.identity = identity;
        self
    }

    #[must_use]
    pub const fn tenancy(mut self, tenancy: Tenancy) -> Self {
        self.tenancy = tenancy;
        self
    }

    #[must_use]
    pub const fn unknown_events(mut self, policy: UnknownEventPolicy) -> Self {
        self.unknown_events = policy;
        self
    }

    /// Register an event type up front, so it resolves on read even before
    /// anything has written or aggregated it.
    #[must_use]
    pub fn event<E: 'static>(self) -> Self {
        self.events.register::<E>();
        self
    }

    /// Register a projection. Async projections run as one daemon shard
    /// reading every event type.
    #[must_use]
    pub fn projection<P: Projection>(self, projection: P, lifecycle: ProjectionLifecycle) -> Self {
        self.projection_with_filter(projection, lifecycle, EventFilter::all())
    }

    /// Register a projection with an explicit daemon event filter. The filter
    /// is ignored for inline projections.
    #[must_use]
    pub fn projection_with_filter<P: Projection>(
        mut self,
        projection: P,
        lifecycle: ProjectionLifecycle,
        filter: EventFilter,
    ) -> Self {
        projection.register_events(&self.events);
        let projection: Arc<dyn Projection> = Arc::new(projection);
        match lifecycle {
            ProjectionLifecycle::Inline => self.inline.push(projection),
            ProjectionLifecycle::Async => self
                .shards
                .push(Arc::new(ShardDefinition::new(projection, filter))),
        }
        self
    }

    #[must_use]
    pub const fn stream_identity(&self) -> StreamIdentity {
        self.identity
    }

    #[must_use]
    pub const fn tenancy_mode(&self) -> Tenancy {
        self.tenancy
    }

    #[must_use]
    pub const fn unknown_event_policy(&self) -> UnknownEventPolicy {
        self.unknown_events
    }

    #[must_use]
    pub const fn registry(&self) -> &EventRegistry {
        &self.events
    }

    /// Names of the async shards.
    #[must_use]
    pub fn shard_names(&self) -> Vec<&str> {
        self.shards.iter().map(|s| s.name.as_str()).collect()
    }
}
