//! Read-side primitives.
//!
//! A [`Projection`] turns a batch of events into document and snapshot writes.
//! The same projection can run inline, inside the transaction that appends
//! the events, or asynchronously under the projection daemon, which hands it
//! one page of events per transaction. Either way the projection only talks to
//! storage through a [`ProjectionContext`], so its effects commit or roll back
//! together with the events (inline) or with the shard's progress (async).
//!
//! Provided projections:
//!
//! - [`SnapshotProjection`] stores the folded aggregate on the stream row,
//! - [`SingleStreamProjection`] stores one document per stream,
//! - [`MultiStreamProjection`] stores documents keyed by a slicer function,
//! - [`CompositeProjection`] runs several projections in ordered stages.
use std::{future::Future, pin::Pin, sync::Arc};

use thiserror::Error;

use crate::{
    aggregate::{Aggregate, Aggregation, Folded},
    event::{DecodeError, Event, EventRegistry, StreamId},
    store::{Snapshot, StorageOperation, StoreTransaction},
};

/// Boxed future used at the dyn-compatible projection boundary.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors raised while projecting events.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("failed to deserialize stored state for `{kind}` `{id}`: {source}")]
    Deserialization {
        kind: String,
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize projected state: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("storage error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl ProjectionError {
    pub fn store<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store(Box::new(error))
    }
}

/// Storage access available to a running projection.
///
/// Reads observe the enclosing transaction's own writes. Applied operations
/// become durable only if that transaction commits.
pub trait ProjectionContext: Send {
    fn load_document<'a>(
        &'a mut self,
        tenant_id: &'a str,
        kind: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<serde_json::Value>, ProjectionError>>;

    fn load_snapshot<'a>(
        &'a mut self,
        tenant_id: &'a str,
        stream_id: &'a StreamId,
    ) -> BoxFuture<'a, Result<Option<Snapshot>, ProjectionError>>;

    fn apply(&mut self, operation: StorageOperation) -> BoxFuture<'_, Result<(), ProjectionError>>;
}

/// [`ProjectionContext`] over a backend transaction.
pub(crate) struct TransactionContext<'t, T> {
    tx: &'t mut T,
}

impl<'t, T: StoreTransaction> TransactionContext<'t, T> {
    pub(crate) const fn new(tx: &'t mut T) -> Self {
        Self { tx }
    }
}

impl<T: StoreTransaction> ProjectionContext for TransactionContext<'_, T> {
    fn load_document<'a>(
        &'a mut self,
        tenant_id: &'a str,
        kind: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<serde_json::Value>, ProjectionError>> {
        Box::pin(async move {
            self.tx
                .load_document(tenant_id, kind, id)
                .await
                .map_err(ProjectionError::store)
        })
    }

    fn load_snapshot<'a>(
        &'a mut self,
        tenant_id: &'a str,
        stream_id: &'a StreamId,
    ) -> BoxFuture<'a, Result<Option<Snapshot>, ProjectionError>> {
        Box::pin(async move {
            self.tx
                .load_snapshot(tenant_id, stream_id)
                .await
                .map_err(ProjectionError::store)
        })
    }

    fn apply(&mut self, operation: StorageOperation) -> BoxFuture<'_, Result<(), ProjectionError>> {
        Box::pin(async move {
            self.tx
                .apply(&operation)
                .await
                .map_err(ProjectionError::store)
        })
    }
}

/// A read model maintained from events.
pub trait Projection: Send + Sync + 'static {
    /// Stable projection name. Async shards derive their progress name from
    /// it, so renaming a projection restarts it from scratch.
    fn name(&self) -> &str;

    /// Register every event type this projection handles.
    fn register_events(&self, registry: &EventRegistry) {
        let _ = registry;
    }

    /// Apply a batch of events, in sequence order.
    fn apply<'a>(
        &'a self,
        ctx: &'a mut dyn ProjectionContext,
        events: &'a [Event],
    ) -> BoxFuture<'a, Result<(), ProjectionError>>;
}

/// Group events by `key`, preserving first-appearance order of the keys and
/// event order within each group.
fn group_by<'e, K, F>(events: &'e [Event], key: F) -> Vec<(K, Vec<&'e Event>)>
where
    K: PartialEq,
    F: Fn(&Event) -> Option<K>,
{
    let mut groups: Vec<(K, Vec<&'e Event>)> = Vec::new();
    for event in events {
        let Some(k) = key(event) else { continue };
        match groups.iter_mut().find(|(existing, _)| *existing == k) {
            Some((_, group)) => group.push(event),
            None => groups.push((k, vec![event])),
        }
    }
    groups
}

/// Fold `events` into the document `kind`/`id` and write the outcome.
async fn project_document<A: Aggregate>(
    ctx: &mut dyn ProjectionContext,
    aggregation: &Aggregation<A>,
    tenant_id: &str,
    id: &str,
    identity: &StreamId,
    events: Vec<&Event>,
) -> Result<(), ProjectionError> {
    let current = ctx
        .load_document(tenant_id, A::KIND, id)
        .await?
        .map(serde_json::from_value::<A>)
        .transpose()
        .map_err(|source| ProjectionError::Deserialization {
            kind: A::KIND.to_owned(),
            id: id.to_owned(),
            source,
        })?;

    match aggregation.fold(current, events)? {
        Folded::State(mut state) => {
            state.assign_id(identity);
            let data = serde_json::to_value(&state).map_err(ProjectionError::Serialization)?;
            ctx.apply(StorageOperation::UpsertDocument {
                tenant_id: tenant_id.to_owned(),
                kind: A::KIND.to_owned(),
                id: id.to_owned(),
                data,
            })
            .await
        }
        Folded::Deleted => {
            ctx.apply(StorageOperation::DeleteDocument {
                tenant_id: tenant_id.to_owned(),
                kind: A::KIND.to_owned(),
                id: id.to_owned(),
            })
            .await
        }
        Folded::Empty => Ok(()),
    }
}

/// Keeps an up-to-date aggregate snapshot on each stream row.
///
/// Events at or below the stored snapshot version are skipped, so replaying a
/// page never double-applies.
pub struct SnapshotProjection<A> {
    name: String,
    aggregation: Aggregation<A>,
}

impl<A: Aggregate> SnapshotProjection<A> {
    #[must_use]
    pub fn new(aggregation: Aggregation<A>) -> Self {
        Self {
            name: format!("{}Snapshot", A::KIND),
            aggregation,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    async fn project_stream(
        &self,
        ctx: &mut dyn ProjectionContext,
        tenant_id: &str,
        stream_id: &StreamId,
        events: Vec<&Event>,
    ) -> Result<(), ProjectionError> {
        let snapshot = ctx.load_snapshot(tenant_id, stream_id).await?;
        let applied = snapshot.as_ref().map_or(0, |s| s.version);
        let fresh: Vec<&Event> = events.into_iter().filter(|e| e.version > applied).collect();
        let Some(last) = fresh.last().map(|e| e.version) else {
            return Ok(());
        };

        let current = snapshot
            .map(|s| serde_json::from_value::<A>(s.data))
            .transpose()
            .map_err(|source| ProjectionError::Deserialization {
                kind: A::KIND.to_owned(),
                id: stream_id.to_string(),
                source,
            })?;

        match self.aggregation.fold(current, fresh)? {
            Folded::State(mut state) => {
                state.assign_id(stream_id);
                let data = serde_json::to_value(&state).map_err(ProjectionError::Serialization)?;
                ctx.apply(StorageOperation::StoreSnapshot {
                    tenant_id: tenant_id.to_owned(),
                    stream_id: stream_id.clone(),
                    version: last,
                    data,
                })
                .await
            }
            Folded::Deleted => {
                ctx.apply(StorageOperation::DeleteSnapshot {
                    tenant_id: tenant_id.to_owned(),
                    stream_id: stream_id.clone(),
                })
                .await
            }
            Folded::Empty => Ok(()),
        }
    }
}

impl<A: Aggregate> Projection for SnapshotProjection<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_events(&self, registry: &EventRegistry) {
        self.aggregation.register_events(registry);
    }

    fn apply<'a>(
        &'a self,
        ctx: &'a mut dyn ProjectionContext,
        events: &'a [Event],
    ) -> BoxFuture<'a, Result<(), ProjectionError>> {
        Box::pin(async move {
            let streams = group_by(events, |e| {
                self.aggregation
                    .handles(&e.type_name)
                    .then(|| (e.tenant_id.clone(), e.stream_id.clone()))
            });
            for ((tenant_id, stream_id), group) in streams {
                self.project_stream(&mut *ctx, &tenant_id, &stream_id, group)
                    .await?;
            }
            Ok(())
        })
    }
}

/// One document of kind `A::KIND` per stream, keyed by the stream id.
pub struct SingleStreamProjection<A> {
    name: String,
    aggregation: Aggregation<A>,
}

impl<A: Aggregate> SingleStreamProjection<A> {
    #[must_use]
    pub fn new(aggregation: Aggregation<A>) -> Self {
        Self {
            name: A::KIND.to_owned(),
            aggregation,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<A: Aggregate> Projection for SingleStreamProjection<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_events(&self, registry: &EventRegistry) {
        self.aggregation.register_events(registry);
    }

    fn apply<'a>(
        &'a self,
        ctx: &'a mut dyn ProjectionContext,
        events: &'a [Event],
    ) -> BoxFuture<'a, Result<(), ProjectionError>> {
        Box::pin(async move {
            let streams = group_by(events, |e| {
                self.aggregation
                    .handles(&e.type_name)
                    .then(|| (e.tenant_id.clone(), e.stream_id.clone()))
            });
            for ((tenant_id, stream_id), group) in streams {
                let id = stream_id.to_string();
                project_document(&mut *ctx, &self.aggregation, &tenant_id, &id, &stream_id, group)
                    .await?;
            }
            Ok(())
        })
    }
}

type Slicer = Box<dyn Fn(&Event) -> Option<String> + Send + Sync>;

/// Documents of kind `V::KIND` whose identity is computed from each event by
/// a slicer. Events for which the slicer returns `None` are ignored.
pub struct MultiStreamProjection<V> {
    name: String,
    aggregation: Aggregation<V>,
    slicer: Slicer,
}

impl<V: Aggregate> MultiStreamProjection<V> {
    pub fn new<F>(aggregation: Aggregation<V>, slicer: F) -> Self
    where
        F: Fn(&Event) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            name: V::KIND.to_owned(),
            aggregation,
            slicer: Box::new(slicer),
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<V: Aggregate> Projection for MultiStreamProjection<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_events(&self, registry: &EventRegistry) {
        self.aggregation.register_events(registry);
    }

    fn apply<'a>(
        &'a self,
        ctx: &'a mut dyn ProjectionContext,
        events: &'a [Event],
    ) -> BoxFuture<'a, Result<(), ProjectionError>> {
        Box::pin(async move {
            let slices = group_by(events, |e| {
                if !self.aggregation.handles(&e.type_name) {
                    return None;
                }
                (self.slicer)(e).map(|key| (e.tenant_id.clone(), key))
            });
            for ((tenant_id, key), group) in slices {
                let identity = StreamId::Key(key.clone());
                project_document(&mut *ctx, &self.aggregation, &tenant_id, &key, &identity, group)
                    .await?;
            }
            Ok(())
        })
    }
}

/// Projections run in ordered stages over the same batch. A later stage sees
/// the writes of every earlier stage.
pub struct CompositeProjection {
    name: String,
    stages: Vec<Vec<Arc<dyn Projection>>>,
}

impl CompositeProjection {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Append a stage.
    #[must_use]
    pub fn stage(mut self, projections: Vec<Arc<dyn Projection>>) -> Self {
        self.stages.push(projections);
        self
    }

    /// Append a stage holding a single projection.
    #[must_use]
    pub fn then<P: Projection>(self, projection: P) -> Self {
        self.stage(vec![Arc::new(projection)])
    }
}

impl Projection for CompositeProjection {
    fn name(&self) -> &str {
        &self.name
    }

    fn register_events(&self, registry: &EventRegistry) {
        for projection in self.stages.iter().flatten() {
            projection.register_events(registry);
        }
    }

    fn apply<'a>(
        &'a self,
        ctx: &'a mut dyn ProjectionContext,
        events: &'a [Event],
    ) -> BoxFuture<'a, Result<(), ProjectionError>> {
        Box::pin(async move {
            for (stage, projections) in self.stages.iter().enumerate() {
                for projection in projections {
                    tracing::trace!(stage, projection = projection.name(), "running stage");
                    projection.apply(&mut *ctx, events).await?;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use super::*;
    use crate::{
        aggregate::{Apply, Create},
        event::EventRegistry,
        store::{EventStore, inmemory},
    };

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Tally {
        id: String,
        count: u32,
    }

    impl Aggregate for Tally {
        const KIND: &'static str = "tally";

        fn assign_id(&mut self, id: &StreamId) {
            self.id = id.to_string();
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Opened;

    #[derive(Serialize, Deserialize)]
    struct Ticked {
        bucket: String,
    }

    impl Create<Opened> for Tally {
        fn create(_: &Opened) -> Self {
            Self::default()
        }
    }

    impl Apply<Ticked> for Tally {
        fn apply(&mut self, _: &Ticked) {
            self.count += 1;
        }
    }

    fn tally() -> Aggregation<Tally> {
        Aggregation::new().creates::<Opened>().applies::<Ticked>()
    }

    fn events(registry: &EventRegistry) -> Vec<Event> {
        let payloads = vec![
            ("a", registry.wrap(Opened).unwrap()),
            ("a", registry.wrap(Ticked { bucket: "x".into() }).unwrap()),
            ("b", registry.wrap(Ticked { bucket: "y".into() }).unwrap()),
            ("a", registry.wrap(Ticked { bucket: "y".into() }).unwrap()),
        ];
        let mut versions = std::collections::HashMap::new();
        payloads
            .into_iter()
            .enumerate()
            .map(|(i, (stream, pending))| {
                let version = versions.entry(stream).or_insert(0);
                *version += 1;
                Event {
                    sequence: i64::try_from(i).unwrap() + 1,
                    id: Uuid::new_v4(),
                    stream_id: StreamId::from(stream),
                    version: *version,
                    alias: pending.alias,
                    type_name: pending.type_name,
                    data: pending.data,
                    timestamp: Utc::now(),
                    tenant_id: "*DEFAULT*".into(),
                    is_archived: false,
                }
            })
            .collect()
    }

    async fn run(projection: &dyn Projection, events: &[Event]) -> inmemory::Store {
        let store = inmemory::Store::new();
        let mut tx = store.begin().await.unwrap();
        let mut ctx = TransactionContext::new(&mut tx);
        projection.apply(&mut ctx, events).await.unwrap();
        tx.commit().await.unwrap();
        store
    }

    async fn document(store: &inmemory::Store, id: &str) -> Option<Tally> {
        store
            .load_document("*DEFAULT*", "tally", id)
            .await
            .unwrap()
            .map(|v| serde_json::from_value(v).unwrap())
    }

    #[test]
    fn group_by_preserves_first_appearance_order() {
        let registry = EventRegistry::new();
        let events = events(&registry);
        let groups = group_by(&events, |e| Some(e.stream_id.clone()));
        let shape: Vec<(String, usize)> = groups
            .iter()
            .map(|(k, g)| (k.to_string(), g.len()))
            .collect();
        assert_eq!(shape, vec![("a".into(), 3), ("b".into(), 1)]);
    }

    #[tokio::test]
    async fn single_stream_projection_writes_one_document_per_stream() {
        let registry = EventRegistry::new();
        let events = events(&registry);
        let store = run(&SingleStreamProjection::new(tally()), &events).await;

        assert_eq!(
            document(&store, "a").await,
            Some(Tally {
                id: "a".into(),
                count: 2
            })
        );
        assert_eq!(
            document(&store, "b").await,
            Some(Tally {
                id: "b".into(),
                count: 1
            })
        );
    }

    #[tokio::test]
    async fn multi_stream_projection_slices_across_streams() {
        let registry = EventRegistry::new();
        let events = events(&registry);
        let projection = MultiStreamProjection::new(tally(), |e: &Event| {
            e.data.get("bucket").and_then(|b| b.as_str()).map(str::to_owned)
        });
        let store = run(&projection, &events).await;

        assert_eq!(document(&store, "x").await.map(|t| t.count), Some(1));
        assert_eq!(document(&store, "y").await.map(|t| t.count), Some(2));
        assert_eq!(document(&store, "y").await.map(|t| t.id), Some("y".into()));
    }

    #[tokio::test]
    async fn composite_projection_runs_every_stage() {
        let registry = EventRegistry::new();
        let events = events(&registry);
        let composite = CompositeProjection::new("everything")
            .then(SingleStreamProjection::new(tally()))
            .then(MultiStreamProjection::new(tally(), |e: &Event| {
                e.data.get("bucket").and_then(|b| b.as_str()).map(str::to_owned)
            }));
        composite.register_events(&registry);
        let store = run(&composite, &events).await;

        assert_eq!(document(&store, "a").await.map(|t| t.count), Some(2));
        assert_eq!(document(&store, "y").await.map(|t| t.count), Some(2));
    }
}
