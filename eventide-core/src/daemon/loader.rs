//! Paged event loading for async shards.

use std::sync::Arc;

use crate::{
    daemon::DaemonError,
    event::Event,
    options::StoreOptions,
    store::{EventFilter, EventStore},
};

/// What to load: events with `floor < sequence <= high_water`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub floor: i64,
    pub high_water: i64,
    pub batch_size: usize,
    pub filter: EventFilter,
}

/// A loaded page. The shard may record `ceiling` as its progress once the
/// page is applied, even if some sequences in range were filtered out.
#[derive(Clone, Debug, PartialEq)]
pub struct EventPage {
    pub floor: i64,
    pub ceiling: i64,
    pub events: Vec<Event>,
}

impl EventPage {
    #[must_use]
    pub const fn advances(&self) -> bool {
        self.ceiling > self.floor
    }
}

/// Loads bounded pages of events below the high-water mark.
pub struct EventLoader<S> {
    store: Arc<S>,
    options: Arc<StoreOptions>,
}

impl<S: EventStore> EventLoader<S> {
    #[must_use]
    pub const fn new(store: Arc<S>, options: Arc<StoreOptions>) -> Self {
        Self { store, options }
    }

    /// Load the next page.
    ///
    /// A full page ends at the last fetched sequence; a short page means the
    /// range is exhausted and ends at `high_water`. Unknown event types are
    /// screened out after the ceiling is fixed, so skipping them never holds
    /// a shard back. A zero batch size is treated as one.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::UnknownEventType`] under the failing policy, or
    /// a backend failure.
    #[tracing::instrument(skip(self, request), fields(floor = request.floor, high_water = request.high_water))]
    pub async fn load(&self, request: &PageRequest) -> Result<EventPage, DaemonError<S::Error>> {
        if request.high_water <= request.floor {
            return Ok(EventPage {
                floor: request.floor,
                ceiling: request.floor,
                events: Vec::new(),
            });
        }

        let batch_size = if request.batch_size == 0 {
            tracing::warn!("page requested with a batch size of zero, loading one event");
            1
        } else {
            request.batch_size
        };
        let fetched = self
            .store
            .load_events_between(request.floor, request.high_water, batch_size, &request.filter)
            .await
            .map_err(DaemonError::Store)?;

        let ceiling = if fetched.len() >= batch_size {
            fetched.last().map_or(request.high_water, |e| e.sequence)
        } else {
            request.high_water
        };

        let events = self
            .options
            .events
            .screen(fetched, self.options.unknown_events)?;
        tracing::trace!(events = events.len(), ceiling, "page loaded");

        Ok(EventPage {
            floor: request.floor,
            ceiling,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::{
        event::{StreamId, UnknownEventPolicy},
        store::{NewStream, StoreTransaction, inmemory},
    };

    #[derive(serde::Serialize)]
    struct Ping;

    async fn seeded(count: i64, options: StoreOptions) -> EventLoader<inmemory::Store> {
        let store = inmemory::Store::new();
        let descriptor = options.events.register::<Ping>();
        let mut tx = store.begin().await.unwrap();
        let id = StreamId::from("s");
        tx.insert_stream(&NewStream {
            id: id.clone(),
            tenant_id: "*DEFAULT*".into(),
            aggregate_type: None,
            version: count,
            timestamp: Utc::now(),
        })
        .await
        .unwrap();
        let events: Vec<Event> = (1..=count)
            .map(|version| Event {
                sequence: 0,
                id: Uuid::new_v4(),
                stream_id: id.clone(),
                version,
                alias: descriptor.alias.clone(),
                type_name: if version == 2 {
                    "retired::Pong".into()
                } else {
                    descriptor.type_name.clone()
                },
                data: serde_json::Value::Null,
                timestamp: Utc::now(),
                tenant_id: "*DEFAULT*".into(),
                is_archived: false,
            })
            .collect();
        tx.insert_events(&events).await.unwrap();
        tx.commit().await.unwrap();
        EventLoader::new(Arc::new(store), Arc::new(options))
    }

    fn request(floor: i64, high_water: i64, batch_size: usize) -> PageRequest {
        PageRequest {
            floor,
            high_water,
            batch_size,
            filter: EventFilter::all(),
        }
    }

    #[tokio::test]
    async fn empty_range_yields_empty_page_at_floor() {
        let loader = seeded(5, StoreOptions::new()).await;
        let page = loader.load(&request(5, 5, 10)).await.unwrap();
        assert_eq!(page.ceiling, 5);
        assert!(page.events.is_empty());
        assert!(!page.advances());
    }

    #[tokio::test]
    async fn full_page_ends_at_last_fetched_sequence() {
        let loader = seeded(10, StoreOptions::new()).await;
        let page = loader.load(&request(0, 8, 3)).await.unwrap();
        assert_eq!(page.ceiling, 3);
        // sequence 2 has an unregistered type and is skipped after paging
        let seqs: Vec<i64> = page.events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[tokio::test]
    async fn short_page_ends_at_high_water() {
        let loader = seeded(10, StoreOptions::new()).await;
        let page = loader.load(&request(6, 8, 5)).await.unwrap();
        assert_eq!(page.ceiling, 8);
        assert_eq!(page.events.len(), 2);
        assert!(page.events.iter().all(|e| e.sequence <= 8));
    }

    #[tokio::test]
    async fn zero_batch_size_still_advances() {
        let loader = seeded(5, StoreOptions::new()).await;
        let page = loader.load(&request(0, 5, 0)).await.unwrap();
        assert_eq!(page.ceiling, 1);
        assert!(page.advances());
        assert_eq!(page.events.len(), 1);

        let settings = crate::daemon::DaemonSettings::default().batch_size(0);
        assert_eq!(settings.batch_size, 1);
    }

    #[tokio::test]
    async fn failing_policy_surfaces_unknown_types() {
        let options = StoreOptions::new().unknown_events(UnknownEventPolicy::Fail);
        let loader = seeded(3, options).await;
        let error = loader.load(&request(0, 3, 10)).await.unwrap_err();
        assert!(matches!(
            error,
            DaemonError::UnknownEventType(ref unknown) if unknown.sequence == 2
        ));
    }
}
