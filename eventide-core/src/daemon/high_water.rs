//! High-water mark detection.
//!
//! Sequences are allocated before commit, so a slow or rolled-back
//! transaction leaves a hole that later commits can overtake. The mark is the
//! highest sequence *S* such that every sequence up to *S* is either committed
//! or known to be permanently lost; async shards never read past it.
//!
//! [`detect`](HighWaterDetector::detect) only advances over contiguous
//! sequences. [`detect_in_safe_zone`](HighWaterDetector::detect_in_safe_zone)
//! additionally jumps over a gap once the mark has been stalled for longer
//! than the stale threshold, and flags the result with `includes_skipping`.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::store::EventStore;

/// Result of one detection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HighWaterStatistics {
    /// The persisted mark after this pass.
    pub mark: i64,
    /// Highest committed sequence seen by this pass.
    pub highest_sequence: i64,
    /// The persisted mark before this pass.
    pub previous_mark: i64,
    /// When the persisted mark last advanced.
    pub last_updated: Option<DateTime<Utc>>,
    /// The mark was moved over a gap rather than along contiguous sequences.
    pub includes_skipping: bool,
}

impl HighWaterStatistics {
    /// Committed events exist beyond the mark.
    #[must_use]
    pub const fn has_gap(&self) -> bool {
        self.mark < self.highest_sequence
    }

    #[must_use]
    pub const fn advanced(&self) -> bool {
        self.mark > self.previous_mark
    }
}

/// Computes and persists the high-water mark.
#[derive(Debug)]
pub struct HighWaterDetector<S> {
    store: Arc<S>,
    stale_threshold: Duration,
    scan_batch: usize,
}

impl<S: EventStore> HighWaterDetector<S> {
    #[must_use]
    pub fn new(store: Arc<S>, stale_threshold: Duration, scan_batch: usize) -> Self {
        Self {
            store,
            stale_threshold,
            scan_batch: scan_batch.max(1),
        }
    }

    /// Advance the mark over contiguous committed sequences only.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn detect(&self) -> Result<HighWaterStatistics, S::Error> {
        self.run(false).await
    }

    /// Like [`detect`](Self::detect), but skip to the highest committed
    /// sequence if the mark has not advanced within the stale threshold.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn detect_in_safe_zone(&self) -> Result<HighWaterStatistics, S::Error> {
        self.run(true).await
    }

    #[tracing::instrument(skip(self))]
    async fn run(&self, safe_zone: bool) -> Result<HighWaterStatistics, S::Error> {
        let previous = self.store.fetch_high_water().await?;
        let previous_mark = previous.map_or(0, |row| row.mark);
        let highest = self.store.highest_sequence().await?;

        let mut candidate = self.contiguous_from(previous_mark, highest).await?;
        let mut includes_skipping = false;

        if safe_zone
            && candidate < highest
            && let Some(row) = previous
            && self.is_stale(row.last_updated)
        {
            tracing::warn!(
                from = candidate,
                to = highest,
                stalled_since = %row.last_updated,
                "high-water mark stalled on a gap, skipping ahead"
            );
            candidate = highest;
            includes_skipping = true;
        }

        let saved = self
            .store
            .save_high_water(candidate, highest, Utc::now())
            .await?;

        let statistics = HighWaterStatistics {
            mark: saved.mark,
            highest_sequence: highest,
            previous_mark,
            last_updated: Some(saved.last_updated),
            includes_skipping,
        };
        if statistics.advanced() {
            tracing::debug!(
                mark = statistics.mark,
                previous = previous_mark,
                highest,
                "high-water mark advanced"
            );
        }
        Ok(statistics)
    }

    /// Walk committed sequences upward from `mark` while they stay contiguous.
    async fn contiguous_from(&self, mark: i64, highest: i64) -> Result<i64, S::Error> {
        let mut mark = mark;
        while mark < highest {
            let batch = self.store.sequences_after(mark, self.scan_batch).await?;
            let full = batch.len() == self.scan_batch;
            for sequence in batch {
                if sequence != mark + 1 {
                    return Ok(mark);
                }
                mark = sequence;
            }
            if !full {
                break;
            }
        }
        Ok(mark)
    }

    fn is_stale(&self, last_updated: DateTime<Utc>) -> bool {
        (Utc::now() - last_updated)
            .to_std()
            .is_ok_and(|elapsed| elapsed > self.stale_threshold)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;

    use super::*;
    use crate::{
        event::{Event, StreamId},
        store::{NewStream, StoreTransaction, inmemory},
    };

    async fn seed(store: &inmemory::Store, count: i64) {
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
                id: uuid::Uuid::new_v4(),
                stream_id: id.clone(),
                version,
                alias: "ping".into(),
                type_name: "Ping".into(),
                data: serde_json::Value::Null,
                timestamp: Utc::now(),
                tenant_id: "*DEFAULT*".into(),
                is_archived: false,
            })
            .collect();
        tx.insert_events(&events).await.unwrap();
        tx.commit().await.unwrap();
    }

    fn detector(store: &inmemory::Store, scan_batch: usize) -> HighWaterDetector<inmemory::Store> {
        HighWaterDetector::new(Arc::new(store.clone()), Duration::from_secs(3), scan_batch)
    }

    #[tokio::test]
    async fn empty_store_has_zero_mark() {
        let store = inmemory::Store::new();
        let stats = detector(&store, 10).detect().await.unwrap();
        assert_eq!(stats.mark, 0);
        assert_eq!(stats.highest_sequence, 0);
        assert!(!stats.includes_skipping);
    }

    #[tokio::test]
    async fn contiguous_sequences_advance_across_scan_batches() {
        let store = inmemory::Store::new();
        seed(&store, 25).await;
        let stats = detector(&store, 4).detect().await.unwrap();
        assert_eq!(stats.mark, 25);
        assert_eq!(stats.previous_mark, 0);
        assert!(!stats.has_gap());
    }

    #[tokio::test]
    async fn gap_holds_the_mark_until_stale() {
        let store = inmemory::Store::new();
        seed(&store, 10).await;
        store.remove_events(&[4, 5, 6]).await;
        let detector = detector(&store, 3);

        let stats = detector.detect().await.unwrap();
        assert_eq!(stats.mark, 3);
        assert_eq!(stats.highest_sequence, 10);

        // Not stale yet: safe zone must not skip.
        let stats = detector.detect_in_safe_zone().await.unwrap();
        assert_eq!(stats.mark, 3);
        assert!(!stats.includes_skipping);

        store
            .set_high_water_updated(Utc::now() - TimeDelta::seconds(10))
            .await;
        let stats = detector.detect_in_safe_zone().await.unwrap();
        assert_eq!(stats.mark, 10);
        assert_eq!(stats.previous_mark, 3);
        assert!(stats.includes_skipping);
    }

    #[tokio::test]
    async fn mark_never_moves_backwards() {
        let store = inmemory::Store::new();
        seed(&store, 5).await;
        let detector = detector(&store, 10);
        assert_eq!(detector.detect().await.unwrap().mark, 5);

        store.remove_events(&[3, 4, 5]).await;
        let stats = detector.detect().await.unwrap();
        assert_eq!(stats.mark, 5);
        assert_eq!(stats.previous_mark, 5);
    }
}
