//! Per-shard progress records.
//!
//! Progress lives in the same `event_progression` table as the high-water
//! mark. Normal updates are optimistic: the writer presents the floor it read
//! and the update is rejected if the stored value moved in the meantime.

use std::sync::Arc;

use crate::{
    daemon::DaemonError,
    store::{EventStore, ShardProgress, StoreTransaction},
};

/// Reads and writes shard progress.
#[derive(Debug)]
pub struct ProgressTracker<S> {
    store: Arc<S>,
}

impl<S> Clone for ProgressTracker<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: EventStore> ProgressTracker<S> {
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Last recorded sequence, or `None` if the shard never recorded any.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn current(&self, shard: &str) -> Result<Option<i64>, S::Error> {
        Ok(self.store.fetch_progress(shard).await?.map(|p| p.sequence))
    }

    /// Every shard's progress.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn all(&self) -> Result<Vec<ShardProgress>, S::Error> {
        self.store.all_progress().await
    }

    /// Overwrite a shard's progress, bypassing the floor check.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn rewind(&self, shard: &str, sequence: i64) -> Result<(), S::Error> {
        tracing::info!(shard, sequence, "rewinding shard progress");
        self.store.rewind_progress(shard, sequence).await
    }

    /// Record `ceiling` inside `tx`, moving from `previous`.
    ///
    /// A shard with no previous record inserts one instead.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::ProgressOutOfOrder`] if the stored progress is
    /// no longer `previous`; the caller must drop `tx` and re-read.
    pub async fn record<T: StoreTransaction>(
        &self,
        tx: &mut T,
        shard: &str,
        previous: Option<i64>,
        ceiling: i64,
    ) -> Result<(), DaemonError<T::Error>> {
        let accepted = match previous {
            None => tx
                .insert_progress(shard, ceiling)
                .await
                .map_err(DaemonError::Store)?,
            Some(floor) => tx
                .update_progress(shard, floor, ceiling)
                .await
                .map_err(DaemonError::Store)?,
        };
        if accepted {
            Ok(())
        } else {
            Err(DaemonError::ProgressOutOfOrder {
                shard: shard.to_owned(),
                expected: previous,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::inmemory;

    #[tokio::test]
    async fn first_record_inserts_then_updates_from_floor() {
        let store = Arc::new(inmemory::Store::new());
        let tracker = ProgressTracker::new(Arc::clone(&store));
        assert_eq!(tracker.current("Trips:All").await.unwrap(), None);

        let mut tx = store.begin().await.unwrap();
        tracker
            .record(&mut tx, "Trips:All", None, 10)
            .await
            .unwrap();
        tracker
            .record(&mut tx, "Trips:All", Some(10), 25)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(tracker.current("Trips:All").await.unwrap(), Some(25));
    }

    #[tokio::test]
    async fn stale_floor_is_rejected() {
        let store = Arc::new(inmemory::Store::new());
        let tracker = ProgressTracker::new(Arc::clone(&store));
        tracker.rewind("Trips:All", 40).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let error = tracker
            .record(&mut tx, "Trips:All", Some(30), 50)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            DaemonError::ProgressOutOfOrder { expected: Some(30), .. }
        ));

        let error = tracker
            .record(&mut tx, "Trips:All", None, 50)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            DaemonError::ProgressOutOfOrder { expected: None, .. }
        ));
    }
}
