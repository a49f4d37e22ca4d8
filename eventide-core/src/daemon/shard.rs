//! One async projection shard and its worker loop.

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    daemon::{
        DaemonError, DaemonSettings, ShardState,
        high_water::HighWaterStatistics,
        loader::{EventLoader, PageRequest},
        progress::ProgressTracker,
    },
    projection::{Projection, TransactionContext},
    store::{EventFilter, EventStore, StoreTransaction},
};

/// An async projection registered with the daemon.
pub struct ShardDefinition {
    /// Progress row name, `"{projection}:All"`.
    pub name: String,
    pub projection: Arc<dyn Projection>,
    pub filter: EventFilter,
}

impl std::fmt::Debug for ShardDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardDefinition")
            .field("name", &self.name)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

impl ShardDefinition {
    #[must_use]
    pub fn new(projection: Arc<dyn Projection>, filter: EventFilter) -> Self {
        Self {
            name: format!("{}:All", projection.name()),
            projection,
            filter,
        }
    }
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Progress already at the high-water mark.
    Idle,
    Advanced { ceiling: i64, events: usize },
}

pub(crate) struct ShardWorker<S> {
    pub(crate) store: Arc<S>,
    pub(crate) loader: EventLoader<S>,
    pub(crate) progress: ProgressTracker<S>,
    pub(crate) shard: Arc<ShardDefinition>,
    pub(crate) settings: DaemonSettings,
    pub(crate) state: Arc<watch::Sender<ShardState>>,
    pub(crate) high_water: watch::Receiver<HighWaterStatistics>,
    pub(crate) stop: watch::Receiver<bool>,
}

impl<S: EventStore> ShardWorker<S> {
    pub(crate) async fn run(mut self) {
        let shard = self.shard.name.clone();
        self.state.send_replace(ShardState::Running);
        tracing::info!(%shard, "shard started");

        loop {
            if *self.stop.borrow() {
                break;
            }
            let mark = self.high_water.borrow_and_update().mark;

            let stop_requested = match self.step(mark).await {
                Ok(Step::Advanced { ceiling, events }) => {
                    tracing::debug!(%shard, ceiling, events, "shard advanced");
                    false
                }
                Ok(Step::Idle) => self.wait(self.settings.poll_interval).await,
                Err(DaemonError::ProgressOutOfOrder { expected, .. }) => {
                    tracing::debug!(%shard, ?expected, "progress moved underneath shard, re-reading");
                    false
                }
                Err(error) => {
                    tracing::error!(%shard, %error, "shard iteration failed, backing off");
                    self.wait(self.settings.error_backoff).await
                }
            };
            if stop_requested {
                break;
            }
        }

        self.state.send_replace(ShardState::Stopped);
        tracing::info!(%shard, "shard stopped");
    }

    /// Sleep for `duration`, waking early when the mark moves. Returns `true`
    /// if the shard was asked to stop.
    async fn wait(&mut self, duration: std::time::Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.changed() => true,
            _ = self.high_water.changed() => false,
            () = tokio::time::sleep(duration) => false,
        }
    }

    /// Load one page above the shard's progress and apply it together with
    /// the progress update in a single transaction.
    pub(crate) async fn step(&self, mark: i64) -> Result<Step, DaemonError<S::Error>> {
        let shard = &self.shard.name;
        let previous = self
            .progress
            .current(shard)
            .await
            .map_err(DaemonError::Store)?;
        let floor = previous.unwrap_or(0);
        if mark <= floor {
            return Ok(Step::Idle);
        }

        let page = self
            .loader
            .load(&PageRequest {
                floor,
                high_water: mark,
                batch_size: self.settings.batch_size,
                filter: self.shard.filter.clone(),
            })
            .await?;
        if !page.advances() {
            return Ok(Step::Idle);
        }

        let mut tx = self.store.begin().await.map_err(DaemonError::Store)?;
        if !page.events.is_empty() {
            let mut ctx = TransactionContext::new(&mut tx);
            self.shard
                .projection
                .apply(&mut ctx, &page.events)
                .await
                .map_err(DaemonError::Projection)?;
        }
        self.progress
            .record(&mut tx, shard, previous, page.ceiling)
            .await?;
        tx.commit().await.map_err(DaemonError::Store)?;

        Ok(Step::Advanced {
            ceiling: page.ceiling,
            events: page.events.len(),
        })
    }
}
