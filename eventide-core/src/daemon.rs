//! Async projection daemon.
//!
//! The daemon runs one tokio task per async projection ("shard") plus a
//! high-water agent that periodically detects and publishes the high-water
//! mark. Each shard loop reads its progress, loads the next page of events
//! below the mark, applies the projection and records the new progress in
//! the same transaction. A crash at any point therefore leaves progress and
//! projected documents consistent, and the shard re-processes at most the
//! page it was working on.
//!
//! Shutdown is cooperative: [`stop_all`](ProjectionDaemon::stop_all) signals
//! every task over a watch channel and waits for the current page to finish.
//!
//! ```ignore
//! let daemon = repo.build_daemon(DaemonSettings::default());
//! daemon.start_all().await?;
//! daemon.catch_up(Duration::from_secs(10)).await?;
//! daemon.stop_all().await;
//! ```

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};

use crate::{
    event::UnknownEventType,
    options::StoreOptions,
    projection::ProjectionError,
    store::{EventStore, ShardProgress},
};

pub mod high_water;
pub mod loader;
pub mod progress;
pub mod shard;

pub use high_water::{HighWaterDetector, HighWaterStatistics};
pub use loader::{EventLoader, EventPage, PageRequest};
pub use progress::ProgressTracker;
pub use shard::ShardDefinition;
use shard::ShardWorker;

/// Errors raised by the daemon and its shards.
#[derive(Debug, Error)]
pub enum DaemonError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    #[error("projection failed: {0}")]
    Projection(#[source] ProjectionError),
    #[error(transparent)]
    UnknownEventType(#[from] UnknownEventType),
    /// Handled inside the shard loop; only visible to direct callers of the
    /// progress tracker.
    #[error("progress for shard `{shard}` is no longer at {expected:?}")]
    ProgressOutOfOrder {
        shard: String,
        expected: Option<i64>,
    },
    #[error("shards did not catch up to the high-water mark within {timeout:?}")]
    CatchUpTimeout { timeout: Duration },
    #[error("no async projection shard named `{0}`")]
    UnknownShard(String),
    #[error("daemon task `{task}` panicked")]
    TaskPanicked { task: String },
}

/// Lifecycle of a shard worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ShardState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ShardState {
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

/// Daemon tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonSettings {
    /// Maximum events per page.
    pub batch_size: usize,
    /// Sleep between polls when a shard is caught up.
    pub poll_interval: Duration,
    /// Interval between high-water detections.
    pub detection_interval: Duration,
    /// How long the mark may stall on a gap before safe-zone detection skips
    /// over it.
    pub stale_threshold: Duration,
    /// Sleep after a failed shard iteration.
    pub error_backoff: Duration,
    /// Sequences fetched per query while scanning for gaps.
    pub gap_scan_batch: usize,
    /// How often `catch_up` re-reads shard progress.
    pub catch_up_poll: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            poll_interval: Duration::from_millis(250),
            detection_interval: Duration::from_secs(1),
            stale_threshold: Duration::from_secs(3),
            error_backoff: Duration::from_secs(1),
            gap_scan_batch: 1000,
            catch_up_poll: Duration::from_millis(50),
        }
    }
}

impl DaemonSettings {
    /// Maximum events per page. Zero is raised to one.
    #[must_use]
    pub const fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = if batch_size == 0 { 1 } else { batch_size };
        self
    }

    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn detection_interval(mut self, interval: Duration) -> Self {
        self.detection_interval = interval;
        self
    }

    #[must_use]
    pub const fn stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    #[must_use]
    pub const fn gap_scan_batch(mut self, batch: usize) -> Self {
        self.gap_scan_batch = batch;
        self
    }

    #[must_use]
    pub const fn catch_up_poll(mut self, interval: Duration) -> Self {
        self.catch_up_poll = interval;
        self
    }
}

/// A running background task and its stop signal.
struct Agent {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Agent {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    async fn shutdown<E: std::error::Error + 'static>(self, name: &str) -> Result<(), DaemonError<E>> {
        self.stop.send_replace(true);
        self.task.await.map_err(|error| {
            tracing::error!(task = name, %error, "daemon task panicked");
            DaemonError::TaskPanicked {
                task: name.to_owned(),
            }
        })
    }
}

/// Detect once, escalating to safe-zone detection while a gap is present, and
/// publish the result if the mark moved.
async fn refresh_high_water<S: EventStore>(
    detector: &HighWaterDetector<S>,
    published: &watch::Sender<HighWaterStatistics>,
) -> Result<HighWaterStatistics, S::Error> {
    let mut statistics = detector.detect().await?;
    if statistics.has_gap() {
        statistics = detector.detect_in_safe_zone().await?;
    }
    published.send_if_modified(|current| {
        if statistics.mark < current.mark {
            return false;
        }
        let advanced = statistics.mark > current.mark;
        *current = statistics;
        advanced
    });
    Ok(statistics)
}

async fn run_high_water_agent<S: EventStore>(
    detector: Arc<HighWaterDetector<S>>,
    published: Arc<watch::Sender<HighWaterStatistics>>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    tracing::info!("high-water agent started");
    loop {
        if let Err(error) = refresh_high_water(&detector, &published).await {
            tracing::error!(%error, "high-water detection failed");
        }
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    tracing::info!("high-water agent stopped");
}

/// Runs async projections.
pub struct ProjectionDaemon<S: EventStore> {
    store: Arc<S>,
    options: Arc<StoreOptions>,
    settings: DaemonSettings,
    detector: Arc<HighWaterDetector<S>>,
    progress: ProgressTracker<S>,
    high_water: Arc<watch::Sender<HighWaterStatistics>>,
    states: BTreeMap<String, Arc<watch::Sender<ShardState>>>,
    workers: Mutex<BTreeMap<String, Agent>>,
    agent: Mutex<Option<Agent>>,
}

impl<S: EventStore> std::fmt::Debug for ProjectionDaemon<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionDaemon")
            .field("settings", &self.settings)
            .field("shards", &self.statuses())
            .finish_non_exhaustive()
    }
}

impl<S: EventStore> ProjectionDaemon<S> {
    #[must_use]
    pub fn new(store: Arc<S>, options: Arc<StoreOptions>, settings: DaemonSettings) -> Self {
        let detector = Arc::new(HighWaterDetector::new(
            Arc::clone(&store),
            settings.stale_threshold,
            settings.gap_scan_batch,
        ));
        let states = options
            .shards
            .iter()
            .map(|shard| {
                let (state, _) = watch::channel(ShardState::Stopped);
                (shard.name.clone(), Arc::new(state))
            })
            .collect();
        let (high_water, _) = watch::channel(HighWaterStatistics::default());

        Self {
            progress: ProgressTracker::new(Arc::clone(&store)),
            store,
            options,
            settings,
            detector,
            high_water: Arc::new(high_water),
            states,
            workers: Mutex::new(BTreeMap::new()),
            agent: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    /// Names of every configured shard.
    #[must_use]
    pub fn shard_names(&self) -> Vec<&str> {
        self.states.keys().map(String::as_str).collect()
    }

    /// Current state of a shard, or `None` if no shard has this name.
    #[must_use]
    pub fn status(&self, name: &str) -> Option<ShardState> {
        self.states.get(name).map(|state| *state.borrow())
    }

    /// Current state of every shard.
    #[must_use]
    pub fn statuses(&self) -> BTreeMap<String, ShardState> {
        self.states
            .iter()
            .map(|(name, state)| (name.clone(), *state.borrow()))
            .collect()
    }

    /// Subscribe to a shard's state transitions.
    #[must_use]
    pub fn watch_shard(&self, name: &str) -> Option<watch::Receiver<ShardState>> {
        self.states.get(name).map(|state| state.subscribe())
    }

    /// Most recently published high-water statistics.
    #[must_use]
    pub fn high_water(&self) -> HighWaterStatistics {
        *self.high_water.borrow()
    }

    /// Run one detection pass now and publish the result.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn detect_high_water(&self) -> Result<HighWaterStatistics, DaemonError<S::Error>> {
        refresh_high_water(&self.detector, &self.high_water)
            .await
            .map_err(DaemonError::Store)
    }

    /// Start the high-water agent and every shard.
    ///
    /// Shards that are already running are left alone.
    pub async fn start_all(&self) {
        self.ensure_agent().await;
        let shards: Vec<_> = self.options.shards.clone();
        for shard in &shards {
            self.launch(shard).await;
        }
    }

    /// Start one shard (and the high-water agent, if needed).
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::UnknownShard`] if no shard has this name.
    pub async fn start_shard(&self, name: &str) -> Result<(), DaemonError<S::Error>> {
        let shard = self
            .options
            .shards
            .iter()
            .find(|shard| shard.name == name)
            .cloned()
            .ok_or_else(|| DaemonError::UnknownShard(name.to_owned()))?;
        self.ensure_agent().await;
        self.launch(&shard).await;
        Ok(())
    }

    /// Stop one shard after its current page.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::UnknownShard`] if no shard has this name, or
    /// [`DaemonError::TaskPanicked`] if its task panicked.
    pub async fn stop_shard(&self, name: &str) -> Result<(), DaemonError<S::Error>> {
        let state = self
            .states
            .get(name)
            .ok_or_else(|| DaemonError::UnknownShard(name.to_owned()))?;
        let worker = self.workers.lock().await.remove(name);
        let result = match worker {
            Some(worker) => {
                state.send_replace(ShardState::Stopping);
                worker.shutdown(name).await
            }
            None => Ok(()),
        };
        state.send_replace(ShardState::Stopped);
        result
    }

    /// Stop every shard and the high-water agent, letting in-flight pages
    /// finish. Panicked tasks are logged and otherwise ignored.
    pub async fn stop_all(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for name in workers.keys() {
            if let Some(state) = self.states.get(name) {
                state.send_replace(ShardState::Stopping);
            }
        }
        for (name, worker) in workers {
            let _ = worker.shutdown::<S::Error>(&name).await;
            if let Some(state) = self.states.get(&name) {
                state.send_replace(ShardState::Stopped);
            }
        }

        let agent = self.agent.lock().await.take();
        if let Some(agent) = agent {
            let _ = agent.shutdown::<S::Error>("high-water").await;
        }
        tracing::info!("projection daemon stopped");
    }

    /// Wait until every running shard has recorded progress at or beyond the
    /// high-water mark detected at the start of the call.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::CatchUpTimeout`] if that does not happen within
    /// `timeout`, or a backend failure.
    pub async fn catch_up(&self, timeout: Duration) -> Result<HighWaterStatistics, DaemonError<S::Error>> {
        let wait = async {
            let target = self.detect_high_water().await?;
            tracing::debug!(mark = target.mark, "waiting for shards to catch up");
            loop {
                let mut behind = None;
                for (name, state) in &self.states {
                    if !state.borrow().is_active() {
                        continue;
                    }
                    let progress = self
                        .progress
                        .current(name)
                        .await
                        .map_err(DaemonError::Store)?
                        .unwrap_or(0);
                    if progress < target.mark {
                        behind = Some((name, progress));
                        break;
                    }
                }
                let Some((name, progress)) = behind else {
                    return Ok(target);
                };
                tracing::trace!(shard = %name, progress, mark = target.mark, "shard still behind");
                tokio::time::sleep(self.settings.catch_up_poll).await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| DaemonError::CatchUpTimeout { timeout })?
    }

    /// Reset a shard's recorded progress to `sequence`, bypassing the floor
    /// check. A running shard notices on its next progress update and
    /// continues from the new floor.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::UnknownShard`] if no shard has this name, or a
    /// backend failure.
    pub async fn rewind(&self, name: &str, sequence: i64) -> Result<(), DaemonError<S::Error>> {
        if !self.states.contains_key(name) {
            return Err(DaemonError::UnknownShard(name.to_owned()));
        }
        self.progress
            .rewind(name, sequence)
            .await
            .map_err(DaemonError::Store)
    }

    /// Recorded progress of every shard.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn progress(&self) -> Result<Vec<ShardProgress>, DaemonError<S::Error>> {
        self.progress.all().await.map_err(DaemonError::Store)
    }

    async fn ensure_agent(&self) {
        let mut agent = self.agent.lock().await;
        if agent.as_ref().is_some_and(Agent::is_alive) {
            return;
        }
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_high_water_agent(
            Arc::clone(&self.detector),
            Arc::clone(&self.high_water),
            self.settings.detection_interval,
            stop_rx,
        ));
        *agent = Some(Agent { stop, task });
    }

    async fn launch(&self, shard: &Arc<ShardDefinition>) {
        let Some(state) = self.states.get(&shard.name) else {
            return;
        };
        let mut workers = self.workers.lock().await;
        if workers.get(&shard.name).is_some_and(Agent::is_alive) {
            return;
        }

        state.send_replace(ShardState::Starting);
        let (stop, stop_rx) = watch::channel(false);
        let worker = ShardWorker {
            store: Arc::clone(&self.store),
            loader: EventLoader::new(Arc::clone(&self.store), Arc::clone(&self.options)),
            progress: self.progress.clone(),
            shard: Arc::clone(shard),
            settings: self.settings.clone(),
            state: Arc::clone(state),
            high_water: self.high_water.subscribe(),
            stop: stop_rx,
        };
        let task = tokio::spawn(worker.run());
        workers.insert(shard.name.clone(), Agent { stop, task });
    }
}
