use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::bus::message::ArtifactRetrievedEvent;
use crate::domain::clock::SharedClock;
use crate::domain::experiment::descriptor::ExperimentDescriptor;
use crate::domain::experiment::status::ExperimentStatus;
use crate::domain::lifecycle::lifecycle_manager::LifecycleManager;
use crate::domain::scheduling::completion_tracker::{CompletionTracker, TrackerOutcome, deadline_after, drive};
use crate::domain::scheduling::jittered;
use crate::domain::store::artifact_area::ArtifactArea;
use crate::domain::utils::id::ExperimentId;

#[derive(Debug)]
struct TrackerRoute {
    tracker: Arc<CompletionTracker>,
    events: mpsc::UnboundedSender<ArtifactRetrievedEvent>,
}

/// Owns the live completion trackers and routes artifact events to them.
///
/// Each tracker runs as its own task fed by a private channel. The factory is
/// the single consumer of the shared artifact stream and forwards every event
/// to the channel of the experiment it names. A tracker leaves the routing
/// table as soon as it resolves.
#[derive(Debug)]
pub struct TrackerFactory {
    lifecycle: Arc<LifecycleManager>,
    artifacts: Arc<dyn ArtifactArea>,
    clock: SharedClock,
    grace_period: Duration,
    store_retry_backoff: Duration,
    routes: Mutex<HashMap<ExperimentId, TrackerRoute>>,
    shutdown: CancellationToken,
}

impl TrackerFactory {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        artifacts: Arc<dyn ArtifactArea>,
        clock: SharedClock,
        grace_period: Duration,
        store_retry_backoff: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self { lifecycle, artifacts, clock, grace_period, store_retry_backoff, routes: Mutex::new(HashMap::new()), shutdown }
    }

    /// Starts tracking a running experiment. The retrieved set is seeded from
    /// the artifact area. Registering an experiment twice returns the live
    /// tracker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(self: &Arc<Self>, descriptor: &ExperimentDescriptor) -> Arc<CompletionTracker> {
        let id = descriptor.id();
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(route) = routes.get(&id) {
            return route.tracker.clone();
        }

        let already_retrieved = self.artifacts.retrieved_nodes(id).unwrap_or_else(|e| {
            log::warn!("[Experiment {}] Could not read retrieved logs, starting empty: {}", id, e);
            Vec::new()
        });

        let tracker = Arc::new(CompletionTracker::new(descriptor, already_retrieved, self.lifecycle.clone()));
        let wait = deadline_after(self.clock.now(), descriptor.end(), self.grace_period);
        let (tx, rx) = mpsc::unbounded_channel();
        routes.insert(id, TrackerRoute { tracker: tracker.clone(), events: tx });
        drop(routes);

        log::info!(
            "[Experiment {}] Tracking logs of {} nodes ({} already retrieved), deadline in {}s.",
            id,
            descriptor.nodes().len(),
            tracker.retrieved_count(),
            wait.as_secs()
        );

        let factory = Arc::clone(self);
        let driven = tracker.clone();
        tokio::spawn(async move {
            let outcome = drive(driven, rx, Instant::now() + wait, factory.shutdown.clone()).await;
            factory.retire(id, outcome);
        });

        tracker
    }

    fn retire(&self, id: ExperimentId, outcome: TrackerOutcome) {
        if !outcome.is_final() {
            return;
        }
        self.routes.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        log::debug!("[Experiment {}] Tracker retired: {:?}.", id, outcome);
    }

    /// Rebuilds a tracker for every experiment found `Running`, retrying
    /// while the store is unavailable. Returns the number of trackers built.
    pub async fn recover(self: &Arc<Self>) -> usize {
        let running = loop {
            match self.lifecycle.store().query_by_status(ExperimentStatus::Running) {
                Ok(running) => break running,
                Err(e) => {
                    log::warn!("Recovery: store unavailable, retrying: {}", e);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return 0,
                        _ = tokio::time::sleep(jittered(self.store_retry_backoff)) => {}
                    }
                }
            }
        };

        for descriptor in &running {
            self.register(descriptor);
        }

        if !running.is_empty() {
            log::info!("Recovery: rebuilt {} completion trackers.", running.len());
        }
        running.len()
    }

    /// Forwards artifact events until shutdown or until every publisher is gone.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ArtifactRetrievedEvent>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.route(event),
                    None => break,
                },
            }
        }
        log::debug!("Artifact event router stopped.");
    }

    /// Hands one event to the tracker of its experiment, if any is live.
    pub fn route(&self, event: ArtifactRetrievedEvent) {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        match routes.get(&event.experiment_id) {
            Some(route) => {
                // A closed channel means the tracker resolved meanwhile.
                let _ = route.events.send(event);
            }
            None => log::debug!("[Experiment {}] No live tracker for logs of node {}.", event.experiment_id, event.node_id),
        }
    }

    pub fn active_trackers(&self) -> Vec<ExperimentId> {
        let mut ids: Vec<_> = self.routes.lock().unwrap_or_else(PoisonError::into_inner).keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn tracker(&self, id: ExperimentId) -> Option<Arc<CompletionTracker>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner).get(&id).map(|route| route.tracker.clone())
    }
}
