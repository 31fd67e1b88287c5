use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::domain::bus::in_process_bus::ArtifactPublisher;
use crate::domain::bus::message::ArtifactRetrievedEvent;
use crate::domain::scheduling::tracker_factory::TrackerFactory;
use crate::domain::store::artifact_area::ArtifactArea;
use crate::error::BusError;

/// Turns log directories appearing in the artifact area into
/// artifact-retrieved events for the live trackers.
#[derive(Debug)]
pub struct ArtifactPoller {
    artifacts: Arc<dyn ArtifactArea>,
    trackers: Arc<TrackerFactory>,
    publisher: ArtifactPublisher,
    interval: Duration,
}

impl ArtifactPoller {
    pub fn new(artifacts: Arc<dyn ArtifactArea>, trackers: Arc<TrackerFactory>, publisher: ArtifactPublisher, interval: Duration) -> Self {
        Self { artifacts, trackers, publisher, interval }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        log::warn!("Artifact poller stopped: {}", e);
                        break;
                    }
                }
            }
        }
    }

    /// Publishes one event per assigned node whose logs are on disk but
    /// unknown to its tracker. Log directories of other nodes are skipped.
    /// Returns the number of events published.
    pub async fn poll_once(&self) -> Result<usize, BusError> {
        let mut published = 0;

        for id in self.trackers.active_trackers() {
            let Some(tracker) = self.trackers.tracker(id) else { continue };

            let nodes = match self.artifacts.retrieved_nodes(id) {
                Ok(nodes) => nodes,
                Err(e) => {
                    log::warn!("[Experiment {}] Could not list retrieved logs: {}", id, e);
                    continue;
                }
            };

            for node in nodes.into_iter().filter(|node| tracker.expects(node) && !tracker.has_retrieved(node)) {
                self.publisher.publish(ArtifactRetrievedEvent::new(id, node)).await?;
                published += 1;
            }
        }

        Ok(published)
    }
}
