use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::bus::message::ArtifactRetrievedEvent;
use crate::domain::clock::duration_until;
use crate::domain::experiment::descriptor::ExperimentDescriptor;
use crate::domain::experiment::status::ExperimentStatus;
use crate::domain::lifecycle::lifecycle_manager::{Component, LifecycleManager};
use crate::domain::statistics::{ANALYTICS_TARGET, StatParameter, StatisticEvent, add_global_event};
use crate::domain::utils::id::{ExperimentId, NodeId};
use crate::error::ExperimentError;

/// What a tracker operation amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerOutcome {
    /// Still waiting for logs.
    Pending,
    /// This call committed the given terminal status.
    Resolved(ExperimentStatus),
    /// The experiment was resolved before, by this tracker or by someone else.
    AlreadyResolved,
    /// Committing the terminal status failed twice. The experiment stays
    /// `Running` until an operator or a restart intervenes.
    Stuck,
}

impl TrackerOutcome {
    pub fn is_final(self) -> bool {
        !matches!(self, TrackerOutcome::Pending)
    }
}

/// Time a tracker waits before giving up on missing logs:
/// `max(0, end - now) + grace_period`.
pub fn deadline_after(now: DateTime<Utc>, end: DateTime<Utc>, grace_period: Duration) -> Duration {
    duration_until(now, end) + grace_period
}

/// Decides `Done` or `FailedToRetrieveLogs` for one running experiment.
///
/// Both the completeness path and the deadline path go through a single
/// compare-and-swap on `resolved`, so exactly one of them reaches the
/// lifecycle manager, no matter which threads call in.
#[derive(Debug)]
pub struct CompletionTracker {
    experiment_id: ExperimentId,
    expected: HashSet<NodeId>,
    retrieved: Mutex<HashSet<NodeId>>,
    resolved: AtomicBool,
    lifecycle: Arc<LifecycleManager>,
}

impl CompletionTracker {
    pub fn new(descriptor: &ExperimentDescriptor, already_retrieved: impl IntoIterator<Item = NodeId>, lifecycle: Arc<LifecycleManager>) -> Self {
        let expected: HashSet<NodeId> = descriptor.node_ids().cloned().collect();
        let retrieved = already_retrieved.into_iter().filter(|node| expected.contains(node)).collect();

        Self { experiment_id: descriptor.id(), expected, retrieved: Mutex::new(retrieved), resolved: AtomicBool::new(false), lifecycle }
    }

    pub fn experiment_id(&self) -> ExperimentId {
        self.experiment_id
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    pub fn retrieved_count(&self) -> usize {
        self.retrieved.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether `node` is assigned to this experiment.
    pub fn expects(&self, node: &NodeId) -> bool {
        self.expected.contains(node)
    }

    pub fn has_retrieved(&self, node: &NodeId) -> bool {
        self.retrieved.lock().unwrap_or_else(PoisonError::into_inner).contains(node)
    }

    /// Records a node's logs. Events of other experiments and repeated
    /// events are ignored.
    pub fn on_artifact_retrieved(&self, event: &ArtifactRetrievedEvent) -> TrackerOutcome {
        if event.experiment_id != self.experiment_id {
            return TrackerOutcome::Pending;
        }
        if !self.expected.contains(&event.node_id) {
            log::warn!("[Experiment {}] Ignoring logs of node {}, which is not part of the experiment.", self.experiment_id, event.node_id);
            return TrackerOutcome::Pending;
        }

        let newly_added = self.retrieved.lock().unwrap_or_else(PoisonError::into_inner).insert(event.node_id.clone());
        if newly_added {
            log::debug!("[Experiment {}] Logs of node {} retrieved ({}/{}).", self.experiment_id, event.node_id, self.retrieved_count(), self.expected.len());
        }

        self.check_completion()
    }

    /// Resolves to `Done` once every assigned node delivered its logs.
    pub fn check_completion(&self) -> TrackerOutcome {
        if self.is_resolved() {
            return TrackerOutcome::AlreadyResolved;
        }

        let complete = {
            let retrieved = self.retrieved.lock().unwrap_or_else(PoisonError::into_inner);
            self.expected.iter().all(|node| retrieved.contains(node))
        };

        if complete { self.resolve(ExperimentStatus::Done) } else { TrackerOutcome::Pending }
    }

    /// The deadline passed. Resolves to `FailedToRetrieveLogs` unless the
    /// tracker or an operator already ended the experiment.
    pub fn on_deadline(&self) -> TrackerOutcome {
        if !self.is_resolved() {
            log::warn!(
                "[Experiment {}] Deadline reached with logs of {}/{} nodes.",
                self.experiment_id,
                self.retrieved_count(),
                self.expected.len()
            );
        }
        self.resolve(ExperimentStatus::FailedToRetrieveLogs)
    }

    fn resolve(&self, target: ExperimentStatus) -> TrackerOutcome {
        if self.resolved.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return TrackerOutcome::AlreadyResolved;
        }
        self.commit(target)
    }

    fn commit(&self, target: ExperimentStatus) -> TrackerOutcome {
        let id = self.experiment_id;
        let mut last_error = None;

        for attempt in 0..2 {
            let result = self.lifecycle.transition_checked(id, target, Component::Tracker, |descriptor| {
                if descriptor.status().is_finished() {
                    return Err(ExperimentError::InvalidState { id, status: descriptor.status() });
                }
                Ok(())
            });

            match result {
                Ok(_) => return TrackerOutcome::Resolved(target),
                Err(ExperimentError::InvalidState { status, .. }) | Err(ExperimentError::InvalidTransition { from: status, .. }) => {
                    log::info!("[Experiment {}] Already resolved as {}, not moving to {}.", id, status, target);
                    return TrackerOutcome::AlreadyResolved;
                }
                Err(ExperimentError::NoSuchExperiment(_)) => {
                    log::warn!("[Experiment {}] Vanished from the store before it could be resolved.", id);
                    return TrackerOutcome::AlreadyResolved;
                }
                Err(e) => {
                    if attempt == 0 {
                        log::warn!("[Experiment {}] Moving to {} failed, retrying once: {}", id, target, e);
                    }
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        self.report_stuck(target, &reason);
        TrackerOutcome::Stuck
    }

    fn report_stuck(&self, target: ExperimentStatus, reason: &str) {
        log::error!("[Experiment {}] STUCK in RUNNING: could not move to {}: {}. Operator attention required.", self.experiment_id, target, reason);

        tracing::warn!(
            target: ANALYTICS_TARGET,
            LogDescription = "Stuck experiment",
            Component = Component::Tracker.as_str(),
            ExperimentId = self.experiment_id.value(),
            ToStatus = target.as_str(),
            RetrievedCount = self.retrieved_count(),
        );

        let mut event = StatisticEvent::new();
        event
            .set(StatParameter::LogDescription, "Stuck experiment")
            .set(StatParameter::Component, Component::Tracker.as_str())
            .set(StatParameter::ExperimentId, self.experiment_id.value())
            .set(StatParameter::FromStatus, ExperimentStatus::Running.as_str())
            .set(StatParameter::ToStatus, target.as_str())
            .set(StatParameter::NodeCount, self.expected.len())
            .set(StatParameter::RetrievedCount, self.retrieved_count());
        add_global_event(event);
    }
}

/// Feeds a tracker from its event channel until it resolves or `deadline`
/// passes. Returns `Pending` only when shut down first.
pub async fn drive(
    tracker: Arc<CompletionTracker>,
    mut events: mpsc::UnboundedReceiver<ArtifactRetrievedEvent>,
    deadline: Instant,
    shutdown: CancellationToken,
) -> TrackerOutcome {
    let outcome = tracker.check_completion();
    if outcome.is_final() {
        return outcome;
    }

    let timer = tokio::time::sleep_until(deadline);
    tokio::pin!(timer);
    let mut events_open = true;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return TrackerOutcome::Pending,
            _ = &mut timer => return tracker.on_deadline(),
            event = events.recv(), if events_open => match event {
                Some(event) => {
                    let outcome = tracker.on_artifact_retrieved(&event);
                    if outcome.is_final() {
                        return outcome;
                    }
                }
                None => events_open = false,
            },
        }
    }
}
