use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::bus::in_process_bus::PreparationDispatcher;
use crate::domain::bus::message::{InvocationMethod, PreparationMessage};
use crate::domain::clock::{SharedClock, duration_until};
use crate::domain::experiment::descriptor::ExperimentDescriptor;
use crate::domain::experiment::status::ExperimentStatus;
use crate::domain::lifecycle::lifecycle_manager::{Component, LifecycleManager};
use crate::domain::scheduling::jittered;
use crate::domain::scheduling::tracker_factory::TrackerFactory;
use crate::error::ExperimentError;

/// Cheap, cloneable way to make the engine re-evaluate.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    wakeup: Arc<Notify>,
}

impl SchedulerHandle {
    /// Never blocks. Calls made while a wakeup is already pending collapse
    /// into that one, and a call made before the engine listens is kept
    /// until it does.
    pub fn wakeup(&self) {
        self.wakeup.notify_one();
    }
}

/// Activates scheduled experiments one at a time, never before their start.
///
/// The store is the source of truth: after every wakeup, timeout or failure
/// the loop asks it again for the next due experiment instead of trusting a
/// previously computed candidate.
#[derive(Debug)]
pub struct SchedulingEngine {
    lifecycle: Arc<LifecycleManager>,
    trackers: Arc<TrackerFactory>,
    dispatcher: Arc<dyn PreparationDispatcher>,
    clock: SharedClock,
    wakeup: Arc<Notify>,
    store_retry_backoff: Duration,
}

enum Wait {
    Shutdown,
    Reevaluate,
}

impl SchedulingEngine {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        trackers: Arc<TrackerFactory>,
        dispatcher: Arc<dyn PreparationDispatcher>,
        clock: SharedClock,
        store_retry_backoff: Duration,
    ) -> Self {
        Self { lifecycle, trackers, dispatcher, clock, wakeup: Arc::new(Notify::new()), store_retry_backoff }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle { wakeup: self.wakeup.clone() }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        log::info!("Scheduling engine started.");

        loop {
            let next = match self.lifecycle.store().next_due(self.clock.now()) {
                Ok(next) => next,
                Err(e) => {
                    log::warn!("Scheduler: querying the next experiment failed, backing off: {}", e);
                    match self.back_off(&shutdown).await {
                        Wait::Shutdown => break,
                        Wait::Reevaluate => continue,
                    }
                }
            };

            let wait = match &next {
                None => self.wait_for_wakeup(&shutdown, None).await,
                Some(candidate) => {
                    let until_start = duration_until(self.clock.now(), candidate.start());
                    if until_start.is_zero() {
                        if let Err(e) = self.activate(candidate).await {
                            self.on_activation_failed(candidate, e, &shutdown).await
                        } else {
                            Wait::Reevaluate
                        }
                    } else {
                        log::debug!("[Experiment {}] Next due, starting in {}s.", candidate.id(), until_start.as_secs());
                        self.wait_for_wakeup(&shutdown, Some(until_start)).await
                    }
                }
            };

            if let Wait::Shutdown = wait {
                break;
            }
        }

        log::info!("Scheduling engine stopped.");
    }

    async fn wait_for_wakeup(&self, shutdown: &CancellationToken, timeout: Option<Duration>) -> Wait {
        match timeout {
            None => tokio::select! {
                _ = shutdown.cancelled() => Wait::Shutdown,
                _ = self.wakeup.notified() => Wait::Reevaluate,
            },
            Some(timeout) => tokio::select! {
                _ = shutdown.cancelled() => Wait::Shutdown,
                _ = self.wakeup.notified() => Wait::Reevaluate,
                _ = tokio::time::sleep(timeout) => Wait::Reevaluate,
            },
        }
    }

    async fn back_off(&self, shutdown: &CancellationToken) -> Wait {
        tokio::select! {
            _ = shutdown.cancelled() => Wait::Shutdown,
            _ = tokio::time::sleep(jittered(self.store_retry_backoff)) => Wait::Reevaluate,
        }
    }

    /// Moves the candidate to `Running`, starts tracking it and tells the
    /// nodes to prepare it.
    async fn activate(&self, candidate: &ExperimentDescriptor) -> Result<(), ExperimentError> {
        let id = candidate.id();
        let now = self.clock.now();

        let running = self.lifecycle.transition_checked(id, ExperimentStatus::Running, Component::Scheduler, |current| {
            if current.start() > now {
                return Err(ExperimentError::IllegalTime { id: Some(id), reason: "start time has not arrived" });
            }
            Ok(())
        })?;

        // Registered first, so logs arriving right after the dispatch are not missed.
        self.trackers.register(&running);

        let message = PreparationMessage::for_experiment(&running, InvocationMethod::Start);
        if let Err(e) = self.dispatcher.dispatch(message).await {
            log::error!("[Experiment {}] Could not dispatch preparation: {}", id, e);
        }

        Ok(())
    }

    async fn on_activation_failed(&self, candidate: &ExperimentDescriptor, error: ExperimentError, shutdown: &CancellationToken) -> Wait {
        match error {
            ExperimentError::InvalidTransition { from, .. } => {
                log::info!("[Experiment {}] Changed to {} before activation, skipping.", candidate.id(), from);
                Wait::Reevaluate
            }
            e => {
                log::warn!("[Experiment {}] Activation failed, backing off: {}", candidate.id(), e);
                self.back_off(shutdown).await
            }
        }
    }
}
