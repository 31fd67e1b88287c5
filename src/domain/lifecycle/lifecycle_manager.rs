use std::sync::Arc;

use crate::domain::experiment::descriptor::{ExperimentDescriptor, transition};
use crate::domain::experiment::status::ExperimentStatus;
use crate::domain::lifecycle::lock_registry::LockRegistry;
use crate::domain::statistics::{ANALYTICS_TARGET, StatParameter, StatisticEvent, add_global_event};
use crate::domain::store::experiment_store::ExperimentStore;
use crate::domain::utils::id::ExperimentId;
use crate::error::ExperimentError;

/// Who asked for a status change. Only used for logs and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Booking,
    Scheduler,
    Tracker,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Booking => "BOOKING",
            Component::Scheduler => "SCHEDULER",
            Component::Tracker => "TRACKER",
        }
    }
}

/// The only place experiment statuses are changed.
///
/// Every transition takes the experiment's lock, re-reads the descriptor from
/// the store, validates the move, persists it and only then releases the lock.
/// Callers therefore never act on a stale in-memory copy.
#[derive(Debug)]
pub struct LifecycleManager {
    store: Arc<dyn ExperimentStore>,
    locks: LockRegistry,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn ExperimentStore>) -> Self {
        Self { store, locks: LockRegistry::new() }
    }

    pub fn store(&self) -> &Arc<dyn ExperimentStore> {
        &self.store
    }

    pub fn transition(&self, id: ExperimentId, next: ExperimentStatus, component: Component) -> Result<ExperimentDescriptor, ExperimentError> {
        self.transition_checked(id, next, component, |_| Ok(()))
    }

    /// Like [`transition`](Self::transition), but runs `check` against the
    /// freshly read descriptor first. An error from `check` aborts before
    /// anything is written.
    pub fn transition_checked<F>(
        &self,
        id: ExperimentId,
        next: ExperimentStatus,
        component: Component,
        check: F,
    ) -> Result<ExperimentDescriptor, ExperimentError>
    where
        F: FnOnce(&ExperimentDescriptor) -> Result<(), ExperimentError>,
    {
        let (previous, descriptor) = self.locks.with_lock(id, || -> Result<_, ExperimentError> {
            let mut descriptor = self.store.query_by_id(id)?.ok_or(ExperimentError::NoSuchExperiment(id))?;
            check(&descriptor)?;

            let previous = transition(&mut descriptor, next)
                .map_err(|invalid| ExperimentError::InvalidTransition { id, from: invalid.from, to: invalid.to })?;
            self.store.update(&descriptor)?;

            Ok((previous, descriptor))
        })?;

        log::info!("[Experiment {}] {} -> {} ({}).", id, previous, next, component.as_str());
        record_transition(component, previous, &descriptor);

        Ok(descriptor)
    }

    /// Current status as persisted, read under the experiment's lock.
    pub fn current_status(&self, id: ExperimentId) -> Result<ExperimentStatus, ExperimentError> {
        self.locks.with_lock(id, || -> Result<_, ExperimentError> {
            let descriptor = self.store.query_by_id(id)?.ok_or(ExperimentError::NoSuchExperiment(id))?;
            Ok(descriptor.status())
        })
    }
}

fn record_transition(component: Component, previous: ExperimentStatus, descriptor: &ExperimentDescriptor) {
    tracing::info!(
        target: ANALYTICS_TARGET,
        LogDescription = "Status changed",
        Component = component.as_str(),
        ExperimentId = descriptor.id().value(),
        FromStatus = previous.as_str(),
        ToStatus = descriptor.status().as_str(),
    );

    let mut event = StatisticEvent::new();
    event
        .set(StatParameter::LogDescription, "Status changed")
        .set(StatParameter::Component, component.as_str())
        .set(StatParameter::ExperimentId, descriptor.id().value())
        .set(StatParameter::ExperimentName, descriptor.name())
        .set(StatParameter::FromStatus, previous.as_str())
        .set(StatParameter::ToStatus, descriptor.status().as_str())
        .set(StatParameter::NodeCount, descriptor.nodes().len());
    add_global_event(event);
}
