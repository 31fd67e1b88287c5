use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::domain::experiment::descriptor::{ExperimentDescriptor, ExperimentTemplate};
use crate::domain::experiment::status::ExperimentStatus;
use crate::domain::utils::id::{ExperimentId, UserId};
use crate::error::StoreError;

/// Durable holder of experiment descriptors.
///
/// Implementations serialise their own writes and never let a reader observe
/// a half-written descriptor. They do not guard status transitions; callers
/// go through [`LifecycleManager`](crate::domain::lifecycle::lifecycle_manager::LifecycleManager)
/// for that.
pub trait ExperimentStore: std::fmt::Debug + Send + Sync {
    /// All descriptors whose `[start, end)` intersects `[from, to)`.
    fn query_by_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<ExperimentDescriptor>, StoreError>;

    fn query_by_id(&self, id: ExperimentId) -> Result<Option<ExperimentDescriptor>, StoreError>;

    fn query_by_status(&self, status: ExperimentStatus) -> Result<Vec<ExperimentDescriptor>, StoreError>;

    /// Persists a new descriptor in status `Created` under a fresh id.
    fn add(&self, template: ExperimentTemplate, owner: UserId) -> Result<ExperimentDescriptor, StoreError>;

    /// Replaces the stored descriptor with the same id.
    fn update(&self, descriptor: &ExperimentDescriptor) -> Result<(), StoreError>;

    /// Earliest starting `Scheduled` experiment whose end lies after `now`.
    fn next_due(&self, now: DateTime<Utc>) -> Result<Option<ExperimentDescriptor>, StoreError> {
        Ok(self
            .query_by_status(ExperimentStatus::Scheduled)?
            .into_iter()
            .filter(|experiment| experiment.end() > now)
            .min_by_key(|experiment| (experiment.start(), experiment.id())))
    }
}

/// Ids, descriptors and the id counter shared by the store implementations.
#[derive(Debug)]
pub(crate) struct StoreState {
    pub next_id: u64,
    pub experiments: BTreeMap<ExperimentId, ExperimentDescriptor>,
}

impl StoreState {
    pub fn new(next_id: u64) -> Self {
        Self { next_id: next_id.max(1), experiments: BTreeMap::new() }
    }

    pub fn in_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<ExperimentDescriptor> {
        self.experiments.values().filter(|experiment| experiment.overlaps(from, to)).cloned().collect()
    }

    pub fn with_status(&self, status: ExperimentStatus) -> Vec<ExperimentDescriptor> {
        self.experiments.values().filter(|experiment| experiment.status() == status).cloned().collect()
    }
}

/// Volatile store, used for tests and simulations.
#[derive(Debug)]
pub struct InMemoryExperimentStore {
    inner: RwLock<StoreState>,
}

impl InMemoryExperimentStore {
    pub fn new() -> Self {
        Self { inner: RwLock::new(StoreState::new(1)) }
    }
}

impl Default for InMemoryExperimentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentStore for InMemoryExperimentStore {
    fn query_by_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<ExperimentDescriptor>, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.in_time_range(from, to))
    }

    fn query_by_id(&self, id: ExperimentId) -> Result<Option<ExperimentDescriptor>, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.experiments.get(&id).cloned())
    }

    fn query_by_status(&self, status: ExperimentStatus) -> Result<Vec<ExperimentDescriptor>, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.with_status(status))
    }

    fn add(&self, template: ExperimentTemplate, owner: UserId) -> Result<ExperimentDescriptor, StoreError> {
        let mut guard = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        let id = ExperimentId(guard.next_id);
        guard.next_id += 1;

        let descriptor = ExperimentDescriptor::new(id, template, owner);
        guard.experiments.insert(id, descriptor.clone());
        Ok(descriptor)
    }

    fn update(&self, descriptor: &ExperimentDescriptor) -> Result<(), StoreError> {
        let mut guard = self.inner.write().map_err(|_| StoreError::Poisoned)?;

        match guard.experiments.get_mut(&descriptor.id()) {
            Some(stored) => {
                *stored = descriptor.clone();
                Ok(())
            }
            None => Err(StoreError::UnknownExperiment(descriptor.id())),
        }
    }
}
