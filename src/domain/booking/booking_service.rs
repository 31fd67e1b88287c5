use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::bus::in_process_bus::PreparationDispatcher;
use crate::domain::bus::message::{InvocationMethod, PreparationMessage};
use crate::domain::clock::SharedClock;
use crate::domain::experiment::descriptor::{ExperimentDescriptor, ExperimentTemplate};
use crate::domain::experiment::status::ExperimentStatus;
use crate::domain::inventory::HardwareInventory;
use crate::domain::lifecycle::lifecycle_manager::{Component, LifecycleManager};
use crate::domain::scheduling::scheduling_engine::SchedulerHandle;
use crate::domain::store::artifact_area::ArtifactArea;
use crate::domain::user::User;
use crate::domain::utils::id::ExperimentId;
use crate::error::ExperimentError;

/// Admission control for bookings and the user-facing lifecycle operations.
///
/// Every validation runs before anything is written; a rejected request leaves
/// the store as it was.
#[derive(Debug)]
pub struct BookingService {
    lifecycle: Arc<LifecycleManager>,
    artifacts: Arc<dyn ArtifactArea>,
    inventory: Arc<HardwareInventory>,
    scheduler: SchedulerHandle,
    dispatcher: Arc<dyn PreparationDispatcher>,
    clock: SharedClock,
    collision_buffer: chrono::Duration,
    admission: Mutex<()>,
}

impl BookingService {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        artifacts: Arc<dyn ArtifactArea>,
        inventory: Arc<HardwareInventory>,
        scheduler: SchedulerHandle,
        dispatcher: Arc<dyn PreparationDispatcher>,
        clock: SharedClock,
        collision_buffer: Duration,
    ) -> Self {
        Self {
            lifecycle,
            artifacts,
            inventory,
            scheduler,
            dispatcher,
            clock,
            collision_buffer: chrono::Duration::from_std(collision_buffer).unwrap_or(chrono::Duration::zero()),
            admission: Mutex::new(()),
        }
    }

    /// Admits a new booking in status `Created` and returns its id.
    ///
    /// Rejects templates whose end is not after their start, intervals that
    /// come closer than the collision buffer to any non-cancelled booking,
    /// nodes missing from the inventory and module types a node lacks.
    pub fn create_booking(&self, template: ExperimentTemplate, owner: &User) -> Result<ExperimentId, ExperimentError> {
        // Admission serialises check and insert, so two overlapping requests
        // cannot both see a free slot.
        let _admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);

        if template.end <= template.start {
            return Err(ExperimentError::IllegalTime { id: None, reason: "end is not after start" });
        }

        self.check_collision(&template)?;
        self.check_inventory(&template)?;

        let descriptor = self.lifecycle.store().add(template, owner.id.clone())?;
        log::info!(
            "[Experiment {}] Booking '{}' created by {} for {} - {}.",
            descriptor.id(),
            descriptor.name(),
            owner.id,
            descriptor.start(),
            descriptor.end()
        );

        Ok(descriptor.id())
    }

    fn check_collision(&self, template: &ExperimentTemplate) -> Result<(), ExperimentError> {
        // The buffered window saturates at the representable time range.
        let from = template.start.checked_sub_signed(self.collision_buffer).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let to = template.end.checked_add_signed(self.collision_buffer).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let conflicting = self
            .lifecycle
            .store()
            .query_by_time_range(from, to)?
            .into_iter()
            .filter(|existing| existing.status() != ExperimentStatus::Cancelled)
            .map(|existing| existing.id())
            .min();

        match conflicting {
            Some(conflicting) => Err(ExperimentError::TimeCollision { conflicting }),
            None => Ok(()),
        }
    }

    fn check_inventory(&self, template: &ExperimentTemplate) -> Result<(), ExperimentError> {
        for assignment in &template.nodes {
            let node = self.inventory.get(&assignment.id).ok_or_else(|| ExperimentError::UnknownNode(assignment.id.clone()))?;

            if let Some(module) = assignment.modules.iter().find(|module| !node.supports(&module.module_type)) {
                return Err(ExperimentError::UnknownModule { node: node.id.clone(), module: module.module_type.clone() });
            }
        }
        Ok(())
    }

    /// Confirms a `Created` booking of `requester` and wakes the scheduler.
    pub fn schedule_booking(&self, id: ExperimentId, requester: &User) -> Result<(), ExperimentError> {
        let now = self.clock.now();

        self.lifecycle.transition_checked(id, ExperimentStatus::Scheduled, Component::Booking, |experiment| {
            if experiment.owner() != &requester.id {
                return Err(ExperimentError::Unauthorized { id, user: requester.id.clone() });
            }
            if experiment.status() != ExperimentStatus::Created {
                return Err(ExperimentError::InvalidState { id, status: experiment.status() });
            }
            if experiment.end() <= now {
                return Err(ExperimentError::IllegalTime { id: Some(id), reason: "end time has already passed" });
            }
            if let Some(firmware) = experiment.firmware_names().find(|firmware| !self.artifacts.firmware_exists(id, firmware)) {
                return Err(ExperimentError::MissingFirmware { id, firmware: firmware.to_string() });
            }
            Ok(())
        })?;

        self.scheduler.wakeup();
        Ok(())
    }

    /// Withdraws a `Created` or `Scheduled` booking. Allowed to the owner and
    /// to administrators.
    pub async fn cancel_booking(&self, id: ExperimentId, requester: &User) -> Result<(), ExperimentError> {
        let mut previous = ExperimentStatus::Created;

        let cancelled = self.lifecycle.transition_checked(id, ExperimentStatus::Cancelled, Component::Booking, |experiment| {
            check_owner_or_admin(experiment, requester)?;
            if !matches!(experiment.status(), ExperimentStatus::Created | ExperimentStatus::Scheduled) {
                return Err(ExperimentError::InvalidState { id, status: experiment.status() });
            }
            previous = experiment.status();
            Ok(())
        })?;

        self.scheduler.wakeup();

        // Nodes may already hold the firmware of a scheduled experiment.
        if previous == ExperimentStatus::Scheduled {
            let message = PreparationMessage::for_experiment(&cancelled, InvocationMethod::Cancel);
            if let Err(e) = self.dispatcher.dispatch(message).await {
                log::warn!("[Experiment {}] Could not notify nodes of the cancellation: {}", id, e);
            }
        }

        Ok(())
    }

    /// Asks the nodes of a running experiment to stop early. The experiment is
    /// resolved by its completion tracker once the logs are in.
    pub async fn stop_experiment(&self, id: ExperimentId, requester: &User) -> Result<(), ExperimentError> {
        let experiment = self.get_experiment(id)?;
        check_owner_or_admin(&experiment, requester)?;

        if experiment.status() != ExperimentStatus::Running {
            return Err(ExperimentError::InvalidState { id, status: experiment.status() });
        }

        self.dispatcher.dispatch(PreparationMessage::for_experiment(&experiment, InvocationMethod::Stop)).await?;
        log::info!("[Experiment {}] Stop requested by {}.", id, requester.id);
        Ok(())
    }

    pub fn get_experiment(&self, id: ExperimentId) -> Result<ExperimentDescriptor, ExperimentError> {
        self.lifecycle.store().query_by_id(id)?.ok_or(ExperimentError::NoSuchExperiment(id))
    }

    /// Experiments intersecting `[from, to)`, ordered by start.
    pub fn list_experiments(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<ExperimentDescriptor>, ExperimentError> {
        let mut experiments = self.lifecycle.store().query_by_time_range(from, to)?;
        experiments.sort_by_key(|experiment| (experiment.start(), experiment.id()));
        Ok(experiments)
    }
}

fn check_owner_or_admin(experiment: &ExperimentDescriptor, requester: &User) -> Result<(), ExperimentError> {
    if experiment.owner() == &requester.id || requester.is_admin() {
        Ok(())
    } else {
        Err(ExperimentError::Unauthorized { id: experiment.id(), user: requester.id.clone() })
    }
}
