use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::booking_dto::BookingsDto;
use crate::api::config_dto::ServerConfigDto;
use crate::domain::booking::booking_service::BookingService;
use crate::domain::bus::artifact_poller::ArtifactPoller;
use crate::domain::bus::in_process_bus::InProcessBus;
use crate::domain::clock::SharedClock;
use crate::domain::inventory::HardwareInventory;
use crate::domain::lifecycle::lifecycle_manager::LifecycleManager;
use crate::domain::scheduling::scheduling_engine::{SchedulerHandle, SchedulingEngine};
use crate::domain::scheduling::tracker_factory::TrackerFactory;
use crate::domain::statistics::flush_global;
use crate::domain::store::artifact_area::{ArtifactArea, FileArtifactArea};
use crate::domain::store::experiment_store::ExperimentStore;
use crate::domain::store::json_store::JsonExperimentStore;
use crate::domain::user::User;
use crate::domain::utils::id::UserId;
use crate::error::{Error, Result};

/// A running testbed scheduler: booking service plus its background loops.
#[derive(Debug)]
pub struct TestbedServer {
    booking: Arc<BookingService>,
    trackers: Arc<TrackerFactory>,
    scheduler: SchedulerHandle,
    bus: Arc<InProcessBus>,
    users: HashMap<UserId, User>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TestbedServer {
    /// Opens the file store and the artifact area below the configured
    /// working directory and starts all loops.
    pub async fn start(config: &ServerConfigDto, clock: SharedClock, bus: Arc<InProcessBus>) -> Result<Self> {
        let store = Arc::new(JsonExperimentStore::open(&config.working_directory)?);
        let artifacts = Arc::new(FileArtifactArea::new(&config.working_directory));

        Self::start_with(config, store, artifacts, clock, bus).await
    }

    /// Starts the server on the given collaborators.
    ///
    /// Trackers of experiments left `Running` by a previous process are
    /// rebuilt before the scheduling engine runs for the first time.
    pub async fn start_with(
        config: &ServerConfigDto,
        store: Arc<dyn ExperimentStore>,
        artifacts: Arc<dyn ArtifactArea>,
        clock: SharedClock,
        bus: Arc<InProcessBus>,
    ) -> Result<Self> {
        let events = bus.take_artifact_receiver().ok_or_else(|| Error::ConfigError("the artifact stream of this bus is already in use".to_string()))?;

        let inventory = Arc::new(HardwareInventory::from_dto(config.nodes.clone()));
        if inventory.is_empty() {
            log::warn!("Hardware inventory is empty; every booking will be rejected.");
        }
        let users: HashMap<UserId, User> = config.users.iter().cloned().map(User::from).map(|user| (user.id.clone(), user)).collect();

        let shutdown = CancellationToken::new();
        let lifecycle = Arc::new(LifecycleManager::new(store));

        let trackers = Arc::new(TrackerFactory::new(
            lifecycle.clone(),
            artifacts.clone(),
            clock.clone(),
            config.grace_period(),
            config.store_retry_backoff(),
            shutdown.clone(),
        ));
        trackers.recover().await;

        let engine = SchedulingEngine::new(lifecycle.clone(), trackers.clone(), bus.clone(), clock.clone(), config.store_retry_backoff());
        let scheduler = engine.handle();

        let poller = ArtifactPoller::new(artifacts.clone(), trackers.clone(), bus.artifact_publisher(), config.artifact_poll_interval());

        let tasks = vec![
            tokio::spawn(trackers.clone().run(events)),
            engine.spawn(shutdown.clone()),
            tokio::spawn(poller.run(shutdown.clone())),
        ];

        let booking = Arc::new(BookingService::new(
            lifecycle,
            artifacts,
            inventory.clone(),
            scheduler.clone(),
            bus.clone(),
            clock,
            config.collision_buffer(),
        ));

        log::info!("Testbed server started with {} nodes and {} users.", inventory.len(), config.users.len());

        Ok(Self { booking, trackers, scheduler, bus, users, shutdown, tasks })
    }

    pub fn booking(&self) -> &Arc<BookingService> {
        &self.booking
    }

    pub fn trackers(&self) -> &Arc<TrackerFactory> {
        &self.trackers
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn bus(&self) -> &Arc<InProcessBus> {
        &self.bus
    }

    pub fn user(&self, id: &str) -> Option<&User> {
        self.users.get(&UserId::new(id))
    }

    /// Submits bookings the way a client would. Failures are logged and
    /// skipped. Returns the number of admitted bookings.
    pub fn admit_bookings(&self, bookings: BookingsDto) -> usize {
        let mut admitted = 0;

        for booking in bookings.bookings {
            let Some(owner) = self.user(&booking.owner) else {
                log::warn!("Skipping booking '{}': unknown user {}.", booking.template.name, booking.owner);
                continue;
            };

            let name = booking.template.name.clone();
            let id = match self.booking.create_booking(booking.template, owner) {
                Ok(id) => id,
                Err(e) => {
                    log::warn!("Booking '{}' rejected ({}): {}", name, e.kind(), e);
                    continue;
                }
            };
            admitted += 1;

            if booking.schedule {
                if let Err(e) = self.booking.schedule_booking(id, owner) {
                    log::warn!("[Experiment {}] Could not be scheduled ({}): {}", id, e.kind(), e);
                }
            }
        }

        admitted
    }

    /// Stops every loop and waits for them to finish.
    pub async fn shutdown(self) {
        log::info!("Shutting down testbed server.");
        self.shutdown.cancel();

        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("Background task ended abnormally: {}", e);
            }
        }

        flush_global();
    }
}
