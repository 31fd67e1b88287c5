#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use testbed_scheduler::domain::booking::booking_service::BookingService;
use testbed_scheduler::domain::bus::in_process_bus::PreparationDispatcher;
use testbed_scheduler::domain::bus::message::{InvocationMethod, PreparationMessage};
use testbed_scheduler::domain::clock::{SharedClock, SystemClock};
use testbed_scheduler::domain::experiment::descriptor::{ExperimentDescriptor, ExperimentTemplate, ModuleConfig, NodeAssignment};
use testbed_scheduler::domain::experiment::status::ExperimentStatus;
use testbed_scheduler::domain::inventory::{HardwareInventory, HardwareNode};
use testbed_scheduler::domain::lifecycle::lifecycle_manager::{Component, LifecycleManager};
use testbed_scheduler::domain::scheduling::scheduling_engine::SchedulingEngine;
use testbed_scheduler::domain::scheduling::tracker_factory::TrackerFactory;
use testbed_scheduler::domain::store::artifact_area::ArtifactArea;
use testbed_scheduler::domain::store::experiment_store::{ExperimentStore, InMemoryExperimentStore};
use testbed_scheduler::domain::user::{User, UserRole};
use testbed_scheduler::domain::utils::id::{ExperimentId, ModuleType, NodeId, UserId};
use testbed_scheduler::error::{BusError, StoreError};

pub const GRACE_PERIOD: Duration = Duration::from_secs(300);
pub const COLLISION_BUFFER: Duration = Duration::from_secs(299);
pub const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// 2026-06-01 10:00:00 UTC, the reference "now" of most tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap()
}

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, hour, minute, 0).unwrap()
}

pub fn secs(seconds: i64) -> chrono::Duration {
    chrono::Duration::seconds(seconds)
}

pub fn template(name: &str, start: DateTime<Utc>, end: DateTime<Utc>, nodes: &[&str]) -> ExperimentTemplate {
    ExperimentTemplate {
        name: name.to_string(),
        start,
        end,
        nodes: nodes.iter().map(|node| NodeAssignment::new(*node, vec![ModuleConfig::new("SENSOR", format!("{}.bin", name))])).collect(),
    }
}

pub fn inventory() -> HardwareInventory {
    HardwareInventory::new(vec![
        HardwareNode::new("n1", [ModuleType::new("SENSOR"), ModuleType::new("RADIO")]),
        HardwareNode::new("n2", [ModuleType::new("SENSOR")]),
        HardwareNode::new("n3", [ModuleType::new("SENSOR")]),
    ])
}

pub fn alice() -> User {
    User::new("alice", "Alice", UserRole::User)
}

pub fn bob() -> User {
    User::new("bob", "Bob", UserRole::User)
}

pub fn operator() -> User {
    User::new("root", "Operator", UserRole::Admin)
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self { now: Mutex::new(now) })
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl SystemClock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Keeps every dispatched preparation message together with the time it was sent.
#[derive(Debug)]
pub struct RecordingDispatcher {
    clock: SharedClock,
    sent: Mutex<Vec<(DateTime<Utc>, PreparationMessage)>>,
}

impl RecordingDispatcher {
    pub fn new(clock: SharedClock) -> Arc<Self> {
        Arc::new(Self { clock, sent: Mutex::new(Vec::new()) })
    }

    pub fn sent(&self) -> Vec<(DateTime<Utc>, PreparationMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn actions_for(&self, id: ExperimentId) -> Vec<InvocationMethod> {
        self.sent.lock().unwrap().iter().filter(|(_, message)| message.experiment_id == id).map(|(_, message)| message.action).collect()
    }
}

#[async_trait]
impl PreparationDispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: PreparationMessage) -> Result<(), BusError> {
        self.sent.lock().unwrap().push((self.clock.now(), message));
        Ok(())
    }
}

/// Artifact area held in memory.
#[derive(Debug, Default)]
pub struct InMemoryArtifactArea {
    firmware: Mutex<HashSet<(ExperimentId, String)>>,
    logs: Mutex<HashMap<ExperimentId, Vec<NodeId>>>,
}

impl InMemoryArtifactArea {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn upload_firmware(&self, id: ExperimentId, firmware: &str) {
        self.firmware.lock().unwrap().insert((id, firmware.to_string()));
    }

    pub fn upload_all_firmware(&self, descriptor: &ExperimentDescriptor) {
        for firmware in descriptor.firmware_names() {
            self.upload_firmware(descriptor.id(), firmware);
        }
    }

    pub fn store_logs(&self, id: ExperimentId, node: &str) {
        self.logs.lock().unwrap().entry(id).or_default().push(NodeId::new(node));
    }
}

impl ArtifactArea for InMemoryArtifactArea {
    fn firmware_exists(&self, experiment: ExperimentId, firmware: &str) -> bool {
        self.firmware.lock().unwrap().contains(&(experiment, firmware.to_string()))
    }

    fn retrieved_nodes(&self, experiment: ExperimentId) -> Result<Vec<NodeId>, StoreError> {
        Ok(self.logs.lock().unwrap().get(&experiment).cloned().unwrap_or_default())
    }
}

/// In-memory store whose next `n` updates or status queries fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryExperimentStore,
    failing_updates: AtomicUsize,
    failing_queries: AtomicUsize,
    update_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_queries(&self, n: usize) {
        self.failing_queries.store(n, Ordering::SeqCst);
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}

fn disk_full() -> StoreError {
    StoreError::Io(io::Error::other("disk full"))
}

impl ExperimentStore for FlakyStore {
    fn query_by_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<ExperimentDescriptor>, StoreError> {
        self.inner.query_by_time_range(from, to)
    }

    fn query_by_id(&self, id: ExperimentId) -> Result<Option<ExperimentDescriptor>, StoreError> {
        self.inner.query_by_id(id)
    }

    fn query_by_status(&self, status: ExperimentStatus) -> Result<Vec<ExperimentDescriptor>, StoreError> {
        if Self::take_failure(&self.failing_queries) {
            return Err(disk_full());
        }
        self.inner.query_by_status(status)
    }

    fn add(&self, template: ExperimentTemplate, owner: UserId) -> Result<ExperimentDescriptor, StoreError> {
        self.inner.add(template, owner)
    }

    fn update(&self, descriptor: &ExperimentDescriptor) -> Result<(), StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_updates) {
            return Err(disk_full());
        }
        self.inner.update(descriptor)
    }
}

/// Core components wired together without spawning anything.
pub struct Harness {
    pub store: Arc<dyn ExperimentStore>,
    pub lifecycle: Arc<LifecycleManager>,
    pub artifacts: Arc<InMemoryArtifactArea>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub trackers: Arc<TrackerFactory>,
    pub booking: Arc<BookingService>,
    pub engine: Option<SchedulingEngine>,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_store(clock, Arc::new(InMemoryExperimentStore::new()))
    }

    pub fn with_store(clock: SharedClock, store: Arc<dyn ExperimentStore>) -> Self {
        let lifecycle = Arc::new(LifecycleManager::new(store.clone()));
        let artifacts = InMemoryArtifactArea::new();
        let dispatcher = RecordingDispatcher::new(clock.clone());
        let shutdown = CancellationToken::new();

        let trackers =
            Arc::new(TrackerFactory::new(lifecycle.clone(), artifacts.clone(), clock.clone(), GRACE_PERIOD, RETRY_BACKOFF, shutdown.clone()));
        let engine = SchedulingEngine::new(lifecycle.clone(), trackers.clone(), dispatcher.clone(), clock.clone(), RETRY_BACKOFF);
        let booking = Arc::new(BookingService::new(
            lifecycle.clone(),
            artifacts.clone(),
            Arc::new(inventory()),
            engine.handle(),
            dispatcher.clone(),
            clock,
            COLLISION_BUFFER,
        ));

        Self { store, lifecycle, artifacts, dispatcher, trackers, booking, engine: Some(engine), shutdown }
    }

    /// Books for `owner`, uploads the firmware and confirms the booking.
    pub fn book_and_schedule(&self, template: ExperimentTemplate, owner: &User) -> ExperimentId {
        let id = self.booking.create_booking(template, owner).unwrap();
        self.artifacts.upload_all_firmware(&self.store.query_by_id(id).unwrap().unwrap());
        self.booking.schedule_booking(id, owner).unwrap();
        id
    }

    /// Adds an experiment and walks it to `Running` directly, bypassing the engine.
    pub fn running_experiment(&self, template: ExperimentTemplate) -> ExperimentDescriptor {
        let id = self.store.add(template, alice().id).unwrap().id();
        self.lifecycle.transition(id, ExperimentStatus::Scheduled, Component::Booking).unwrap();
        self.lifecycle.transition(id, ExperimentStatus::Running, Component::Scheduler).unwrap()
    }

    pub fn status(&self, id: ExperimentId) -> ExperimentStatus {
        self.store.query_by_id(id).unwrap().unwrap().status()
    }
}
