use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};

use crate::domain::bus::message::{ArtifactRetrievedEvent, EXPERIMENT_PREPARATION_TOPIC, LOG_RETRIEVED_TOPIC, PreparationMessage};
use crate::error::BusError;

/// Hands preparation messages to the node workers.
#[async_trait]
pub trait PreparationDispatcher: std::fmt::Debug + Send + Sync {
    async fn dispatch(&self, message: PreparationMessage) -> Result<(), BusError>;
}

/// Sending half of the artifact-retrieved stream, for log retrieval workers.
#[derive(Debug, Clone)]
pub struct ArtifactPublisher {
    sender: mpsc::Sender<ArtifactRetrievedEvent>,
}

impl ArtifactPublisher {
    pub fn new(sender: mpsc::Sender<ArtifactRetrievedEvent>) -> Self {
        Self { sender }
    }

    pub async fn publish(&self, event: ArtifactRetrievedEvent) -> Result<(), BusError> {
        self.sender.send(event).await.map_err(|_| BusError::Closed(LOG_RETRIEVED_TOPIC))
    }
}

/// Message bus living inside the server process.
///
/// Preparation messages are broadcast to every subscribed worker. The
/// artifact-retrieved stream has many publishers and exactly one consumer,
/// the tracker factory, which takes the receiving half once.
#[derive(Debug)]
pub struct InProcessBus {
    preparation: broadcast::Sender<PreparationMessage>,
    artifacts: ArtifactPublisher,
    artifact_receiver: Mutex<Option<mpsc::Receiver<ArtifactRetrievedEvent>>>,
}

impl InProcessBus {
    pub fn new(capacity: usize) -> Self {
        let (preparation, _) = broadcast::channel(capacity);
        let (artifact_tx, artifact_rx) = mpsc::channel(capacity);

        Self { preparation, artifacts: ArtifactPublisher::new(artifact_tx), artifact_receiver: Mutex::new(Some(artifact_rx)) }
    }

    pub fn subscribe_preparation(&self) -> broadcast::Receiver<PreparationMessage> {
        self.preparation.subscribe()
    }

    pub fn artifact_publisher(&self) -> ArtifactPublisher {
        self.artifacts.clone()
    }

    /// The consuming half of the artifact stream. `None` after the first call.
    pub fn take_artifact_receiver(&self) -> Option<mpsc::Receiver<ArtifactRetrievedEvent>> {
        self.artifact_receiver.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[async_trait]
impl PreparationDispatcher for InProcessBus {
    async fn dispatch(&self, message: PreparationMessage) -> Result<(), BusError> {
        log::debug!("[Experiment {}] Publishing {:?} on '{}'.", message.experiment_id, message.action, EXPERIMENT_PREPARATION_TOPIC);

        self.preparation.send(message).map(|_| ()).map_err(|_| BusError::NoSubscriber(EXPERIMENT_PREPARATION_TOPIC))
    }
}
