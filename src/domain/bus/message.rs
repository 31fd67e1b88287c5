use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::experiment::descriptor::{ExperimentDescriptor, NodeAssignment};
use crate::domain::utils::id::{ExperimentId, NodeId};

pub const EXPERIMENT_PREPARATION_TOPIC: &str = "experimentPreparation";
pub const LOG_RETRIEVED_TOPIC: &str = "logRetrieved";

/// What the node workers should do with an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationMethod {
    Start,
    Stop,
    Cancel,
}

/// Dispatch consumed by the node workers that flash and run an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparationMessage {
    pub message_id: Uuid,
    pub experiment_id: ExperimentId,
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub nodes: Vec<NodeAssignment>,
    pub action: InvocationMethod,
}

impl PreparationMessage {
    pub fn for_experiment(descriptor: &ExperimentDescriptor, action: InvocationMethod) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            experiment_id: descriptor.id(),
            name: descriptor.name().to_string(),
            start: descriptor.start(),
            end: descriptor.end(),
            nodes: descriptor.nodes().to_vec(),
            action,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Published once per node after its post-run logs were fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRetrievedEvent {
    pub experiment_id: ExperimentId,
    pub node_id: NodeId,
}

impl ArtifactRetrievedEvent {
    pub fn new(experiment_id: ExperimentId, node_id: impl Into<NodeId>) -> Self {
        Self { experiment_id, node_id: node_id.into() }
    }
}
