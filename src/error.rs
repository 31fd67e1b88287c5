use thiserror::Error;

use crate::domain::experiment::status::ExperimentStatus;
use crate::domain::utils::id::{ExperimentId, ModuleType, NodeId, UserId};

/// Process-level failures (configuration, bootstrap).
#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Invalid server configuration: {0}")]
    ConfigError(String),

    #[error("Experiment store could not be opened: {0}")]
    StoreError(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the durable experiment store or the artifact area.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not (de)serialize store contents: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock was poisoned by a panicking writer")]
    Poisoned,

    #[error("Experiment {0} is not part of the store")]
    UnknownExperiment(ExperimentId),
}

/// Failures of the message bus binding.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("No subscriber is listening on topic '{0}'")]
    NoSubscriber(&'static str),

    #[error("Channel for topic '{0}' is closed")]
    Closed(&'static str),

    #[error("Could not encode message: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Every failure an experiment operation can report to its caller.
///
/// Validation variants are raised before anything is written, so the store is
/// left untouched whenever one of them is returned.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("Experiment {id}: illegal status transition {from:?} -> {to:?}")]
    InvalidTransition { id: ExperimentId, from: ExperimentStatus, to: ExperimentStatus },

    #[error("Experiment's start or end time is too close to experiment {conflicting}")]
    TimeCollision { conflicting: ExperimentId },

    #[error("No node called {0} exists")]
    UnknownNode(NodeId),

    #[error("Module type {module} is not supported by {node}")]
    UnknownModule { node: NodeId, module: ModuleType },

    #[error("Experiment {0} does not exist")]
    NoSuchExperiment(ExperimentId),

    #[error("User {user} is not allowed to modify experiment {id}")]
    Unauthorized { id: ExperimentId, user: UserId },

    #[error("Experiment {id} is in status {status:?}, which does not allow this operation")]
    InvalidState { id: ExperimentId, status: ExperimentStatus },

    #[error("Illegal experiment time: {reason}")]
    IllegalTime { id: Option<ExperimentId>, reason: &'static str },

    #[error("Experiment {id}: firmware '{firmware}' was not uploaded")]
    MissingFirmware { id: ExperimentId, firmware: String },

    #[error("Experiment store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Message bus unavailable: {0}")]
    BusUnavailable(#[from] BusError),
}

impl ExperimentError {
    /// Stable code a request layer can hand to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            ExperimentError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ExperimentError::TimeCollision { .. } => "TIME_COLLISION",
            ExperimentError::UnknownNode(_) => "UNKNOWN_NODE",
            ExperimentError::UnknownModule { .. } => "UNKNOWN_MODULE",
            ExperimentError::NoSuchExperiment(_) => "NO_SUCH_EXPERIMENT",
            ExperimentError::Unauthorized { .. } => "UNAUTHORIZED",
            ExperimentError::InvalidState { .. } => "INVALID_STATE",
            ExperimentError::IllegalTime { .. } => "ILLEGAL_TIME",
            ExperimentError::MissingFirmware { .. } => "MISSING_FIRMWARE",
            ExperimentError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            ExperimentError::BusUnavailable(_) => "BUS_UNAVAILABLE",
        }
    }

    /// True for failures that may disappear on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExperimentError::StoreUnavailable(_) | ExperimentError::BusUnavailable(_))
    }
}
