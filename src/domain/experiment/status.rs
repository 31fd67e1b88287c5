use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a booked experiment.
///
/// The variants are ordered by the time they occur, not by commitment:
/// `Created -> Scheduled -> Running -> {Done | FailedToRetrieveLogs}`, with
/// `Cancelled` reachable from `Created` and `Scheduled`. `Done`,
/// `FailedToRetrieveLogs` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    /// Booking was admitted but the owner has not confirmed it yet.
    Created,

    /// Owner confirmed the booking and all firmware is present.
    Scheduled,

    /// The scheduling engine activated the experiment on the nodes.
    Running,

    /// Logs of every node were retrieved.
    Done,

    /// The deadline passed before all node logs were retrieved.
    FailedToRetrieveLogs,

    /// Withdrawn before it started.
    Cancelled,
}

impl ExperimentStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, ExperimentStatus::Done | ExperimentStatus::FailedToRetrieveLogs | ExperimentStatus::Cancelled)
    }

    /// Whether `self -> next` is an edge of the lifecycle diagram.
    pub fn can_transition_to(self, next: ExperimentStatus) -> bool {
        use ExperimentStatus::*;

        matches!(
            (self, next),
            (Created, Scheduled)
                | (Created, Cancelled)
                | (Scheduled, Running)
                | (Scheduled, Cancelled)
                | (Running, Done)
                | (Running, FailedToRetrieveLogs)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExperimentStatus::Created => "CREATED",
            ExperimentStatus::Scheduled => "SCHEDULED",
            ExperimentStatus::Running => "RUNNING",
            ExperimentStatus::Done => "DONE",
            ExperimentStatus::FailedToRetrieveLogs => "FAILED_TO_RETRIEVE_LOGS",
            ExperimentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn all() -> [ExperimentStatus; 6] {
        use ExperimentStatus::*;
        [Created, Scheduled, Running, Done, FailedToRetrieveLogs, Cancelled]
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
