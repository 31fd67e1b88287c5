use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

use crate::domain::experiment::status::ExperimentStatus;
use crate::domain::utils::id::{ExperimentId, ModuleType, NodeId, UserId};

/// One module on a node together with the firmware it should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfig {
    pub module_type: ModuleType,
    pub firmware: String,

    #[serde(default)]
    pub serial_dump: bool,

    #[serde(default)]
    pub serial_forward: bool,

    #[serde(default)]
    pub gpio_tracer: bool,
}

impl ModuleConfig {
    pub fn new(module_type: impl Into<ModuleType>, firmware: impl Into<String>) -> Self {
        Self { module_type: module_type.into(), firmware: firmware.into(), serial_dump: false, serial_forward: false, gpio_tracer: false }
    }
}

/// A hardware node and the modules configured on it for one experiment.
///
/// Two assignments are equal when they target the same node, whatever their
/// module lists look like.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAssignment {
    pub id: NodeId,
    pub modules: Vec<ModuleConfig>,
}

impl NodeAssignment {
    pub fn new(id: impl Into<NodeId>, modules: Vec<ModuleConfig>) -> Self {
        Self { id: id.into(), modules }
    }
}

impl PartialEq for NodeAssignment {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeAssignment {}

impl Hash for NodeAssignment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// What a user submits when requesting a booking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentTemplate {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub nodes: Vec<NodeAssignment>,
}

/// Raised by [`transition`] for a move that is not an edge of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ExperimentStatus,
    pub to: ExperimentStatus,
}

/// The persisted record of one booked experiment.
///
/// Everything except the status is fixed at creation. The status can only be
/// changed through [`transition`]; persisting the result is up to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentDescriptor {
    id: ExperimentId,
    name: String,
    owner: UserId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    nodes: Vec<NodeAssignment>,
    status: ExperimentStatus,
}

impl ExperimentDescriptor {
    /// A freshly admitted booking in status `Created`.
    pub fn new(id: ExperimentId, template: ExperimentTemplate, owner: UserId) -> Self {
        Self {
            id,
            name: template.name,
            owner,
            start: template.start,
            end: template.end,
            nodes: template.nodes,
            status: ExperimentStatus::Created,
        }
    }

    /// Rebuilds a descriptor from durable state, status included.
    pub fn restore(
        id: ExperimentId,
        name: String,
        owner: UserId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        nodes: Vec<NodeAssignment>,
        status: ExperimentStatus,
    ) -> Self {
        Self { id, name, owner, start, end, nodes, status }
    }

    pub fn id(&self) -> ExperimentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn nodes(&self) -> &[NodeAssignment] {
        &self.nodes
    }

    pub fn status(&self) -> ExperimentStatus {
        self.status
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter().map(|node| &node.id)
    }

    pub fn firmware_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().flat_map(|node| node.modules.iter()).map(|module| module.firmware.as_str())
    }

    /// True if `[start, end)` of this experiment intersects `[from, to)`.
    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.start < to && from < self.end
    }
}

/// Moves `descriptor` to `next` if the lifecycle allows it.
///
/// Returns the previous status. On error the descriptor is left unchanged.
pub fn transition(descriptor: &mut ExperimentDescriptor, next: ExperimentStatus) -> Result<ExperimentStatus, InvalidTransition> {
    let current = descriptor.status;

    if !current.can_transition_to(next) {
        return Err(InvalidTransition { from: current, to: next });
    }

    descriptor.status = next;
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn descriptor() -> ExperimentDescriptor {
        let template = ExperimentTemplate {
            name: "radio".to_string(),
            start: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap(),
            nodes: vec![NodeAssignment::new("n1", vec![ModuleConfig::new("SKY", "f.bin")])],
        };
        ExperimentDescriptor::new(ExperimentId(1), template, UserId::new("alice"))
    }

    #[test]
    fn walks_the_happy_path() {
        let mut experiment = descriptor();

        assert_eq!(transition(&mut experiment, ExperimentStatus::Scheduled), Ok(ExperimentStatus::Created));
        assert_eq!(transition(&mut experiment, ExperimentStatus::Running), Ok(ExperimentStatus::Scheduled));
        assert_eq!(transition(&mut experiment, ExperimentStatus::Done), Ok(ExperimentStatus::Running));
        assert_eq!(experiment.status(), ExperimentStatus::Done);
    }

    #[test]
    fn illegal_transition_leaves_status_unchanged() {
        let mut experiment = descriptor();

        let err = transition(&mut experiment, ExperimentStatus::Running).unwrap_err();
        assert_eq!(err, InvalidTransition { from: ExperimentStatus::Created, to: ExperimentStatus::Running });
        assert_eq!(experiment.status(), ExperimentStatus::Created);
    }

    #[test]
    fn no_transition_leaves_a_terminal_state() {
        let mut experiment = descriptor();
        transition(&mut experiment, ExperimentStatus::Cancelled).unwrap();

        for next in ExperimentStatus::all() {
            assert!(transition(&mut experiment, next).is_err());
        }
        assert_eq!(experiment.status(), ExperimentStatus::Cancelled);
    }

    #[test]
    fn node_assignments_compare_by_node_only() {
        let a = NodeAssignment::new("n1", vec![ModuleConfig::new("SKY", "a.bin")]);
        let b = NodeAssignment::new("n1", vec![ModuleConfig::new("ZOUL", "b.bin"), ModuleConfig::new("SKY", "c.bin")]);
        let c = NodeAssignment::new("n2", vec![ModuleConfig::new("SKY", "a.bin")]);

        assert_eq!(a, b);
        assert_ne!(a, c);

        let unique: std::collections::HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(unique.len(), 2);
    }

    #[test]
    fn overlap_excludes_touching_intervals() {
        let experiment = descriptor();
        let end = experiment.end();
        let start = experiment.start();

        assert!(!experiment.overlaps(end, end + chrono::Duration::hours(1)));
        assert!(!experiment.overlaps(start - chrono::Duration::hours(1), start));
        assert!(experiment.overlaps(end - chrono::Duration::seconds(1), end + chrono::Duration::hours(1)));
    }
}
