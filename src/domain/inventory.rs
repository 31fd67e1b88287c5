use std::collections::{HashMap, HashSet};

use crate::api::config_dto::HardwareNodeDto;
use crate::domain::utils::id::{ModuleType, NodeId};

/// A physical node of the testbed and the module types it carries.
#[derive(Debug, Clone)]
pub struct HardwareNode {
    pub id: NodeId,
    pub capabilities: HashSet<ModuleType>,
}

impl HardwareNode {
    pub fn new(id: impl Into<NodeId>, capabilities: impl IntoIterator<Item = ModuleType>) -> Self {
        Self { id: id.into(), capabilities: capabilities.into_iter().collect() }
    }

    pub fn supports(&self, module_type: &ModuleType) -> bool {
        self.capabilities.contains(module_type)
    }
}

impl From<HardwareNodeDto> for HardwareNode {
    fn from(dto: HardwareNodeDto) -> Self {
        HardwareNode::new(NodeId::new(dto.id), dto.capabilities.into_iter().map(ModuleType::new))
    }
}

/// Static list of nodes, loaded once at startup and never modified.
#[derive(Debug, Clone, Default)]
pub struct HardwareInventory {
    nodes: HashMap<NodeId, HardwareNode>,
}

impl HardwareInventory {
    pub fn new(nodes: impl IntoIterator<Item = HardwareNode>) -> Self {
        Self { nodes: nodes.into_iter().map(|node| (node.id.clone(), node)).collect() }
    }

    pub fn from_dto(nodes: Vec<HardwareNodeDto>) -> Self {
        Self::new(nodes.into_iter().map(HardwareNode::from))
    }

    pub fn get(&self, id: &NodeId) -> Option<&HardwareNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
