use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::errors::ChemsimError;
use crate::workspace::{normalize_step_name, path_is_file};

pub(crate) const STRUCTURE_EXTENSION: &str = "gro";
pub(crate) const BASE_STRUCTURE_FILE: &str = "system.gro";
pub(crate) const BASE_STRUCTURE_PRODUCER: &str = "structure build (editconf)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    fn new() -> Self {
        NodeId(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    #[serde(alias = "minim")]
    Minimization,
    #[serde(alias = "gen", alias = "nvt")]
    Generation,
    #[serde(alias = "equil", alias = "npt")]
    Equilibration,
    #[serde(alias = "prod")]
    Production,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Minimization => "minimization",
            StepKind::Generation => "generation",
            StepKind::Equilibration => "equilibration",
            StepKind::Production => "production",
        }
    }

    /// Name of the parameter template shipped for this kind (`templates/{name}.mdp`).
    pub fn template_name(self) -> &'static str {
        match self {
            StepKind::Minimization => "minim",
            StepKind::Generation => "nvt",
            StepKind::Equilibration => "npt",
            StepKind::Production => "prod",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ChemsimError> {
        match value.trim().to_lowercase().as_str() {
            "minimization" | "minim" => Ok(StepKind::Minimization),
            "generation" | "gen" | "nvt" => Ok(StepKind::Generation),
            "equilibration" | "equil" | "npt" => Ok(StepKind::Equilibration),
            "production" | "prod" => Ok(StepKind::Production),
            other => Err(ChemsimError::InvalidName(format!(
                "Unknown step kind \"{other}\". Supported values: minimization, generation, equilibration, production."
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Error => "error",
        }
    }

    pub fn can_transition_to(self, next: StepStatus) -> bool {
        match next {
            StepStatus::Running => self != StepStatus::Running,
            StepStatus::Completed | StepStatus::Error => self == StepStatus::Running,
            StepStatus::Pending => false,
        }
    }
}

/// Persisted shape of one node, nested the way `simulation_state.tree_data` stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub kind: StepKind,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub children: Vec<StepRecord>,
}

#[derive(Debug, Clone)]
pub struct StepNode {
    pub id: NodeId,
    pub name: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// Arena of step nodes. Names are unique across the whole tree because they
/// become artifact file stems inside a single storage directory.
#[derive(Debug, Clone, Default)]
pub struct ProtocolTree {
    nodes: HashMap<NodeId, StepNode>,
    roots: Vec<NodeId>,
}

pub(crate) fn artifact_file_name(step: &str, extension: &str) -> String {
    format!("{step}.{extension}")
}

impl ProtocolTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, id: NodeId) -> Option<&StepNode> {
        self.nodes.get(&id)
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        let name = name.trim();
        self.nodes
            .values()
            .find(|node| node.name == name)
            .map(|node| node.id)
    }

    pub fn require(&self, name: &str) -> Result<NodeId, ChemsimError> {
        self.find(name).ok_or_else(|| ChemsimError::NotFound {
            what: "step",
            name: name.trim().to_string(),
        })
    }

    fn node_ref(&self, id: NodeId) -> Result<&StepNode, ChemsimError> {
        self.nodes.get(&id).ok_or_else(|| ChemsimError::NotFound {
            what: "step",
            name: id.to_string(),
        })
    }

    pub fn add_child(
        &mut self,
        parent: Option<NodeId>,
        name: &str,
        kind: StepKind,
    ) -> Result<NodeId, ChemsimError> {
        self.insert(parent, name, kind, StepStatus::Pending)
    }

    fn insert(
        &mut self,
        parent: Option<NodeId>,
        name: &str,
        kind: StepKind,
        status: StepStatus,
    ) -> Result<NodeId, ChemsimError> {
        let name = normalize_step_name(name)?;
        if self.find(&name).is_some() {
            return Err(ChemsimError::DuplicateName { what: "step", name });
        }
        if let Some(parent_id) = parent {
            self.node_ref(parent_id)?;
        }

        let id = NodeId::new();
        self.nodes.insert(
            id,
            StepNode {
                id,
                name,
                kind,
                status,
                parent,
                children: Vec::new(),
            },
        );

        match parent.and_then(|parent_id| self.nodes.get_mut(&parent_id)) {
            Some(parent_node) => parent_node.children.push(id),
            None => self.roots.push(id),
        }

        Ok(id)
    }

    /// Node and all descendants, parents before children, children in order.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut ordered = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            ordered.push(current);
            stack.extend(node.children.iter().rev().copied());
        }
        ordered
    }

    /// Detaches `id` and drops its whole subtree. Returns the removed names.
    /// Artifacts on disk are left alone.
    pub fn remove_subtree(&mut self, id: NodeId) -> Result<Vec<String>, ChemsimError> {
        let parent = self.node_ref(id)?.parent;
        match parent.and_then(|parent_id| self.nodes.get_mut(&parent_id)) {
            Some(parent_node) => parent_node.children.retain(|child| *child != id),
            None => self.roots.retain(|root| *root != id),
        }

        let removed = self
            .subtree(id)
            .into_iter()
            .filter_map(|node_id| self.nodes.remove(&node_id))
            .map(|node| node.name)
            .collect();
        Ok(removed)
    }

    /// File name the node consumes: the parent's structure output, or the
    /// system-level base structure for roots.
    pub fn input_file_name(&self, id: NodeId) -> Result<String, ChemsimError> {
        let node = self.node_ref(id)?;
        match node.parent {
            Some(parent_id) => {
                let parent = self.node_ref(parent_id)?;
                Ok(artifact_file_name(&parent.name, STRUCTURE_EXTENSION))
            }
            None => Ok(BASE_STRUCTURE_FILE.to_string()),
        }
    }

    pub fn resolve_input_file(
        &self,
        id: NodeId,
        storage_dir: &Path,
    ) -> Result<PathBuf, ChemsimError> {
        let file = self.input_file_name(id)?;
        let path = storage_dir.join(&file);
        if path_is_file(&path) {
            return Ok(path);
        }

        let upstream = match self.node_ref(id)?.parent {
            Some(parent_id) => self.node_ref(parent_id)?.name.clone(),
            None => BASE_STRUCTURE_PRODUCER.to_string(),
        };
        Err(ChemsimError::MissingUpstream { file, upstream })
    }

    pub fn set_status(&mut self, id: NodeId, status: StepStatus) -> Result<(), ChemsimError> {
        let node = self.nodes.get_mut(&id).ok_or_else(|| ChemsimError::NotFound {
            what: "step",
            name: id.to_string(),
        })?;
        if !node.status.can_transition_to(status) {
            return Err(ChemsimError::InvalidTransition {
                name: node.name.clone(),
                from: node.status.as_str(),
                to: status.as_str(),
            });
        }
        node.status = status;
        Ok(())
    }

    pub fn reset_statuses(&mut self) {
        for node in self.nodes.values_mut() {
            node.status = StepStatus::Pending;
        }
    }

    /// Marks nodes left `running` by a previous session as failed; their
    /// process no longer exists. Returns the affected names.
    pub fn settle_interrupted(&mut self) -> Vec<String> {
        let mut settled = Vec::new();
        for node in self.nodes.values_mut() {
            if node.status == StepStatus::Running {
                node.status = StepStatus::Error;
                settled.push(node.name.clone());
            }
        }
        settled.sort();
        settled
    }

    pub fn contains_status(&self, id: NodeId, status: StepStatus) -> bool {
        self.subtree(id)
            .into_iter()
            .filter_map(|node_id| self.nodes.get(&node_id))
            .any(|node| node.status == status)
    }

    pub fn to_records(&self) -> Vec<StepRecord> {
        self.roots
            .iter()
            .filter_map(|id| self.record_for(*id))
            .collect()
    }

    fn record_for(&self, id: NodeId) -> Option<StepRecord> {
        let node = self.nodes.get(&id)?;
        Some(StepRecord {
            name: node.name.clone(),
            kind: node.kind,
            status: node.status,
            children: node
                .children
                .iter()
                .filter_map(|child| self.record_for(*child))
                .collect(),
        })
    }

    pub fn from_records(records: &[StepRecord]) -> Result<Self, ChemsimError> {
        let mut tree = ProtocolTree::new();
        let mut stack: Vec<(Option<NodeId>, &StepRecord)> =
            records.iter().rev().map(|record| (None, record)).collect();

        while let Some((parent, record)) = stack.pop() {
            let id = tree.insert(parent, &record.name, record.kind, record.status)?;
            stack.extend(record.children.iter().rev().map(|child| (Some(id), child)));
        }

        Ok(tree)
    }
}
