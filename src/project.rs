use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::errors::ChemsimError;
use crate::protocol::StepRecord;
use crate::workspace::now_iso;

pub(crate) const STORAGE_DIR: &str = "storage";
pub(crate) const TEMPLATES_DIR: &str = "templates";
pub(crate) const PROJECT_SUBDIRECTORIES: [&str; 4] = [STORAGE_DIR, TEMPLATES_DIR, "logs", "analysis"];
pub(crate) const DEFAULT_SYSTEM_NAME: &str = "default";

/// Input-class files that survive a system clone. Everything else in a
/// storage directory is generated output.
pub(crate) const ESSENTIAL_EXTENSIONS: [&str; 4] = ["mdp", "itp", "pdb", "top"];

fn empty_blob() -> Value {
    Value::Object(Map::new())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabKind {
    Setup,
    Topology,
    Simulation,
    Analysis,
}

impl TabKind {
    pub const ALL: [TabKind; 4] = [
        TabKind::Setup,
        TabKind::Topology,
        TabKind::Simulation,
        TabKind::Analysis,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TabKind::Setup => "setup",
            TabKind::Topology => "topology",
            TabKind::Simulation => "simulation",
            TabKind::Analysis => "analysis",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ChemsimError> {
        let normalized = value.trim().to_lowercase();
        TabKind::ALL
            .into_iter()
            .find(|tab| tab.as_str() == normalized)
            .ok_or_else(|| {
                ChemsimError::InvalidName(format!(
                    "tab must be one of: setup, topology, simulation, analysis (got \"{normalized}\")."
                ))
            })
    }
}

fn empty_tree() -> Value {
    Value::Array(Vec::new())
}

/// Simulation tab blob. `tree_data` stays raw so one unreadable tree does
/// not make the whole project document unreadable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationState {
    #[serde(default = "empty_tree")]
    pub tree_data: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for SimulationState {
    fn default() -> Self {
        SimulationState {
            tree_data: empty_tree(),
            extra: Map::new(),
        }
    }
}

impl SimulationState {
    pub fn records(&self) -> Result<Vec<StepRecord>, ChemsimError> {
        if self.tree_data.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(self.tree_data.clone()).map_err(|error| {
            ChemsimError::Serialization(format!("tree_data is not a list of protocol steps: {error}"))
        })
    }

    pub fn set_records(&mut self, records: &[StepRecord]) -> Result<(), ChemsimError> {
        self.tree_data = serde_json::to_value(records)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemRecord {
    pub created: String,
    #[serde(default = "empty_blob")]
    pub setup_state: Value,
    #[serde(default = "empty_blob")]
    pub topology_state: Value,
    #[serde(default)]
    pub simulation_state: SimulationState,
    #[serde(default = "empty_blob")]
    pub analysis_state: Value,
}

impl SystemRecord {
    pub fn new() -> Self {
        SystemRecord {
            created: now_iso(),
            setup_state: empty_blob(),
            topology_state: empty_blob(),
            simulation_state: SimulationState::default(),
            analysis_state: empty_blob(),
        }
    }

    pub fn tab_state(&self, tab: TabKind) -> Result<Value, ChemsimError> {
        Ok(match tab {
            TabKind::Setup => self.setup_state.clone(),
            TabKind::Topology => self.topology_state.clone(),
            TabKind::Simulation => serde_json::to_value(&self.simulation_state)?,
            TabKind::Analysis => self.analysis_state.clone(),
        })
    }

    pub fn set_tab_state(&mut self, tab: TabKind, blob: Value) -> Result<(), ChemsimError> {
        match tab {
            TabKind::Setup => self.setup_state = blob,
            TabKind::Topology => self.topology_state = blob,
            TabKind::Simulation => {
                let state: SimulationState = serde_json::from_value(blob).map_err(|error| {
                    ChemsimError::Serialization(format!(
                        "simulation state must be an object with an optional tree_data list: {error}"
                    ))
                })?;
                state.records()?;
                self.simulation_state = state;
            }
            TabKind::Analysis => self.analysis_state = blob,
        }
        Ok(())
    }
}

impl Default for SystemRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDocument {
    pub name: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub systems: BTreeMap<String, SystemRecord>,
    #[serde(default)]
    pub active_system: Option<String>,
    #[serde(default)]
    pub global_states: Map<String, Value>,
    #[serde(default, skip_serializing)]
    setup_state: Option<Value>,
    #[serde(default, skip_serializing)]
    topology_state: Option<Value>,
    #[serde(default, skip_serializing)]
    simulation_state: Option<Value>,
}

impl ProjectDocument {
    pub fn new(name: &str) -> Self {
        let now = now_iso();
        ProjectDocument {
            name: name.to_string(),
            created_at: now.clone(),
            last_modified: Some(now),
            systems: BTreeMap::new(),
            active_system: None,
            global_states: Map::new(),
            setup_state: None,
            topology_state: None,
            simulation_state: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_modified = Some(now_iso());
    }

    /// Moves tab state from the flat single-system layout into the default
    /// system. Returns true when anything was migrated.
    pub(crate) fn migrate_flat_layout(&mut self) -> bool {
        if self.setup_state.is_none()
            && self.topology_state.is_none()
            && self.simulation_state.is_none()
        {
            return false;
        }

        let mut record = self
            .systems
            .remove(DEFAULT_SYSTEM_NAME)
            .unwrap_or_default();
        if let Some(blob) = self.setup_state.take() {
            record.setup_state = blob;
        }
        if let Some(blob) = self.topology_state.take() {
            record.topology_state = blob;
        }
        if let Some(blob) = self.simulation_state.take() {
            match serde_json::from_value::<SimulationState>(blob) {
                Ok(state) => record.simulation_state = state,
                Err(error) => log::warn!(
                    "[project] discarded flat-layout simulation state for {}: {error}",
                    self.name
                ),
            }
        }

        self.systems.insert(DEFAULT_SYSTEM_NAME.to_string(), record);
        if self.active_system.is_none() {
            self.active_system = Some(DEFAULT_SYSTEM_NAME.to_string());
        }
        true
    }

    /// Restores the active-system invariant after load or removal.
    pub(crate) fn repair_active_system(&mut self) -> bool {
        let valid = self
            .active_system
            .as_ref()
            .map(|name| self.systems.contains_key(name))
            .unwrap_or(false);
        if valid || (self.systems.is_empty() && self.active_system.is_none()) {
            return false;
        }
        self.active_system = self.systems.keys().next().cloned();
        true
    }
}
