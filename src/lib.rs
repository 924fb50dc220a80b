mod backend;
mod config;
mod controller;
mod errors;
mod mdp;
mod process;
mod project;
mod protocol;
mod recovery;
mod registry;
mod store;
mod toolchain;
mod topology;
mod workspace;

pub use backend::frontend_command_registry::ControllerState;
pub use config::{AppConfig, GlobalSettings};
pub use controller::{ControllerEvent, JobFinished, JobKind, JobSummary, SimulationController};
pub use errors::{ChemsimError, ErrorClass};
pub use process::{launch, ProcessEvent, ProcessHandle, ProcessOutcome, ProcessSpec};
pub use project::{ProjectDocument, SystemRecord, TabKind};
pub use protocol::{NodeId, ProtocolTree, StepKind, StepRecord, StepStatus};
pub use recovery::{reconstruct_from_directory, reconstruct_from_names, Reconstruction};
pub use registry::{ProjectManager, ProjectSummary, RecoveredTree};
pub use store::{load_document, save_document};
pub use topology::{molar_mass_from_pdb, write_topology, TopologyReport, TopologyRequest};

pub fn run() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    backend::frontend_command_registry::command_entry::run();
}
