use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Duration;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::{ChemsimError, ErrorClass};
use crate::mdp::{
    nsteps_for_duration, parse_parameters, read_step_parameters, update_parameters,
    write_step_parameters,
};
use crate::process::{self, ProcessEvent, ProcessHandle, ProcessOutcome, ProcessSpec};
use crate::project::TabKind;
use crate::protocol::{StepKind, StepStatus};
use crate::recovery::{reconstruct_from_directory, DroppedCandidate};
use crate::registry::{ProjectManager, ProjectSummary};
use crate::toolchain::{
    write_packer_input, AnalysisRequest, CollectedOutput, PackerComponent, PackerPlan, Toolchain,
};
use crate::topology::{write_topology, TopologyReport, TopologyRequest};
use crate::workspace::now_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobKind {
    Compile,
    Run,
    Pack,
    BuildStructure,
    Analysis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: String,
    pub system: String,
    pub kind: JobKind,
    pub step: Option<String>,
    pub pid: u32,
    pub command: String,
    pub started_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutputLine {
    pub job_id: String,
    pub system: String,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFinished {
    pub job_id: String,
    pub system: String,
    pub kind: JobKind,
    pub step: Option<String>,
    pub ok: bool,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub step_status: Option<StepStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ControllerEvent {
    Launched(JobSummary),
    Output(JobOutputLine),
    Finished(JobFinished),
}

impl ControllerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ControllerEvent::Launched(_) => "job-launched",
            ControllerEvent::Output(_) => "job-output",
            ControllerEvent::Finished(_) => "job-finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildSummary {
    pub system: String,
    pub nodes_before: usize,
    pub nodes_after: usize,
    pub dropped: Vec<DroppedCandidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepParameters {
    pub system: String,
    pub step: String,
    pub kind: StepKind,
    pub path: String,
    pub content: String,
    pub values: BTreeMap<String, String>,
}

/// Changes to a step's parameter file. `content` replaces the text
/// wholesale before `values` are applied; a duration rewrites `nsteps`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterUpdate {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    #[serde(default)]
    pub duration_ns: Option<f64>,
    #[serde(default)]
    pub dt_ps: Option<f64>,
}

struct RunningJob {
    handle: ProcessHandle,
    program: String,
    summary: JobSummary,
    collect: Option<CollectedOutput>,
}

/// Single owner of project state. Worker threads only report over the
/// channel; statuses change and persist here.
pub struct SimulationController {
    projects: ProjectManager,
    toolchain: Toolchain,
    sender: Sender<ProcessEvent>,
    receiver: Receiver<ProcessEvent>,
    jobs: HashMap<String, RunningJob>,
}

impl SimulationController {
    pub fn new(config: &AppConfig) -> Self {
        let (sender, receiver) = channel();
        SimulationController {
            projects: ProjectManager::new(config.config_dir.clone()),
            toolchain: Toolchain::from_config(config),
            sender,
            receiver,
            jobs: HashMap::new(),
        }
    }

    pub fn projects(&self) -> &ProjectManager {
        &self.projects
    }

    fn resolve_system(&self, system: Option<&str>) -> Result<String, ChemsimError> {
        match system.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => self.projects.require_system(name),
            None => self.projects.active_system(),
        }
    }

    fn ensure_idle(&self, system: &str) -> Result<(), ChemsimError> {
        if self.jobs.values().any(|job| job.summary.system == system) {
            return Err(ChemsimError::SystemBusy(system.to_string()));
        }
        Ok(())
    }

    fn ensure_no_jobs(&self) -> Result<(), ChemsimError> {
        match self.jobs.values().next() {
            Some(job) => Err(ChemsimError::SystemBusy(job.summary.system.clone())),
            None => Ok(()),
        }
    }

    pub fn create_project(&mut self, parent_dir: &Path, name: &str) -> Result<ProjectSummary, ChemsimError> {
        self.ensure_no_jobs()?;
        self.projects.create_project(parent_dir, name)
    }

    pub fn open_project(&mut self, root: &Path) -> Result<ProjectSummary, ChemsimError> {
        self.ensure_no_jobs()?;
        self.projects.open_project(root)
    }

    pub fn create_system(&mut self, name: &str) -> Result<PathBuf, ChemsimError> {
        self.projects.create_system(name)
    }

    pub fn clone_system(&mut self, new_name: &str, source: &str) -> Result<PathBuf, ChemsimError> {
        self.projects.clone_system(new_name, source)
    }

    pub fn delete_system(&mut self, name: &str) -> Result<String, ChemsimError> {
        let name = self.projects.require_system(name)?;
        self.ensure_idle(&name)?;
        self.projects.delete_system(&name)
    }

    pub fn set_active_system(&mut self, name: &str) -> Result<(), ChemsimError> {
        self.projects.set_active_system(name)
    }

    pub fn update_tab_state(&mut self, tab: TabKind, blob: Value) -> Result<(), ChemsimError> {
        if tab == TabKind::Simulation {
            let system = self.projects.active_system()?;
            self.ensure_idle(&system)?;
        }
        self.projects.update_tab_state(tab, blob)
    }

    pub fn update_global_state(&mut self, key: &str, value: Value) -> Result<(), ChemsimError> {
        self.projects.update_global_state(key, value)
    }

    pub fn add_step(
        &mut self,
        system: Option<&str>,
        parent: Option<&str>,
        name: &str,
        kind: StepKind,
    ) -> Result<String, ChemsimError> {
        let system = self.resolve_system(system)?;
        let tree = self.projects.tree_mut(&system)?;
        let parent = match parent.map(str::trim).filter(|value| !value.is_empty()) {
            Some(parent) => Some(tree.require(parent)?),
            None => None,
        };
        let id = tree.add_child(parent, name, kind)?;
        let name = tree.node(id).map(|node| node.name.clone()).unwrap_or_default();
        self.projects.save()?;

        log::info!("[controller] {system}: added step {name} ({})", kind.as_str());
        Ok(name)
    }

    /// Removes a step and its descendants. Artifacts on disk stay.
    pub fn remove_step(&mut self, system: Option<&str>, name: &str) -> Result<Vec<String>, ChemsimError> {
        let system = self.resolve_system(system)?;
        let tree = self.projects.tree_mut(&system)?;
        let id = tree.require(name)?;
        if tree.contains_status(id, StepStatus::Running) {
            return Err(ChemsimError::SystemBusy(system));
        }
        let removed = tree.remove_subtree(id)?;
        self.projects.save()?;

        log::info!("[controller] {system}: removed steps {}", removed.join(", "));
        Ok(removed)
    }

    pub fn resolve_input(&self, system: Option<&str>, step: &str) -> Result<PathBuf, ChemsimError> {
        let system = self.resolve_system(system)?;
        let tree = self.projects.tree(&system)?;
        let id = tree.require(step)?;
        tree.resolve_input_file(id, &self.projects.storage_dir(&system)?)
    }

    /// Replaces the protocol tree of one system (or every system) with the
    /// one recovered from its storage directory.
    pub fn rebuild(&mut self, system: Option<&str>) -> Result<Vec<RebuildSummary>, ChemsimError> {
        let targets = match system.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => vec![self.projects.require_system(name)?],
            None => self.projects.system_names()?,
        };
        for target in &targets {
            self.ensure_idle(target)?;
        }

        let mut summaries = Vec::with_capacity(targets.len());
        for target in targets {
            let storage = self.projects.storage_dir(&target)?;
            let reconstruction = reconstruct_from_directory(&storage)?;
            let nodes_before = self.projects.tree(&target)?.len();
            let nodes_after = reconstruction.tree.len();
            self.projects.replace_tree(&target, reconstruction.tree)?;

            log::info!(
                "[recovery] {target}: rebuilt protocol tree ({nodes_before} -> {nodes_after} nodes, {} dropped)",
                reconstruction.dropped.len()
            );
            summaries.push(RebuildSummary {
                system: target,
                nodes_before,
                nodes_after,
                dropped: reconstruction.dropped,
            });
        }
        Ok(summaries)
    }

    pub fn step_parameters(&self, system: Option<&str>, step: &str) -> Result<StepParameters, ChemsimError> {
        let system = self.resolve_system(system)?;
        let tree = self.projects.tree(&system)?;
        let node = tree
            .node(tree.require(step)?)
            .ok_or_else(|| ChemsimError::NotFound {
                what: "step",
                name: step.to_string(),
            })?;
        let storage = self.projects.storage_dir(&system)?;
        let content = read_step_parameters(
            &storage,
            &self.projects.templates_dir()?,
            &node.name,
            node.kind,
        )?;

        Ok(StepParameters {
            path: crate::mdp::step_parameter_path(&storage, &node.name)
                .display()
                .to_string(),
            values: parse_parameters(&content),
            system,
            step: node.name.clone(),
            kind: node.kind,
            content,
        })
    }

    pub fn update_step_parameters(
        &mut self,
        system: Option<&str>,
        step: &str,
        update: ParameterUpdate,
    ) -> Result<StepParameters, ChemsimError> {
        let current = self.step_parameters(system, step)?;
        let mut content = update.content.unwrap_or(current.content);
        let mut values: Vec<(String, String)> = update.values.into_iter().collect();

        if let Some(duration_ns) = update.duration_ns {
            let dt_ps = match update.dt_ps {
                Some(dt_ps) => dt_ps,
                None => parse_parameters(&content)
                    .get("dt")
                    .and_then(|value| value.parse::<f64>().ok())
                    .ok_or_else(|| {
                        ChemsimError::InvalidName(
                            "a duration needs a time step (dt) in the payload or the file.".to_string(),
                        )
                    })?,
            };
            values.push(("nsteps".to_string(), nsteps_for_duration(duration_ns, dt_ps)?.to_string()));
            if update.dt_ps.is_some() {
                values.push(("dt".to_string(), dt_ps.to_string()));
            }
        }

        if !values.is_empty() {
            content = update_parameters(&content, &values)?;
        }
        let storage = self.projects.storage_dir(&current.system)?;
        write_step_parameters(&storage, &current.step, &content)?;
        log::info!("[controller] {}: saved parameters for {}", current.system, current.step);

        Ok(StepParameters {
            values: parse_parameters(&content),
            content,
            ..current
        })
    }

    fn launch_job(
        &mut self,
        system: String,
        kind: JobKind,
        step: Option<String>,
        spec: ProcessSpec,
        collect: Option<CollectedOutput>,
    ) -> Result<JobSummary, ChemsimError> {
        let job_id = Uuid::new_v4().to_string();
        let program = spec.program.clone();
        let command = spec.command_line();
        let handle = process::launch(spec, job_id.clone(), self.sender.clone())?;

        let summary = JobSummary {
            job_id: job_id.clone(),
            system,
            kind,
            step,
            pid: handle.pid(),
            command,
            started_at: now_iso(),
        };
        self.jobs.insert(
            job_id,
            RunningJob {
                handle,
                program,
                summary: summary.clone(),
                collect,
            },
        );
        Ok(summary)
    }

    pub fn compile_step(&mut self, system: Option<&str>, step: &str) -> Result<JobSummary, ChemsimError> {
        let system = self.resolve_system(system)?;
        self.ensure_idle(&system)?;
        let storage = self.projects.storage_dir(&system)?;
        let tree = self.projects.tree(&system)?;
        let id = tree.require(step)?;
        let input = tree.resolve_input_file(id, &storage)?;
        let name = tree.node(id).map(|node| node.name.clone()).unwrap_or_default();

        let spec = self.toolchain.compile(&storage, &name, &input);
        self.launch_job(system, JobKind::Compile, Some(name), spec, None)
    }

    /// Launches the engine for a compiled step and marks it running.
    pub fn run_step(&mut self, system: Option<&str>, step: &str) -> Result<JobSummary, ChemsimError> {
        let system = self.resolve_system(system)?;
        self.ensure_idle(&system)?;
        let storage = self.projects.storage_dir(&system)?;
        let tree = self.projects.tree(&system)?;
        let id = tree.require(step)?;
        let Some(node) = tree.node(id) else {
            return Err(ChemsimError::NotFound {
                what: "step",
                name: step.to_string(),
            });
        };
        if !node.status.can_transition_to(StepStatus::Running) {
            return Err(ChemsimError::InvalidTransition {
                name: node.name.clone(),
                from: node.status.as_str(),
                to: StepStatus::Running.as_str(),
            });
        }
        let name = node.name.clone();

        let spec = self.toolchain.run(&storage, &name);
        let summary = self.launch_job(system.clone(), JobKind::Run, Some(name), spec, None)?;
        self.projects.tree_mut(&system)?.set_status(id, StepStatus::Running)?;
        if let Err(error) = self.projects.save() {
            log::warn!("[controller] {system}: failed to persist running status: {error}");
        }
        Ok(summary)
    }

    pub fn run_packer(
        &mut self,
        system: Option<&str>,
        components: &[PackerComponent],
        margin_percent: f64,
        tolerance: Option<f64>,
    ) -> Result<(PackerPlan, JobSummary), ChemsimError> {
        let system = self.resolve_system(system)?;
        self.ensure_idle(&system)?;
        let storage = self.projects.storage_dir(&system)?;
        let plan = write_packer_input(&storage, components, margin_percent, tolerance)?;
        let spec = self.toolchain.pack(&storage);
        let summary = self.launch_job(system, JobKind::Pack, None, spec, None)?;
        Ok((plan, summary))
    }

    pub fn build_structure(&mut self, system: Option<&str>, box_edge_nm: f64) -> Result<JobSummary, ChemsimError> {
        let system = self.resolve_system(system)?;
        self.ensure_idle(&system)?;
        let storage = self.projects.storage_dir(&system)?;
        let spec = self.toolchain.build_structure(&storage, box_edge_nm)?;
        self.launch_job(system, JobKind::BuildStructure, None, spec, None)
    }

    pub fn run_analysis(
        &mut self,
        system: Option<&str>,
        request: &AnalysisRequest,
    ) -> Result<JobSummary, ChemsimError> {
        let system = self.resolve_system(system)?;
        self.ensure_idle(&system)?;
        let storage = self.projects.storage_dir(&system)?;
        let step = self.projects.tree(&system)?.require(request.step())?;
        let step_name = self
            .projects
            .tree(&system)?
            .node(step)
            .map(|node| node.name.clone());
        let spec = self.toolchain.analysis(&storage, request)?;
        let collect = self.toolchain.collected_output(&storage, request);
        self.launch_job(system, JobKind::Analysis, step_name, spec, collect)
    }

    /// Writes the system's `topol.top`; refused while the system has a job.
    pub fn write_topology(
        &mut self,
        system: Option<&str>,
        request: &TopologyRequest,
    ) -> Result<TopologyReport, ChemsimError> {
        let system = self.resolve_system(system)?;
        self.ensure_idle(&system)?;
        let storage = self.projects.storage_dir(&system)?;
        write_topology(&storage, request)
    }

    /// Requests termination of a job, addressed by id or by system. Returns
    /// false when the process had already exited.
    pub fn stop(&mut self, job_id: Option<&str>, system: Option<&str>) -> Result<bool, ChemsimError> {
        let job = match job_id.map(str::trim).filter(|value| !value.is_empty()) {
            Some(job_id) => self.jobs.get(job_id),
            None => {
                let system = self.resolve_system(system)?;
                self.jobs.values().find(|job| job.summary.system == system)
            }
        };
        let Some(job) = job else {
            return Err(ChemsimError::NotFound {
                what: "job",
                name: job_id.or(system).unwrap_or("(active system)").to_string(),
            });
        };

        log::info!("[controller] stopping job {} ({})", job.summary.job_id, job.summary.command);
        job.handle.cancel()
    }

    pub fn jobs(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<JobSummary> = self.jobs.values().map(|job| job.summary.clone()).collect();
        jobs.sort_by(|left, right| left.started_at.cmp(&right.started_at));
        jobs
    }

    /// Waits up to `timeout` for worker events, then drains whatever else is
    /// queued. Terminal outcomes are applied to the tree and persisted.
    pub fn poll(&mut self, timeout: Duration) -> Vec<ControllerEvent> {
        let Ok(first) = self.receiver.recv_timeout(timeout) else {
            return Vec::new();
        };
        let mut pending = vec![first];
        while let Ok(event) = self.receiver.try_recv() {
            pending.push(event);
        }

        pending
            .into_iter()
            .filter_map(|event| self.apply(event))
            .collect()
    }

    fn system_for(&self, job_id: &str) -> String {
        self.jobs
            .get(job_id)
            .map(|job| job.summary.system.clone())
            .unwrap_or_default()
    }

    fn apply(&mut self, event: ProcessEvent) -> Option<ControllerEvent> {
        match event {
            ProcessEvent::Launched { job_id, .. } => self
                .jobs
                .get(&job_id)
                .map(|job| ControllerEvent::Launched(job.summary.clone())),
            ProcessEvent::Output { job_id, line } => Some(ControllerEvent::Output(JobOutputLine {
                system: self.system_for(&job_id),
                job_id,
                line,
            })),
            ProcessEvent::Finished { job_id, outcome } => {
                let job = self.jobs.remove(&job_id)?;
                Some(ControllerEvent::Finished(self.finish(job, outcome)))
            }
        }
    }

    fn finish(&mut self, job: RunningJob, outcome: ProcessOutcome) -> JobFinished {
        let RunningJob {
            handle,
            program,
            summary,
            collect,
        } = job;
        handle.join();

        let mut result = outcome.into_result(&program);
        if let (Ok(()), Some(collect)) = (&result, &collect) {
            result = collect.collect(&program);
        }
        match &result {
            Ok(()) => log::info!("[controller] job {} succeeded: {}", summary.job_id, summary.command),
            Err(ChemsimError::UserCancelled) => {
                log::info!("[controller] job {} stopped by user", summary.job_id)
            }
            Err(error) => log::warn!("[controller] job {} failed: {error}", summary.job_id),
        }

        let step_status = if summary.kind == JobKind::Run {
            self.settle_run(&summary, result.is_ok())
        } else {
            None
        };

        JobFinished {
            job_id: summary.job_id,
            system: summary.system,
            kind: summary.kind,
            step: summary.step,
            ok: result.is_ok(),
            error_class: result.as_ref().err().map(ChemsimError::class),
            error: result.err().map(|error| error.to_string()),
            step_status,
        }
    }

    fn settle_run(&mut self, summary: &JobSummary, succeeded: bool) -> Option<StepStatus> {
        let step = summary.step.as_deref()?;
        let status = if succeeded {
            StepStatus::Completed
        } else {
            StepStatus::Error
        };

        match self.record_step_status(&summary.system, step, status) {
            Ok(()) => Some(status),
            Err(error) => {
                log::warn!(
                    "[controller] {}: could not record {} for {step}: {error}",
                    summary.system,
                    status.as_str()
                );
                None
            }
        }
    }

    fn record_step_status(
        &mut self,
        system: &str,
        step: &str,
        status: StepStatus,
    ) -> Result<(), ChemsimError> {
        let tree = self.projects.tree_mut(system)?;
        let id = tree.require(step)?;
        tree.set_status(id, status)?;
        self.projects.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Instant;
    use tempfile::TempDir;

    struct Fixture {
        config: TempDir,
        projects: TempDir,
        controller: SimulationController,
        storage: PathBuf,
    }

    /// The engine binary is `sh`, so `sh mdrun -deffnm x` runs a script
    /// named `mdrun` from the storage directory. TRAVIS is a script the
    /// test writes into the config directory.
    fn fixture() -> Fixture {
        let config_dir = TempDir::new().unwrap();
        let projects = TempDir::new().unwrap();
        let config = AppConfig {
            config_dir: config_dir.path().to_path_buf(),
            md_engine_binary: "sh".to_string(),
            packer_binary: "sh".to_string(),
            travis_binary: config_dir.path().join("travis").display().to_string(),
            grompp_maxwarn: 2,
        };
        let mut controller = SimulationController::new(&config);
        controller.create_project(projects.path(), "co2").unwrap();
        let storage = controller.projects().active_storage_path().unwrap();
        Fixture {
            config: config_dir,
            projects,
            controller,
            storage,
        }
    }

    fn wait_finished(controller: &mut SimulationController, job_id: &str) -> (Vec<String>, JobFinished) {
        let deadline = Instant::now() + Duration::from_secs(20);
        let mut lines = Vec::new();
        while Instant::now() < deadline {
            for event in controller.poll(Duration::from_millis(100)) {
                match event {
                    ControllerEvent::Output(output) if output.job_id == job_id => lines.push(output.line),
                    ControllerEvent::Finished(finished) if finished.job_id == job_id => {
                        return (lines, finished)
                    }
                    _ => {}
                }
            }
        }
        panic!("job {job_id} did not finish");
    }

    fn status_of(controller: &SimulationController, step: &str) -> StepStatus {
        let system = controller.projects().active_system().unwrap();
        let tree = controller.projects().tree(&system).unwrap();
        tree.node(tree.require(step).unwrap()).unwrap().status
    }

    #[test]
    fn successful_run_completes_step() {
        let mut fixture = fixture();
        fixture
            .controller
            .add_step(None, None, "minim", StepKind::Minimization)
            .unwrap();
        fs::write(fixture.storage.join("minim.tpr"), "").unwrap();
        fs::write(fixture.storage.join("mdrun"), "echo \"step $2 converged\"\nexit 0\n").unwrap();

        let job = fixture.controller.run_step(None, "minim").unwrap();
        assert_eq!(job.command, "sh mdrun -deffnm minim");
        assert_eq!(status_of(&fixture.controller, "minim"), StepStatus::Running);

        let (lines, finished) = wait_finished(&mut fixture.controller, &job.job_id);
        assert!(finished.ok);
        assert_eq!(lines, vec!["step minim converged".to_string()]);
        assert_eq!(finished.step_status, Some(StepStatus::Completed));
        assert_eq!(status_of(&fixture.controller, "minim"), StepStatus::Completed);
        assert!(fixture.controller.jobs().is_empty());
    }

    #[test]
    fn failed_run_marks_step_as_error() {
        let mut fixture = fixture();
        fixture
            .controller
            .add_step(None, None, "minim", StepKind::Minimization)
            .unwrap();
        fs::write(fixture.storage.join("minim.tpr"), "").unwrap();
        fs::write(fixture.storage.join("mdrun"), "echo 'Fatal error: blowing up' 1>&2\nexit 1\n").unwrap();

        let job = fixture.controller.run_step(None, "minim").unwrap();
        let (_, finished) = wait_finished(&mut fixture.controller, &job.job_id);

        assert!(!finished.ok);
        assert_eq!(finished.error_class, Some(ErrorClass::Execution));
        assert!(finished.error.unwrap().contains("blowing up"));
        assert_eq!(status_of(&fixture.controller, "minim"), StepStatus::Error);
    }

    #[test]
    fn one_job_per_system_and_stop_is_informational() {
        let mut fixture = fixture();
        let controller = &mut fixture.controller;
        controller.add_step(None, None, "minim", StepKind::Minimization).unwrap();
        controller.add_step(None, None, "minim_b", StepKind::Minimization).unwrap();
        fs::write(fixture.storage.join("minim.tpr"), "").unwrap();
        fs::write(fixture.storage.join("minim_b.tpr"), "").unwrap();
        fs::write(fixture.storage.join("mdrun"), "exec sleep 30\n").unwrap();

        let job = controller.run_step(None, "minim").unwrap();
        assert_eq!(
            controller.run_step(None, "minim_b"),
            Err(ChemsimError::SystemBusy("default".to_string()))
        );
        assert!(matches!(
            controller.delete_system("default"),
            Err(ChemsimError::SystemBusy(_))
        ));
        assert!(matches!(
            controller.remove_step(None, "minim"),
            Err(ChemsimError::SystemBusy(_))
        ));

        assert!(controller.stop(Some(&job.job_id), None).unwrap());
        let (_, finished) = wait_finished(controller, &job.job_id);
        assert!(!finished.ok);
        assert_eq!(finished.error_class, Some(ErrorClass::Informational));
        assert_eq!(status_of(controller, "minim"), StepStatus::Error);
    }

    #[test]
    fn compile_requires_upstream_structure() {
        let mut fixture = fixture();
        let controller = &mut fixture.controller;
        controller.add_step(None, None, "minim", StepKind::Minimization).unwrap();
        controller
            .add_step(None, Some("minim"), "nvt", StepKind::Generation)
            .unwrap();

        assert_eq!(
            controller.compile_step(None, "nvt"),
            Err(ChemsimError::MissingUpstream {
                file: "minim.gro".to_string(),
                upstream: "minim".to_string(),
            })
        );
        assert!(controller.jobs().is_empty());
    }

    #[test]
    fn compile_checks_parameter_file_before_spawning() {
        let mut fixture = fixture();
        let controller = &mut fixture.controller;
        controller.add_step(None, None, "minim", StepKind::Minimization).unwrap();
        fs::write(fixture.storage.join("system.gro"), "").unwrap();
        fs::write(fixture.storage.join("topol.top"), "").unwrap();

        let missing = controller.compile_step(None, "minim");
        assert!(matches!(missing, Err(ChemsimError::MissingInput(path)) if path.ends_with("minim.mdp")));

        fs::write(fixture.storage.join("minim.mdp"), "integrator = steep\n").unwrap();
        fs::write(fixture.storage.join("grompp"), "echo \"$@\"\n").unwrap();
        let job = controller.compile_step(None, "minim").unwrap();
        let (lines, finished) = wait_finished(controller, &job.job_id);
        assert!(finished.ok);
        assert_eq!(finished.step_status, None);
        assert_eq!(
            lines,
            vec!["-f minim.mdp -c system.gro -p topol.top -o minim.tpr -maxwarn 2".to_string()]
        );
    }

    #[test]
    fn rebuild_recovers_chain_and_persists() {
        let mut fixture = fixture();
        for file in [
            "minim.gro",
            "minim_prev.gro",
            "gen1.tpr",
            "equil1.gro",
            "equil_350.gro",
            "prod1.xtc",
            "topol.top",
        ] {
            fs::write(fixture.storage.join(file), "").unwrap();
        }

        let summaries = fixture.controller.rebuild(None).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].nodes_before, 0);
        assert_eq!(summaries[0].nodes_after, 4);
        assert_eq!(summaries[0].dropped.len(), 1);
        assert_eq!(summaries[0].dropped[0].name, "equil_350");

        let root = fixture.projects.path().join("co2");
        let mut reopened = ProjectManager::new(fixture.config.path());
        reopened.open_project(&root).unwrap();
        let tree = reopened.tree("default").unwrap();
        let records = tree.to_records();
        assert_eq!(records[0].name, "minim");
        assert_eq!(records[0].children[0].children[0].children[0].name, "prod1");
        assert_eq!(records[0].status, StepStatus::Completed);
    }

    #[test]
    fn updates_parameters_from_duration() {
        let mut fixture = fixture();
        fixture
            .controller
            .add_step(None, None, "prod", StepKind::Production)
            .unwrap();
        let templates = fixture.projects.path().join("co2").join("templates");
        fs::write(templates.join("prod.mdp"), "dt      = 0.002 ; ps\nnsteps  = 10\n").unwrap();

        let update = ParameterUpdate {
            duration_ns: Some(2.0),
            ..ParameterUpdate::default()
        };
        let saved = fixture
            .controller
            .update_step_parameters(None, "prod", update)
            .unwrap();

        assert_eq!(saved.values.get("nsteps").map(String::as_str), Some("1000000"));
        assert!(fixture.storage.join("prod.mdp").is_file());
        assert!(saved.content.contains("dt      = 0.002 ; ps"));
    }

    #[test]
    fn writes_topology_into_system_storage() {
        let mut fixture = fixture();
        fs::write(
            fixture.storage.join("co2.itp"),
            "[ moleculetype ]\nCO2N 1\n[ atoms ]\n1 C 1 CO2 C 1 0.7 12.011\n",
        )
        .unwrap();
        let request: TopologyRequest = serde_json::from_value(serde_json::json!({
            "molecules": [{"name": "CO2", "count": 100, "itp": "co2.itp"}]
        }))
        .unwrap();

        let report = fixture.controller.write_topology(None, &request).unwrap();
        assert_eq!(report.molecules[0].name, "CO2N");
        assert!(fixture.storage.join("topol.top").is_file());
        assert!(fixture.storage.join("clean_co2.itp").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn travis_rdf_output_is_moved_to_requested_name() {
        use std::os::unix::fs::PermissionsExt;

        let mut fixture = fixture();
        fixture
            .controller
            .add_step(None, None, "prod", StepKind::Production)
            .unwrap();
        for file in ["system_init.pdb", "prod.xtc"] {
            fs::write(fixture.storage.join(file), "").unwrap();
        }
        let travis = fixture.config.path().join("travis");
        fs::write(
            &travis,
            "#!/bin/sh\nread request\necho \"$request\"\n[ \"$2\" = system_init.pdb ] && printf 'r;g(r)\\n' > rdf_molecule_CO2_molecule_CO2.csv\nexit 0\n",
        )
        .unwrap();
        fs::set_permissions(&travis, fs::Permissions::from_mode(0o755)).unwrap();

        let request = AnalysisRequest::TravisRdf {
            step: "prod".to_string(),
            output: "rdf_co2".to_string(),
            first: "CO2".to_string(),
            second: "CO2".to_string(),
            structure: None,
        };
        let job = fixture.controller.run_analysis(None, &request).unwrap();
        let (lines, finished) = wait_finished(&mut fixture.controller, &job.job_id);
        assert!(finished.ok, "{:?}", finished.error);
        assert_eq!(lines, vec!["rdf molecule CO2 molecule CO2".to_string()]);
        assert!(fixture.storage.join("rdf_co2.csv").is_file());
        assert!(!fixture.storage.join("rdf_molecule_CO2_molecule_CO2.csv").exists());

        fs::write(fixture.storage.join("other.pdb"), "").unwrap();
        let request = AnalysisRequest::TravisRdf {
            step: "prod".to_string(),
            output: "rdf_other".to_string(),
            first: "CO2".to_string(),
            second: "CO2".to_string(),
            structure: Some("other.pdb".to_string()),
        };
        let job = fixture.controller.run_analysis(None, &request).unwrap();
        let (_, finished) = wait_finished(&mut fixture.controller, &job.job_id);
        assert!(!finished.ok);
        assert_eq!(finished.error_class, Some(ErrorClass::Execution));
        assert!(!fixture.storage.join("rdf_other.csv").exists());
    }

    #[test]
    fn stop_without_job_is_not_found() {
        let mut fixture = fixture();
        assert!(matches!(
            fixture.controller.stop(None, None),
            Err(ChemsimError::NotFound { what: "job", .. })
        ));
    }
}
