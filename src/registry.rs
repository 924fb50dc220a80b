use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::record_recent_project;
use crate::errors::ChemsimError;
use crate::project::{
    ProjectDocument, SystemRecord, TabKind, DEFAULT_SYSTEM_NAME, ESSENTIAL_EXTENSIONS,
    PROJECT_SUBDIRECTORIES, STORAGE_DIR,
};
use crate::protocol::ProtocolTree;
use crate::recovery::{reconstruct_from_directory, DroppedCandidate};
use crate::store::{load_document, project_db_path, save_document};
use crate::workspace::{
    ensure_directory, file_extension, normalize_project_name, normalize_system_name,
    path_is_file,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub name: String,
    pub root_path: String,
    pub created_at: String,
    pub last_modified: Option<String>,
    pub systems: Vec<String>,
    pub active_system: Option<String>,
    pub active_storage_path: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recovered_trees: Vec<RecoveredTree>,
}

/// A system whose stored protocol tree could not be read on open and was
/// rebuilt from its storage directory instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveredTree {
    pub system: String,
    pub reason: String,
    pub nodes: usize,
    pub dropped: Vec<DroppedCandidate>,
}

#[derive(Debug)]
pub struct LoadedProject {
    root: PathBuf,
    document: ProjectDocument,
    trees: BTreeMap<String, ProtocolTree>,
    recovered: Vec<RecoveredTree>,
}

impl LoadedProject {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document(&self) -> &ProjectDocument {
        &self.document
    }

    fn storage_dir(&self, system: &str) -> PathBuf {
        self.root.join(STORAGE_DIR).join(system)
    }

    fn require_system(&self, name: &str) -> Result<String, ChemsimError> {
        let name = name.trim();
        if self.document.systems.contains_key(name) {
            Ok(name.to_string())
        } else {
            Err(ChemsimError::NotFound {
                what: "system",
                name: name.to_string(),
            })
        }
    }

    fn active_system(&self) -> Result<String, ChemsimError> {
        self.document
            .active_system
            .clone()
            .filter(|name| self.document.systems.contains_key(name))
            .ok_or_else(|| ChemsimError::NotFound {
                what: "system",
                name: "(active)".to_string(),
            })
    }

    fn sync_tree_records(&mut self) -> Result<(), ChemsimError> {
        for (name, tree) in &self.trees {
            if let Some(record) = self.document.systems.get_mut(name) {
                record.simulation_state.set_records(&tree.to_records())?;
            }
        }
        Ok(())
    }

    fn insert_system(&mut self, name: &str, record: SystemRecord, tree: ProtocolTree) {
        self.document.systems.insert(name.to_string(), record);
        self.trees.insert(name.to_string(), tree);
    }

    fn persist(&mut self) -> Result<(), ChemsimError> {
        self.sync_tree_records()?;
        self.document.touch();
        save_document(&self.root, &self.document)
    }

    fn summary(&self) -> ProjectSummary {
        let active_storage_path = self
            .active_system()
            .ok()
            .map(|name| self.storage_dir(&name).display().to_string());
        ProjectSummary {
            name: self.document.name.clone(),
            root_path: self.root.display().to_string(),
            created_at: self.document.created_at.clone(),
            last_modified: self.document.last_modified.clone(),
            systems: self.document.systems.keys().cloned().collect(),
            active_system: self.document.active_system.clone(),
            active_storage_path,
            recovered_trees: self.recovered.clone(),
        }
    }
}

fn load_tree(record: &SystemRecord) -> Result<ProtocolTree, ChemsimError> {
    ProtocolTree::from_records(&record.simulation_state.records()?)
}

/// Owns the open project: its document, one protocol tree per system and
/// the storage directories on disk. Every mutation persists immediately.
#[derive(Debug)]
pub struct ProjectManager {
    config_dir: PathBuf,
    current: Option<LoadedProject>,
}

impl ProjectManager {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        ProjectManager {
            config_dir: config_dir.into(),
            current: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn project(&self) -> Result<&LoadedProject, ChemsimError> {
        self.current.as_ref().ok_or(ChemsimError::NoProject)
    }

    fn project_mut(&mut self) -> Result<&mut LoadedProject, ChemsimError> {
        self.current.as_mut().ok_or(ChemsimError::NoProject)
    }

    pub fn summary(&self) -> Option<ProjectSummary> {
        self.current.as_ref().map(LoadedProject::summary)
    }

    fn remember(&self, root: &Path) {
        if let Err(error) = record_recent_project(&self.config_dir, root) {
            log::warn!("[registry] failed to update recent projects: {error}");
        }
    }

    pub fn create_project(
        &mut self,
        parent_dir: &Path,
        name: &str,
    ) -> Result<ProjectSummary, ChemsimError> {
        let name = normalize_project_name(name)?;
        let root = parent_dir.join(&name);
        if path_is_file(&project_db_path(&root)) {
            return Err(ChemsimError::DuplicateName {
                what: "project",
                name: root.display().to_string(),
            });
        }

        for subdirectory in PROJECT_SUBDIRECTORIES {
            ensure_directory(&root.join(subdirectory))?;
        }

        let mut project = LoadedProject {
            root: root.clone(),
            document: ProjectDocument::new(&name),
            trees: BTreeMap::new(),
            recovered: Vec::new(),
        };
        ensure_directory(&project.storage_dir(DEFAULT_SYSTEM_NAME))?;
        project.insert_system(DEFAULT_SYSTEM_NAME, SystemRecord::new(), ProtocolTree::new());
        project.document.active_system = Some(DEFAULT_SYSTEM_NAME.to_string());
        save_document(&root, &project.document)?;

        log::info!("[registry] created project {name} at {}", root.display());
        self.remember(&root);
        let summary = project.summary();
        self.current = Some(project);
        Ok(summary)
    }

    pub fn open_project(&mut self, root: &Path) -> Result<ProjectSummary, ChemsimError> {
        let mut document = load_document(root)?;
        let mut changed = document.migrate_flat_layout();
        if document.systems.is_empty() {
            document
                .systems
                .insert(DEFAULT_SYSTEM_NAME.to_string(), SystemRecord::new());
            changed = true;
        }
        changed |= document.repair_active_system();

        let mut trees = BTreeMap::new();
        let mut recovered = Vec::new();
        for (name, record) in &document.systems {
            let storage = root.join(STORAGE_DIR).join(name);
            ensure_directory(&storage)?;
            let mut tree = match load_tree(record) {
                Ok(tree) => tree,
                Err(error) => {
                    log::warn!(
                        "[registry] {name}: stored protocol tree is unreadable ({error}); rebuilding from {}",
                        storage.display()
                    );
                    let reconstruction = reconstruct_from_directory(&storage)?;
                    recovered.push(RecoveredTree {
                        system: name.clone(),
                        reason: error.to_string(),
                        nodes: reconstruction.tree.len(),
                        dropped: reconstruction.dropped,
                    });
                    changed = true;
                    reconstruction.tree
                }
            };
            let settled = tree.settle_interrupted();
            if !settled.is_empty() {
                log::warn!(
                    "[registry] {name}: steps left running by a previous session marked as error: {}",
                    settled.join(", ")
                );
                changed = true;
            }
            trees.insert(name.clone(), tree);
        }

        let mut project = LoadedProject {
            root: root.to_path_buf(),
            document,
            trees,
            recovered,
        };
        if changed {
            project.persist()?;
        }

        log::info!("[registry] opened project {} at {}", project.document.name, root.display());
        self.remember(root);
        let summary = project.summary();
        self.current = Some(project);
        Ok(summary)
    }

    pub fn system_names(&self) -> Result<Vec<String>, ChemsimError> {
        Ok(self.project()?.document.systems.keys().cloned().collect())
    }

    pub fn active_system(&self) -> Result<String, ChemsimError> {
        self.project()?.active_system()
    }

    pub fn require_system(&self, name: &str) -> Result<String, ChemsimError> {
        self.project()?.require_system(name)
    }

    pub fn storage_dir(&self, system: &str) -> Result<PathBuf, ChemsimError> {
        let project = self.project()?;
        let system = project.require_system(system)?;
        Ok(project.storage_dir(&system))
    }

    pub fn active_storage_path(&self) -> Option<PathBuf> {
        let project = self.current.as_ref()?;
        let system = project.active_system().ok()?;
        Some(project.storage_dir(&system))
    }

    pub fn templates_dir(&self) -> Result<PathBuf, ChemsimError> {
        Ok(self.project()?.root.join(crate::project::TEMPLATES_DIR))
    }

    pub fn create_system(&mut self, name: &str) -> Result<PathBuf, ChemsimError> {
        let name = normalize_system_name(name)?;
        let project = self.project_mut()?;
        if project.document.systems.contains_key(&name) {
            return Err(ChemsimError::DuplicateName { what: "system", name });
        }

        let storage = project.storage_dir(&name);
        ensure_directory(&storage)?;
        project.insert_system(&name, SystemRecord::new(), ProtocolTree::new());
        project.document.active_system = Some(name.clone());
        project.persist()?;

        log::info!("[registry] created system {name}");
        Ok(storage)
    }

    /// Copies the source system's state with every step reset to pending
    /// and its essential input files. Copy failures leave the new system
    /// registered and active and are reported as `PartialClone`.
    pub fn clone_system(&mut self, new_name: &str, source: &str) -> Result<PathBuf, ChemsimError> {
        let new_name = normalize_system_name(new_name)?;
        let project = self.project_mut()?;
        let source = project.require_system(source)?;
        if project.document.systems.contains_key(&new_name) {
            return Err(ChemsimError::DuplicateName {
                what: "system",
                name: new_name,
            });
        }

        project.sync_tree_records()?;
        let mut record = project.document.systems[&source].clone();
        record.created = crate::workspace::now_iso();
        let mut tree = load_tree(&record)?;
        tree.reset_statuses();
        record.simulation_state.set_records(&tree.to_records())?;

        let source_dir = project.storage_dir(&source);
        let target_dir = project.storage_dir(&new_name);
        ensure_directory(&target_dir)?;
        let (copied, failures) = copy_essential_files(&source_dir, &target_dir);

        project.insert_system(&new_name, record, tree);
        project.document.active_system = Some(new_name.clone());
        project.persist()?;

        log::info!(
            "[registry] cloned system {source} into {new_name} ({} files copied)",
            copied.len()
        );
        if failures.is_empty() {
            Ok(target_dir)
        } else {
            log::warn!("[registry] clone of {source} into {new_name} was partial");
            Err(ChemsimError::PartialClone {
                system: new_name,
                copied: copied.len(),
                failures,
            })
        }
    }

    /// Removes a system and its storage directory. Returns the system that
    /// is active afterwards.
    pub fn delete_system(&mut self, name: &str) -> Result<String, ChemsimError> {
        let project = self.project_mut()?;
        let name = project.require_system(name)?;
        let storage = project.storage_dir(&name);

        match fs::remove_dir_all(&storage) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(ChemsimError::io_at("remove", &storage, error)),
        }
        project.document.systems.remove(&name);
        project.trees.remove(&name);

        if project.document.systems.is_empty() {
            ensure_directory(&project.storage_dir(DEFAULT_SYSTEM_NAME))?;
            project.insert_system(DEFAULT_SYSTEM_NAME, SystemRecord::new(), ProtocolTree::new());
            project.document.active_system = Some(DEFAULT_SYSTEM_NAME.to_string());
        } else {
            project.document.repair_active_system();
        }
        project.persist()?;

        let active = project.active_system()?;
        log::info!("[registry] deleted system {name}; active system is {active}");
        Ok(active)
    }

    pub fn set_active_system(&mut self, name: &str) -> Result<(), ChemsimError> {
        let project = self.project_mut()?;
        let name = project.require_system(name)?;
        project.document.active_system = Some(name);
        project.persist()
    }

    pub fn tab_state(&self, tab: TabKind) -> Result<Value, ChemsimError> {
        let project = self.project()?;
        let system = project.active_system()?;
        let mut record = project.document.systems[&system].clone();
        if let Some(tree) = project.trees.get(&system) {
            record.simulation_state.set_records(&tree.to_records())?;
        }
        record.tab_state(tab)
    }

    /// Replaces one tab blob of the active system. A simulation blob also
    /// replaces the system's protocol tree; steps it claims are running have
    /// no process behind them and are stored as errors.
    pub fn update_tab_state(&mut self, tab: TabKind, blob: Value) -> Result<(), ChemsimError> {
        let project = self.project_mut()?;
        let system = project.active_system()?;
        let mut record = project.document.systems[&system].clone();
        record.set_tab_state(tab, blob)?;

        if tab == TabKind::Simulation {
            let mut tree = load_tree(&record)?;
            let settled = tree.settle_interrupted();
            if !settled.is_empty() {
                log::warn!(
                    "[registry] {system}: tab state marked steps running without a job; stored as error: {}",
                    settled.join(", ")
                );
            }
            project.trees.insert(system.clone(), tree);
        }
        project.document.systems.insert(system, record);
        project.persist()
    }

    pub fn global_state(&self, key: &str) -> Result<Value, ChemsimError> {
        Ok(self
            .project()?
            .document
            .global_states
            .get(key)
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub fn update_global_state(&mut self, key: &str, value: Value) -> Result<(), ChemsimError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ChemsimError::InvalidName(
                "global state key must be a non-empty string.".to_string(),
            ));
        }
        let project = self.project_mut()?;
        project.document.global_states.insert(key.to_string(), value);
        project.persist()
    }

    pub fn tree(&self, system: &str) -> Result<&ProtocolTree, ChemsimError> {
        let project = self.project()?;
        let system = project.require_system(system)?;
        project.trees.get(&system).ok_or(ChemsimError::NotFound {
            what: "system",
            name: system,
        })
    }

    /// Mutable tree access; callers persist with `save` once done.
    pub fn tree_mut(&mut self, system: &str) -> Result<&mut ProtocolTree, ChemsimError> {
        let project = self.project_mut()?;
        let system = project.require_system(system)?;
        Ok(project.trees.entry(system).or_default())
    }

    pub fn replace_tree(&mut self, system: &str, tree: ProtocolTree) -> Result<(), ChemsimError> {
        let project = self.project_mut()?;
        let system = project.require_system(system)?;
        project.trees.insert(system, tree);
        project.persist()
    }

    pub fn save(&mut self) -> Result<(), ChemsimError> {
        self.project_mut()?.persist()
    }
}

/// Copies top-level files whose extension is essential. Returns the copied
/// file names and one message per failure.
fn copy_essential_files(source_dir: &Path, target_dir: &Path) -> (Vec<String>, Vec<String>) {
    let mut copied = Vec::new();
    let mut failures = Vec::new();
    if !source_dir.is_dir() {
        log::warn!(
            "[registry] source storage {} is missing; nothing to copy",
            source_dir.display()
        );
        return (copied, failures);
    }

    for entry in WalkDir::new(source_dir)
        .follow_links(false)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                failures.push(format!("Failed to read {}: {error}", source_dir.display()));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let essential = file_extension(entry.path())
            .map(|extension| ESSENTIAL_EXTENSIONS.contains(&extension.as_str()))
            .unwrap_or(false);
        if !essential {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy().to_string();
        match fs::copy(entry.path(), target_dir.join(&file_name)) {
            Ok(_) => copied.push(file_name),
            Err(error) => failures.push(format!("Failed to copy {file_name}: {error}")),
        }
    }

    (copied, failures)
}
