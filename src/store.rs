use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::ChemsimError;
use crate::project::ProjectDocument;
use crate::workspace::path_is_file;

pub(crate) const PROJECT_DB_FILE: &str = "project_db.json";
const STAGED_SUFFIX: &str = "tmp";

pub(crate) fn project_db_path(project_root: &Path) -> PathBuf {
    project_root.join(PROJECT_DB_FILE)
}

fn staged_path(target: &Path) -> PathBuf {
    let mut file_name = target
        .file_name()
        .map(|value| value.to_os_string())
        .unwrap_or_default();
    file_name.push(format!(".{STAGED_SUFFIX}"));
    target.with_file_name(file_name)
}

pub(crate) fn render_document<T: serde::Serialize>(value: &T) -> Result<String, ChemsimError> {
    let body = serde_json::to_string_pretty(value)?;
    Ok(format!("{body}\n"))
}

/// Writes the serialized document next to `target` without touching `target`.
pub(crate) fn stage_document(target: &Path, body: &str) -> Result<PathBuf, ChemsimError> {
    let staged = staged_path(target);
    if let Err(error) = fs::write(&staged, body) {
        let _ = fs::remove_file(&staged);
        return Err(ChemsimError::io_at("write", &staged, error));
    }
    Ok(staged)
}

/// Replaces `target` with the staged file in one rename.
pub(crate) fn commit_staged(staged: &Path, target: &Path) -> Result<(), ChemsimError> {
    fs::rename(staged, target).map_err(|error| {
        let _ = fs::remove_file(staged);
        ChemsimError::io_at("replace", target, error)
    })
}

pub(crate) fn write_atomic(target: &Path, body: &str) -> Result<(), ChemsimError> {
    let staged = stage_document(target, body)?;
    commit_staged(&staged, target)
}

pub fn save_document(project_root: &Path, document: &ProjectDocument) -> Result<(), ChemsimError> {
    let body = render_document(document)?;
    write_atomic(&project_db_path(project_root), &body)
}

pub fn load_document(project_root: &Path) -> Result<ProjectDocument, ChemsimError> {
    let db_path = project_db_path(project_root);
    if !path_is_file(&db_path) {
        return Err(ChemsimError::NotAProject(project_root.display().to_string()));
    }

    let raw = fs::read_to_string(&db_path).map_err(|error| ChemsimError::io_at("read", &db_path, error))?;
    serde_json::from_str::<ProjectDocument>(&raw).map_err(|error| ChemsimError::CorruptDocument {
        path: db_path.display().to_string(),
        message: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn document(name: &str) -> ProjectDocument {
        ProjectDocument::new(name)
    }

    #[test]
    fn reports_missing_database_as_not_a_project() {
        let dir = TempDir::new().unwrap();
        let result = load_document(dir.path());
        assert!(matches!(result, Err(ChemsimError::NotAProject(_))));
    }

    #[test]
    fn reports_unparseable_database_as_corrupt() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(PROJECT_DB_FILE), "{\"name\": ").unwrap();
        let result = load_document(dir.path());
        assert!(matches!(result, Err(ChemsimError::CorruptDocument { .. })));
    }

    #[test]
    fn saves_and_loads_document() {
        let dir = TempDir::new().unwrap();
        let saved = document("co2_mix");
        save_document(dir.path(), &saved).unwrap();

        let loaded = load_document(dir.path()).unwrap();
        assert_eq!(loaded, saved);
        assert!(!staged_path(&project_db_path(dir.path())).exists());
    }

    #[test]
    fn interrupted_write_keeps_previous_document() {
        let dir = TempDir::new().unwrap();
        let first = document("first");
        save_document(dir.path(), &first).unwrap();

        let second = render_document(&document("second")).unwrap();
        let truncated = &second[..second.len() / 2];
        let staged = stage_document(&project_db_path(dir.path()), truncated).unwrap();
        assert!(staged.exists());

        let loaded = load_document(dir.path()).unwrap();
        assert_eq!(loaded.name, "first");
    }

    #[test]
    fn failed_commit_removes_staged_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("missing").join(PROJECT_DB_FILE);
        let result = write_atomic(&target, "{}");
        assert!(matches!(result, Err(ChemsimError::Io(_))));
        assert!(!staged_path(&target).exists());
    }

    #[test]
    fn failed_rename_cleans_up_and_keeps_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("occupied");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep"), "x").unwrap();

        let result = write_atomic(&target, "{}");
        assert!(result.is_err());
        assert!(!staged_path(&target).exists());
        assert!(target.join("keep").exists());
    }
}
