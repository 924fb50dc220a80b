use std::fs;
use std::path::{Component, Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::errors::ChemsimError;

const MAX_NAME_LENGTH: usize = 64;

pub(crate) fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub(crate) fn is_safe_name_token(value: &str) -> bool {
    if value.is_empty() || value == "." || value == ".." {
        return false;
    }

    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// System names double as directory names under `storage/`.
pub(crate) fn normalize_system_name(value: &str) -> Result<String, ChemsimError> {
    normalize_token(value, "System name")
}

/// Step names double as artifact file stems (`{name}.gro`, `{name}.tpr`, ...),
/// so dots are rejected as well.
pub(crate) fn normalize_step_name(value: &str) -> Result<String, ChemsimError> {
    normalize_file_stem(value, "Step name")
}

/// Stem of an analysis output (`{name}.xvg`).
pub(crate) fn normalize_output_name(value: &str) -> Result<String, ChemsimError> {
    normalize_file_stem(value, "Output name")
}

fn normalize_file_stem(value: &str, label: &str) -> Result<String, ChemsimError> {
    let normalized = normalize_token(value, label)?;
    if normalized.contains('.') {
        return Err(ChemsimError::InvalidName(format!(
            "{label} \"{normalized}\" must not contain dots."
        )));
    }
    Ok(normalized)
}

pub(crate) fn normalize_project_name(value: &str) -> Result<String, ChemsimError> {
    normalize_token(value, "Project name")
}

fn normalize_token(value: &str, label: &str) -> Result<String, ChemsimError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ChemsimError::InvalidName(format!(
            "{label} must be a non-empty string."
        )));
    }
    if trimmed.len() > MAX_NAME_LENGTH {
        return Err(ChemsimError::InvalidName(format!(
            "{label} must be {MAX_NAME_LENGTH} characters or fewer."
        )));
    }
    if !is_safe_name_token(trimmed) {
        return Err(ChemsimError::InvalidName(format!(
            "{label} \"{trimmed}\" may only contain letters, digits, '.', '_' and '-'."
        )));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn validate_absolute_directory(path: &str) -> Result<PathBuf, ChemsimError> {
    let candidate = PathBuf::from(path.trim());
    if !candidate.is_absolute() {
        return Err(ChemsimError::InvalidName(
            "path must be an absolute path.".to_string(),
        ));
    }
    if candidate
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(ChemsimError::InvalidName(
            "path must not contain '..' segments.".to_string(),
        ));
    }
    Ok(candidate)
}

pub(crate) fn path_is_file(path: &Path) -> bool {
    path.is_file()
}

pub(crate) fn ensure_directory(path: &Path) -> Result<(), ChemsimError> {
    fs::create_dir_all(path).map_err(|error| ChemsimError::io_at("create", path, error))
}

/// Lowercased extension without the dot.
pub(crate) fn file_extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|value| value.to_string_lossy().to_lowercase())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_accepts_safe_system_names() {
        assert_eq!(
            normalize_system_name("  co2_300K  "),
            Ok("co2_300K".to_string())
        );
    }

    #[test]
    fn rejects_path_like_names() {
        assert!(normalize_system_name("../escape").is_err());
        assert!(normalize_system_name("a/b").is_err());
        assert!(normalize_system_name("..").is_err());
        assert!(normalize_system_name("   ").is_err());
    }

    #[test]
    fn rejects_dotted_step_names() {
        assert!(normalize_step_name("nvt.1").is_err());
        assert_eq!(normalize_step_name("npt_soft"), Ok("npt_soft".to_string()));
    }

    #[test]
    fn requires_absolute_directories() {
        assert!(validate_absolute_directory("relative/dir").is_err());
        assert!(validate_absolute_directory("/tmp/../etc").is_err());
        assert!(validate_absolute_directory("/tmp/projects").is_ok());
    }

    #[test]
    fn lowercases_extensions() {
        assert_eq!(file_extension(Path::new("a/Minim.GRO")), Some("gro".to_string()));
        assert_eq!(file_extension(Path::new("topol")), None);
    }
}
