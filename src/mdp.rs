use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::ChemsimError;
use crate::protocol::{artifact_file_name, StepKind};
use crate::store::write_atomic;
use crate::workspace::path_is_file;

pub(crate) const PARAMETER_EXTENSION: &str = "mdp";
const KEY_COLUMN_WIDTH: usize = 20;
const COMMENT_MARKER: char = ';';
const PS_PER_NS: f64 = 1000.0;

pub(crate) fn template_path(templates_dir: &Path, kind: StepKind) -> PathBuf {
    templates_dir.join(artifact_file_name(kind.template_name(), PARAMETER_EXTENSION))
}

/// Template text for a step kind, or a comment placeholder naming the
/// expected path when the template is not installed.
pub fn template_content(templates_dir: &Path, kind: StepKind) -> Result<String, ChemsimError> {
    let path = template_path(templates_dir, kind);
    if !path_is_file(&path) {
        return Ok(format!("; Template not found: {}\n", path.display()));
    }
    fs::read_to_string(&path).map_err(|error| ChemsimError::io_at("read", &path, error))
}

fn strip_comment(line: &str) -> &str {
    line.split(COMMENT_MARKER).next().unwrap_or_default().trim()
}

/// Rewrites `key = value` lines for the given keys. Keys match whole words at
/// the start of the uncommented line; trailing comments survive. Keys absent
/// from `content` are not appended.
pub fn update_parameters(
    content: &str,
    params: &[(String, String)],
) -> Result<String, ChemsimError> {
    let matchers = params
        .iter()
        .map(|(key, value)| {
            let key = key.trim();
            Regex::new(&format!(r"^{}\s*(=|$)", regex::escape(key)))
                .map(|pattern| (pattern, key, value.trim()))
                .map_err(|error| ChemsimError::InvalidName(format!("Invalid parameter key {key}: {error}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let lines = content
        .split('\n')
        .map(|line| {
            let clean = strip_comment(line);
            let Some((_, key, value)) = matchers.iter().find(|(pattern, _, _)| pattern.is_match(clean))
            else {
                return line.to_string();
            };
            let comment = line
                .split_once(COMMENT_MARKER)
                .map(|(_, rest)| format!(" {COMMENT_MARKER}{rest}"))
                .unwrap_or_default();
            format!("{key:<width$} = {value}{comment}", width = KEY_COLUMN_WIDTH)
        })
        .collect::<Vec<_>>();

    Ok(lines.join("\n"))
}

/// Current `key = value` pairs, comments and blank lines skipped. Later
/// duplicates win, matching how the engine reads the file.
pub fn parse_parameters(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let (key, value) = strip_comment(line).split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Integration steps needed to cover `duration_ns` at a time step of `dt_ps`.
pub fn nsteps_for_duration(duration_ns: f64, dt_ps: f64) -> Result<u64, ChemsimError> {
    if !(dt_ps.is_finite() && dt_ps > 0.0) {
        return Err(ChemsimError::InvalidName(format!(
            "time step must be a positive number of picoseconds (got {dt_ps})."
        )));
    }
    if !(duration_ns.is_finite() && duration_ns >= 0.0) {
        return Err(ChemsimError::InvalidName(format!(
            "duration must be a non-negative number of nanoseconds (got {duration_ns})."
        )));
    }
    Ok((duration_ns * PS_PER_NS / dt_ps).round() as u64)
}

pub(crate) fn step_parameter_path(storage_dir: &Path, step: &str) -> PathBuf {
    storage_dir.join(artifact_file_name(step, PARAMETER_EXTENSION))
}

/// The step's saved parameter file, else the template for its kind.
pub fn read_step_parameters(
    storage_dir: &Path,
    templates_dir: &Path,
    step: &str,
    kind: StepKind,
) -> Result<String, ChemsimError> {
    let path = step_parameter_path(storage_dir, step);
    if path_is_file(&path) {
        return fs::read_to_string(&path).map_err(|error| ChemsimError::io_at("read", &path, error));
    }
    template_content(templates_dir, kind)
}

pub fn write_step_parameters(
    storage_dir: &Path,
    step: &str,
    content: &str,
) -> Result<PathBuf, ChemsimError> {
    let path = step_parameter_path(storage_dir, step);
    write_atomic(&path, content)?;
    Ok(path)
}
