use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Errors surfaced by the project store, the system registry, the protocol tree
/// and the external process adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChemsimError {
    #[error("No project_db.json found in `{0}`.")]
    NotAProject(String),
    #[error("Project document `{path}` could not be parsed: {message}")]
    CorruptDocument { path: String, message: String },
    #[error("A {what} named `{name}` already exists.")]
    DuplicateName { what: &'static str, name: String },
    #[error("No {what} named `{name}` exists.")]
    NotFound { what: &'static str, name: String },
    #[error("{0}")]
    InvalidName(String),
    #[error("Missing `{file}`: run `{upstream}` first.")]
    MissingUpstream { file: String, upstream: String },
    #[error("Required input `{0}` does not exist.")]
    MissingInput(String),
    #[error("Step `{name}` cannot move from {from} to {to}.")]
    InvalidTransition {
        name: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("System `{0}` already has a job in flight.")]
    SystemBusy(String),
    #[error("No project is open.")]
    NoProject,
    #[error("Failed to launch {program}: {message}")]
    ProcessLaunch { program: String, message: String },
    #[error("{program} exited with {}: {output}", describe_exit(.exit_code))]
    ProcessFailure {
        program: String,
        exit_code: Option<i32>,
        output: String,
    },
    #[error("Process stopped by the user.")]
    UserCancelled,
    #[error("System `{system}` was created but only partially populated: {}", .failures.join("; "))]
    PartialClone {
        system: String,
        copied: usize,
        failures: Vec<String>,
    },
    #[error("{0}")]
    Io(String),
    #[error("{0}")]
    Serialization(String),
}

/// How a failure should be presented to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorClass {
    /// Nothing happened; fix the input and retry.
    Validation,
    /// The external tool ran and reported an error.
    Execution,
    /// Expected outcome of a user action, not an error.
    Informational,
    /// Partially completed; state already registered is kept.
    Partial,
}

impl ChemsimError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ChemsimError::ProcessFailure { .. } | ChemsimError::ProcessLaunch { .. } => {
                ErrorClass::Execution
            }
            ChemsimError::UserCancelled => ErrorClass::Informational,
            ChemsimError::PartialClone { .. } => ErrorClass::Partial,
            _ => ErrorClass::Validation,
        }
    }

    pub(crate) fn io_at(action: &str, path: &Path, error: std::io::Error) -> Self {
        ChemsimError::Io(format!("Failed to {action} {}: {error}", path.display()))
    }
}

impl From<serde_json::Error> for ChemsimError {
    fn from(error: serde_json::Error) -> Self {
        ChemsimError::Serialization(error.to_string())
    }
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".to_string(),
    }
}
