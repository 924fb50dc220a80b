pub(crate) mod command_entry;
pub(crate) mod job_commands;
pub(crate) mod project_commands;
pub(crate) mod protocol_commands;
pub(crate) mod system_commands;
pub(crate) mod topology_commands;

use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::controller::{ControllerEvent, SimulationController};
use crate::errors::{ChemsimError, ErrorClass};

/// Managed Tauri state. Commands and the job event poller share one
/// controller behind the lock; neither holds it while waiting.
pub struct ControllerState {
    config: AppConfig,
    controller: Mutex<SimulationController>,
}

impl ControllerState {
    pub fn new(config: AppConfig) -> Self {
        let controller = SimulationController::new(&config);
        ControllerState {
            config,
            controller: Mutex::new(controller),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub(crate) fn with_controller<T>(
        &self,
        action: impl FnOnce(&mut SimulationController) -> Result<T, ChemsimError>,
    ) -> Result<T, ChemsimError> {
        let mut controller = self.controller.lock().map_err(|error| {
            ChemsimError::Io(format!("Failed to acquire controller lock: {error}"))
        })?;
        action(&mut controller)
    }

    pub fn poll_events(&self, timeout: Duration) -> Vec<ControllerEvent> {
        match self.controller.lock() {
            Ok(mut controller) => controller.poll(timeout),
            Err(error) => {
                log::warn!("[commands] controller lock poisoned while polling: {error}");
                Vec::new()
            }
        }
    }
}

pub(crate) fn request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Shared response envelope: `requestId`, `ok`, the command's own fields
/// when it succeeded, and `error`/`errorClass` when it did not. A partial
/// result carries both.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse<T> {
    request_id: String,
    ok: bool,
    #[serde(flatten)]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_class: Option<ErrorClass>,
}

impl<T> CommandResponse<T> {
    pub(crate) fn from_result(result: Result<T, ChemsimError>) -> Self {
        let request_id = request_id();
        match result {
            Ok(data) => CommandResponse {
                request_id,
                ok: true,
                data: Some(data),
                error: None,
                error_class: None,
            },
            Err(error) => {
                log::debug!("[commands] {request_id} failed: {error}");
                CommandResponse {
                    request_id,
                    ok: false,
                    data: None,
                    error_class: Some(error.class()),
                    error: Some(error.to_string()),
                }
            }
        }
    }

    /// The action went through but left something undone; `data` is the
    /// state the frontend has to show regardless.
    pub(crate) fn partial(data: T, error: ChemsimError) -> Self {
        let request_id = request_id();
        log::debug!("[commands] {request_id} partially completed: {error}");
        CommandResponse {
            request_id,
            ok: false,
            data: Some(data),
            error_class: Some(error.class()),
            error: Some(error.to_string()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Systems {
        active_system: &'static str,
    }

    #[test]
    fn success_flattens_data_next_to_the_envelope() {
        let value = serde_json::to_value(CommandResponse::from_result(Ok(Systems {
            active_system: "default",
        })))
        .unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(value["activeSystem"], "default");
        assert!(value["requestId"].as_str().is_some());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn partial_response_keeps_data_and_class() {
        let error = ChemsimError::PartialClone {
            system: "copy".to_string(),
            copied: 1,
            failures: vec!["Failed to copy co2.itp: denied".to_string()],
        };
        let value = serde_json::to_value(CommandResponse::partial(
            Systems {
                active_system: "copy",
            },
            error,
        ))
        .unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["activeSystem"], "copy");
        assert_eq!(value["errorClass"], "partial");
        assert!(value["error"].as_str().unwrap().contains("co2.itp"));
    }
}
