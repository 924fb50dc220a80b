use serde::{Deserialize, Serialize};
use tauri::State;

use super::{CommandResponse, ControllerState};
use crate::controller::SimulationController;
use crate::errors::ChemsimError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemNamePayload {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemClonePayload {
    pub name: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemsData {
    pub systems: Vec<String>,
    pub active_system: Option<String>,
    pub active_storage_path: Option<String>,
}

fn systems_data(controller: &SimulationController) -> Result<SystemsData, ChemsimError> {
    let projects = controller.projects();
    Ok(SystemsData {
        systems: projects.system_names()?,
        active_system: projects.active_system().ok(),
        active_storage_path: projects
            .active_storage_path()
            .map(|path| path.display().to_string()),
    })
}

#[tauri::command]
pub fn system_list(state: State<'_, ControllerState>) -> CommandResponse<SystemsData> {
    CommandResponse::from_result(state.with_controller(|controller| systems_data(controller)))
}

#[tauri::command]
pub fn system_create(
    state: State<'_, ControllerState>,
    payload: SystemNamePayload,
) -> CommandResponse<SystemsData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        controller.create_system(&payload.name)?;
        systems_data(controller)
    }))
}

/// A clone whose file copy failed part-way is still registered and active:
/// the response carries the new system list next to the `partial` error.
#[tauri::command]
pub fn system_clone(
    state: State<'_, ControllerState>,
    payload: SystemClonePayload,
) -> CommandResponse<SystemsData> {
    let result = state.with_controller(|controller| {
        let warning = match controller.clone_system(&payload.name, &payload.source) {
            Ok(_) => None,
            Err(error @ ChemsimError::PartialClone { .. }) => Some(error),
            Err(error) => return Err(error),
        };
        Ok((systems_data(controller)?, warning))
    });

    match result {
        Ok((data, None)) => CommandResponse::from_result(Ok(data)),
        Ok((data, Some(warning))) => CommandResponse::partial(data, warning),
        Err(error) => CommandResponse::from_result(Err(error)),
    }
}

#[tauri::command]
pub fn system_delete(
    state: State<'_, ControllerState>,
    payload: SystemNamePayload,
) -> CommandResponse<SystemsData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        controller.delete_system(&payload.name)?;
        systems_data(controller)
    }))
}

#[tauri::command]
pub fn system_set_active(
    state: State<'_, ControllerState>,
    payload: SystemNamePayload,
) -> CommandResponse<SystemsData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        controller.set_active_system(&payload.name)?;
        systems_data(controller)
    }))
}
