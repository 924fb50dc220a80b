use serde::{Deserialize, Serialize};
use serde_json::Value;
use tauri::State;

use super::{CommandResponse, ControllerState};
use crate::config::read_global_settings;
use crate::errors::ChemsimError;
use crate::project::TabKind;
use crate::registry::ProjectSummary;
use crate::workspace::validate_absolute_directory;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCreatePayload {
    pub parent_dir: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectOpenPayload {
    pub project_root: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabStatePayload {
    pub tab: String,
    #[serde(default)]
    pub state: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStatePayload {
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectData {
    pub project: Option<ProjectSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentProjectsData {
    pub recent_projects: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabStateData {
    pub tab: TabKind,
    pub state: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStateData {
    pub key: String,
    pub value: Value,
}

#[tauri::command]
pub fn project_create(
    state: State<'_, ControllerState>,
    payload: ProjectCreatePayload,
) -> CommandResponse<ProjectData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        let parent_dir = validate_absolute_directory(&payload.parent_dir)?;
        let project = controller.create_project(&parent_dir, &payload.name)?;
        Ok(ProjectData {
            project: Some(project),
        })
    }))
}

/// Opens a project. Systems whose stored tree could not be read come back
/// rebuilt from disk and are listed under `project.recoveredTrees`.
#[tauri::command]
pub fn project_open(
    state: State<'_, ControllerState>,
    payload: ProjectOpenPayload,
) -> CommandResponse<ProjectData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        let root = validate_absolute_directory(&payload.project_root)?;
        let project = controller.open_project(&root)?;
        Ok(ProjectData {
            project: Some(project),
        })
    }))
}

#[tauri::command]
pub fn project_get_active(state: State<'_, ControllerState>) -> CommandResponse<ProjectData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        Ok(ProjectData {
            project: controller.projects().summary(),
        })
    }))
}

#[tauri::command]
pub fn recent_projects_list(state: State<'_, ControllerState>) -> CommandResponse<RecentProjectsData> {
    CommandResponse::from_result(
        read_global_settings(&state.config().config_dir).map(|settings| RecentProjectsData {
            recent_projects: settings.recent_projects,
        }),
    )
}

#[tauri::command]
pub fn tab_state_get(
    state: State<'_, ControllerState>,
    payload: TabStatePayload,
) -> CommandResponse<TabStateData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        let tab = TabKind::parse(&payload.tab)?;
        Ok(TabStateData {
            tab,
            state: controller.projects().tab_state(tab)?,
        })
    }))
}

#[tauri::command]
pub fn tab_state_update(
    state: State<'_, ControllerState>,
    payload: TabStatePayload,
) -> CommandResponse<TabStateData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        let tab = TabKind::parse(&payload.tab)?;
        let Some(blob) = payload.state else {
            return Err(ChemsimError::InvalidName(
                "state is required to update a tab.".to_string(),
            ));
        };
        controller.update_tab_state(tab, blob)?;
        Ok(TabStateData {
            tab,
            state: controller.projects().tab_state(tab)?,
        })
    }))
}

#[tauri::command]
pub fn global_state_get(
    state: State<'_, ControllerState>,
    payload: GlobalStatePayload,
) -> CommandResponse<GlobalStateData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        Ok(GlobalStateData {
            value: controller.projects().global_state(&payload.key)?,
            key: payload.key,
        })
    }))
}

#[tauri::command]
pub fn global_state_update(
    state: State<'_, ControllerState>,
    payload: GlobalStatePayload,
) -> CommandResponse<GlobalStateData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        controller.update_global_state(&payload.key, payload.value.clone())?;
        Ok(GlobalStateData {
            key: payload.key.trim().to_string(),
            value: payload.value,
        })
    }))
}
