use serde::{Deserialize, Serialize};
use tauri::State;

use super::{CommandResponse, ControllerState};
use crate::controller::{ParameterUpdate, RebuildSummary, SimulationController, StepParameters};
use crate::errors::ChemsimError;
use crate::protocol::{StepKind, StepRecord};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemScopePayload {
    #[serde(default)]
    pub system: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddStepPayload {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPayload {
    #[serde(default)]
    pub system: Option<String>,
    pub step: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepParametersUpdatePayload {
    #[serde(default)]
    pub system: Option<String>,
    pub step: String,
    #[serde(flatten)]
    pub update: ParameterUpdate,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolTreeData {
    pub system: String,
    pub tree: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputFileData {
    pub step: String,
    pub input_path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildData {
    pub systems: Vec<RebuildSummary>,
}

fn tree_data(
    controller: &SimulationController,
    system: Option<&str>,
    removed: Vec<String>,
) -> Result<ProtocolTreeData, ChemsimError> {
    let projects = controller.projects();
    let system = match system.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => projects.require_system(name)?,
        None => projects.active_system()?,
    };
    Ok(ProtocolTreeData {
        tree: projects.tree(&system)?.to_records(),
        system,
        removed,
    })
}

#[tauri::command]
pub fn protocol_get_tree(
    state: State<'_, ControllerState>,
    payload: SystemScopePayload,
) -> CommandResponse<ProtocolTreeData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        tree_data(controller, payload.system.as_deref(), Vec::new())
    }))
}

#[tauri::command]
pub fn protocol_add_step(
    state: State<'_, ControllerState>,
    payload: AddStepPayload,
) -> CommandResponse<ProtocolTreeData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        let kind = StepKind::parse(&payload.kind)?;
        controller.add_step(
            payload.system.as_deref(),
            payload.parent.as_deref(),
            &payload.name,
            kind,
        )?;
        tree_data(controller, payload.system.as_deref(), Vec::new())
    }))
}

#[tauri::command]
pub fn protocol_remove_step(
    state: State<'_, ControllerState>,
    payload: StepPayload,
) -> CommandResponse<ProtocolTreeData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        let removed = controller.remove_step(payload.system.as_deref(), &payload.step)?;
        tree_data(controller, payload.system.as_deref(), removed)
    }))
}

#[tauri::command]
pub fn protocol_resolve_input(
    state: State<'_, ControllerState>,
    payload: StepPayload,
) -> CommandResponse<InputFileData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        let path = controller.resolve_input(payload.system.as_deref(), &payload.step)?;
        Ok(InputFileData {
            step: payload.step.trim().to_string(),
            input_path: path.display().to_string(),
        })
    }))
}

#[tauri::command]
pub fn protocol_rebuild(
    state: State<'_, ControllerState>,
    payload: SystemScopePayload,
) -> CommandResponse<RebuildData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        Ok(RebuildData {
            systems: controller.rebuild(payload.system.as_deref())?,
        })
    }))
}

#[tauri::command]
pub fn step_parameters_get(
    state: State<'_, ControllerState>,
    payload: StepPayload,
) -> CommandResponse<StepParameters> {
    CommandResponse::from_result(state.with_controller(|controller| {
        controller.step_parameters(payload.system.as_deref(), &payload.step)
    }))
}

#[tauri::command]
pub fn step_parameters_update(
    state: State<'_, ControllerState>,
    payload: StepParametersUpdatePayload,
) -> CommandResponse<StepParameters> {
    CommandResponse::from_result(state.with_controller(|controller| {
        controller.update_step_parameters(payload.system.as_deref(), &payload.step, payload.update)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::fs;
    use tauri::test::MockRuntime;
    use tauri::{App, Manager};
    use tempfile::TempDir;

    use crate::backend::frontend_command_registry::project_commands::{
        project_create, ProjectCreatePayload,
    };
    use crate::backend::frontend_command_registry::test_support::{app, json};

    fn open(config: &TempDir, projects: &TempDir) -> App<MockRuntime> {
        let app = app(config.path());
        project_create(
            app.state::<ControllerState>(),
            ProjectCreatePayload {
                parent_dir: projects.path().display().to_string(),
                name: "co2".to_string(),
            },
        );
        app
    }

    fn add(app: &App<MockRuntime>, parent: Option<&str>, name: &str, kind: &str) -> Value {
        json(protocol_add_step(
            app.state::<ControllerState>(),
            AddStepPayload {
                system: None,
                parent: parent.map(str::to_string),
                name: name.to_string(),
                kind: kind.to_string(),
            },
        ))
    }

    fn step(name: &str) -> StepPayload {
        StepPayload {
            system: None,
            step: name.to_string(),
        }
    }

    #[test]
    fn builds_protocol_tree_through_commands() {
        let (config, projects) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let app = open(&config, &projects);

        add(&app, None, "minim", "minim");
        let response = add(&app, Some("minim"), "nvt", "nvt");
        assert_eq!(response["tree"][0]["children"][0]["name"], json!("nvt"));
        assert_eq!(response["tree"][0]["children"][0]["kind"], json!("generation"));

        let duplicate = add(&app, None, "nvt", "nvt");
        assert_eq!(duplicate["ok"], json!(false));

        let input = json(protocol_resolve_input(app.state::<ControllerState>(), step("nvt")));
        assert_eq!(input["error"], json!("Missing `minim.gro`: run `minim` first."));

        let removed = json(protocol_remove_step(app.state::<ControllerState>(), step("minim")));
        assert_eq!(removed["removed"], json!(["minim", "nvt"]));
        assert_eq!(removed["tree"], json!([]));
    }

    #[test]
    fn rebuilds_tree_from_storage_listing() {
        let (config, projects) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let app = open(&config, &projects);
        let storage = projects.path().join("co2").join("storage").join("default");
        for file in ["minim.gro", "gen1.tpr", "equil1.gro", "prod1.xtc"] {
            fs::write(storage.join(file), "").unwrap();
        }

        let rebuilt = json(protocol_rebuild(
            app.state::<ControllerState>(),
            SystemScopePayload::default(),
        ));
        assert_eq!(rebuilt["systems"][0]["nodesAfter"], json!(4));

        let tree = json(protocol_get_tree(
            app.state::<ControllerState>(),
            SystemScopePayload::default(),
        ));
        assert_eq!(tree["system"], json!("default"));
        assert_eq!(tree["tree"][0]["name"], json!("minim"));
        assert_eq!(tree["tree"][0]["status"], json!("completed"));
    }

    #[test]
    fn edits_step_parameters_by_key() {
        let (config, projects) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let app = open(&config, &projects);
        add(&app, None, "minim", "minimization");
        let storage = projects.path().join("co2").join("storage").join("default");
        fs::write(storage.join("minim.mdp"), "integrator = steep\nnsteps = 500\n").unwrap();

        let payload: StepParametersUpdatePayload =
            serde_json::from_value(json!({"step": "minim", "values": {"nsteps": "5000"}})).unwrap();
        let updated = json(step_parameters_update(app.state::<ControllerState>(), payload));
        assert_eq!(updated["values"]["nsteps"], json!("5000"));

        let fetched = json(step_parameters_get(app.state::<ControllerState>(), step("minim")));
        assert_eq!(fetched["values"]["integrator"], json!("steep"));
        assert_eq!(fetched["kind"], json!("minimization"));
    }
}
