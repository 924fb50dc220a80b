use serde::Deserialize;
use tauri::State;

use super::{CommandResponse, ControllerState};
use crate::topology::{TopologyReport, TopologyRequest};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyPayload {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(flatten)]
    pub request: TopologyRequest,
}

/// Writes `topol.top` for a system from its molecule fragments. A failed
/// sanitize pass falls back to the original fragments and is reported
/// under `warning`.
#[tauri::command]
pub fn topology_generate(
    state: State<'_, ControllerState>,
    payload: TopologyPayload,
) -> CommandResponse<TopologyReport> {
    CommandResponse::from_result(state.with_controller(|controller| {
        controller.write_topology(payload.system.as_deref(), &payload.request)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tauri::Manager;
    use tempfile::TempDir;

    use crate::backend::frontend_command_registry::project_commands::{
        project_create, ProjectCreatePayload,
    };
    use crate::backend::frontend_command_registry::test_support::{app, json};

    const CO2_ITP: &str = "[ moleculetype ]\nCO2    1\n\n[ atoms ]\n1  C  1  CO2  C  1  0.70  12.011\n";

    #[test]
    fn generates_topology_for_named_system() {
        let (config, projects) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let app = app(config.path());
        project_create(
            app.state::<ControllerState>(),
            ProjectCreatePayload {
                parent_dir: projects.path().display().to_string(),
                name: "co2".to_string(),
            },
        );
        let storage = projects.path().join("co2").join("storage").join("default");
        fs::write(storage.join("co2.itp"), CO2_ITP).unwrap();

        let payload: TopologyPayload = serde_json::from_value(json!({
            "system": "default",
            "molecules": [{"name": "CO2", "count": 250, "itp": "co2.itp"}],
            "sanitize": false
        }))
        .unwrap();
        let response = json(topology_generate(app.state::<ControllerState>(), payload));
        assert_eq!(response["ok"], json!(true));
        assert_eq!(response["moleculeIncludes"], json!(["co2.itp"]));
        assert_eq!(response["molecules"], json!([{"name": "CO2", "count": 250}]));
        assert!(storage.join("topol.top").is_file());

        let missing: TopologyPayload = serde_json::from_value(json!({
            "system": "ghost",
            "molecules": [{"name": "CO2", "count": 1}]
        }))
        .unwrap();
        let rejected = json(topology_generate(app.state::<ControllerState>(), missing));
        assert_eq!(rejected["errorClass"], json!("validation"));
    }
}
