use serde::{Deserialize, Serialize};
use tauri::State;

use super::protocol_commands::StepPayload;
use super::{CommandResponse, ControllerState};
use crate::controller::JobSummary;
use crate::toolchain::{AnalysisRequest, PackerComponent, PackerPlan};

const DEFAULT_BOX_MARGIN_PERCENT: f64 = 10.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackerPayload {
    #[serde(default)]
    pub system: Option<String>,
    pub components: Vec<PackerComponent>,
    #[serde(default)]
    pub margin_percent: Option<f64>,
    #[serde(default)]
    pub tolerance: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructurePayload {
    #[serde(default)]
    pub system: Option<String>,
    pub box_edge_nm: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisPayload {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(flatten)]
    pub request: AnalysisRequest,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStopPayload {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    pub job: JobSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PackerPlan>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStopData {
    pub already_stopped: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsData {
    pub jobs: Vec<JobSummary>,
}

fn job_data(job: JobSummary) -> JobData {
    JobData { job, plan: None }
}

#[tauri::command]
pub fn job_compile_step(
    state: State<'_, ControllerState>,
    payload: StepPayload,
) -> CommandResponse<JobData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        controller
            .compile_step(payload.system.as_deref(), &payload.step)
            .map(job_data)
    }))
}

/// Launches the engine for a compiled step. Output and the outcome arrive
/// as `job-output` and `job-finished` events, not in this response.
#[tauri::command]
pub fn job_run_step(
    state: State<'_, ControllerState>,
    payload: StepPayload,
) -> CommandResponse<JobData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        controller
            .run_step(payload.system.as_deref(), &payload.step)
            .map(job_data)
    }))
}

#[tauri::command]
pub fn job_run_packer(
    state: State<'_, ControllerState>,
    payload: PackerPayload,
) -> CommandResponse<JobData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        let (plan, job) = controller.run_packer(
            payload.system.as_deref(),
            &payload.components,
            payload.margin_percent.unwrap_or(DEFAULT_BOX_MARGIN_PERCENT),
            payload.tolerance,
        )?;
        Ok(JobData {
            job,
            plan: Some(plan),
        })
    }))
}

#[tauri::command]
pub fn job_build_structure(
    state: State<'_, ControllerState>,
    payload: StructurePayload,
) -> CommandResponse<JobData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        controller
            .build_structure(payload.system.as_deref(), payload.box_edge_nm)
            .map(job_data)
    }))
}

#[tauri::command]
pub fn job_run_analysis(
    state: State<'_, ControllerState>,
    payload: AnalysisPayload,
) -> CommandResponse<JobData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        controller
            .run_analysis(payload.system.as_deref(), &payload.request)
            .map(job_data)
    }))
}

#[tauri::command]
pub fn job_stop(
    state: State<'_, ControllerState>,
    payload: JobStopPayload,
) -> CommandResponse<JobStopData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        let stopped = controller.stop(payload.job_id.as_deref(), payload.system.as_deref())?;
        Ok(JobStopData {
            already_stopped: !stopped,
        })
    }))
}

#[tauri::command]
pub fn job_status(state: State<'_, ControllerState>) -> CommandResponse<JobsData> {
    CommandResponse::from_result(state.with_controller(|controller| {
        Ok(JobsData {
            jobs: controller.jobs(),
        })
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
    use crate::backend::frontend_command_registry::protocol_commands::{
        protocol_add_step, AddStepPayload,
    };
    use crate::backend::frontend_command_registry::test_support::{app, app_with, json};
    use crate::config::AppConfig;

    fn create(app: &tauri::App<tauri::test::MockRuntime>, projects: &TempDir) {
        project_create(
            app.state::<ControllerState>(),
            ProjectCreatePayload {
                parent_dir: projects.path().display().to_string(),
                name: "co2".to_string(),
            },
        );
    }

    #[test]
    fn stop_reports_missing_job() {
        let (config, projects) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let app = app(config.path());
        create(&app, &projects);

        let response = json(job_stop(
            app.state::<ControllerState>(),
            JobStopPayload {
                job_id: Some("nope".to_string()),
                system: None,
            },
        ));
        assert_eq!(response["ok"], json!(false));
        assert_eq!(response["error"], json!("No job named `nope` exists."));
        assert_eq!(json(job_status(app.state::<ControllerState>()))["jobs"], json!([]));
    }

    #[test]
    fn run_step_responds_with_the_launched_job() {
        let (config, projects) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let app = app_with(AppConfig {
            config_dir: config.path().to_path_buf(),
            md_engine_binary: "sh".to_string(),
            packer_binary: "sh".to_string(),
            travis_binary: "travis".to_string(),
            grompp_maxwarn: 2,
        });
        create(&app, &projects);
        protocol_add_step(
            app.state::<ControllerState>(),
            AddStepPayload {
                system: None,
                parent: None,
                name: "minim".to_string(),
                kind: "minimization".to_string(),
            },
        );
        let storage = projects.path().join("co2").join("storage").join("default");
        fs::write(storage.join("minim.tpr"), "").unwrap();
        fs::write(storage.join("mdrun"), "exec sleep 30\n").unwrap();

        let step = || StepPayload {
            system: None,
            step: "minim".to_string(),
        };
        let launched = json(job_run_step(app.state::<ControllerState>(), step()));
        assert_eq!(launched["ok"], json!(true));
        assert_eq!(launched["job"]["command"], json!("sh mdrun -deffnm minim"));
        assert_eq!(launched["job"]["kind"], json!("run"));
        assert!(launched.get("plan").is_none());

        let busy = json(job_run_step(app.state::<ControllerState>(), step()));
        assert_eq!(busy["ok"], json!(false));

        let status = json(job_status(app.state::<ControllerState>()));
        assert_eq!(status["jobs"][0]["jobId"], launched["job"]["jobId"]);

        let stopped = json(job_stop(app.state::<ControllerState>(), JobStopPayload::default()));
        assert_eq!(stopped["ok"], json!(true));
        assert_eq!(stopped["alreadyStopped"], json!(false));
    }

    #[test]
    fn analysis_payload_flattens_request_fields() {
        let payload: AnalysisPayload = serde_json::from_value(json!({
            "system": "co2_350",
            "kind": "travisRdf",
            "step": "prod",
            "output": "rdf_co2",
            "first": "CO2",
            "second": "CO2"
        }))
        .unwrap();
        assert_eq!(payload.system.as_deref(), Some("co2_350"));
        assert_eq!(payload.request.step(), "prod");
    }
}
