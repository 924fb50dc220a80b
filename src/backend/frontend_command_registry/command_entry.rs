use super::job_commands::*;
use super::project_commands::*;
use super::protocol_commands::*;
use super::system_commands::*;
use super::topology_commands::*;
use super::ControllerState;
use crate::backend::event_polling_emission_pipeline::job_events::spawn_job_event_forwarder;
use crate::config::AppConfig;

pub(crate) fn run() {
    let config = AppConfig::resolve();
    log::info!(
        "[startup] config dir {}, engine `{}`, packer `{}`, travis `{}`",
        config.config_dir.display(),
        config.md_engine_binary,
        config.packer_binary,
        config.travis_binary
    );

    tauri::Builder::default()
        .manage(ControllerState::new(config))
        .setup(|app| {
            spawn_job_event_forwarder(app.handle().clone());
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            project_create,
            project_open,
            project_get_active,
            recent_projects_list,
            tab_state_get,
            tab_state_update,
            global_state_get,
            global_state_update,
            system_list,
            system_create,
            system_clone,
            system_delete,
            system_set_active,
            protocol_get_tree,
            protocol_add_step,
            protocol_remove_step,
            protocol_resolve_input,
            protocol_rebuild,
            step_parameters_get,
            step_parameters_update,
            topology_generate,
            job_compile_step,
            job_run_step,
            job_run_packer,
            job_build_structure,
            job_run_analysis,
            job_stop,
            job_status
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
