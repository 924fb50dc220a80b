use std::thread;
use std::time::Duration;
use tauri::{AppHandle, Emitter, Manager, Runtime};

use super::poll_sleep_interval;
use crate::backend::frontend_command_registry::ControllerState;
use crate::controller::ControllerEvent;

/// Drains the events the controller has queued, applying terminal outcomes,
/// and hands each one to `emit`. Never waits for new events while holding
/// the controller lock.
pub(crate) fn forward_job_events(
    state: &ControllerState,
    mut emit: impl FnMut(&ControllerEvent),
) -> usize {
    let events = state.poll_events(Duration::ZERO);
    for event in &events {
        emit(event);
    }
    events.len()
}

/// Emits `job-launched`, `job-output` and `job-finished` to the frontend for
/// as long as the app runs.
pub(crate) fn spawn_job_event_forwarder<R: Runtime>(app: AppHandle<R>) {
    thread::spawn(move || loop {
        let state = app.state::<ControllerState>();
        forward_job_events(&state, |event| {
            if let Err(error) = app.emit(event.name(), event) {
                log::warn!("[events] failed to emit {}: {error}", event.name());
            }
        });
        thread::sleep(poll_sleep_interval());
    });
}
