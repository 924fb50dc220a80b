pub(crate) mod event_polling_emission_pipeline;
pub(crate) mod frontend_command_registry;
