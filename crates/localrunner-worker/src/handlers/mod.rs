// Handlers: turn a runnable into the process the step host launches.

pub mod command_handler;
pub mod container_handler;
pub mod handler;
pub mod script_handler;
pub mod step_host;
