// Handler trait and HandlerFactory.
// A handler prepares the process for one kind of runnable; the step host
// launches it.

use anyhow::Result;
use std::collections::HashMap;

use localrunner_common::constants::PATH_VARIABLE;
use localrunner_sdk::{ProcessSpec, WhichUtil};

use crate::step::Runnable;
use crate::step_runner::RunRequest;

use super::command_handler::CommandHandler;
use super::container_handler::ContainerHandler;
use super::script_handler::ScriptHandler;

/// Prepares the process that executes a request's runnable.
pub trait Handler: Send + Sync {
    fn prepare(&self, request: &RunRequest) -> Result<ProcessSpec>;
}

/// Chooses the handler for a runnable.
#[derive(Debug, Clone)]
pub struct HandlerFactory {
    default_shell: String,
}

impl HandlerFactory {
    pub fn new(default_shell: impl Into<String>) -> Self {
        Self {
            default_shell: default_shell.into(),
        }
    }

    pub fn create(&self, runnable: &Runnable) -> Box<dyn Handler> {
        match runnable {
            Runnable::Script { .. } => Box::new(ScriptHandler::new(self.default_shell.clone())),
            Runnable::Command { .. } => Box::new(CommandHandler),
            Runnable::Container { .. } => Box::new(ContainerHandler),
        }
    }
}

/// The request's environment as the process environment.
pub(crate) fn process_environment(request: &RunRequest) -> HashMap<String, String> {
    request
        .environment
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Locate `command` on the step's own search path.
pub(crate) fn resolve_tool(request: &RunRequest, command: &str) -> Result<String> {
    let path = request.environment.get(PATH_VARIABLE).map(String::as_str);
    let found = WhichUtil::which_in(command, path, true)?;
    Ok(found
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| command.to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::request;

    #[cfg(unix)]
    #[test]
    fn factory_picks_handler_by_runnable() {
        let temp = tempfile::tempdir().unwrap();
        let factory = HandlerFactory::new("sh");

        let script = request(
            Runnable::Script {
                script: "echo hi".to_string(),
                shell: None,
                working_directory: None,
            },
            temp.path(),
        );
        let spec = factory.create(&script.runnable).prepare(&script).unwrap();
        assert!(spec.file_name.ends_with("sh"));

        let command = request(
            Runnable::Command {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), "true".to_string()],
            },
            temp.path(),
        );
        let spec = factory.create(&command.runnable).prepare(&command).unwrap();
        assert_eq!(spec.arguments, ["-c", "true"]);
    }

    #[test]
    fn missing_tools_are_reported_by_name() {
        let temp = tempfile::tempdir().unwrap();
        let mut command = request(
            Runnable::Command {
                program: "definitely-not-a-real-tool".to_string(),
                args: vec![],
            },
            temp.path(),
        );
        command.environment.insert(PATH_VARIABLE.to_string(), String::new());

        let err = HandlerFactory::new("sh")
            .create(&command.runnable)
            .prepare(&command)
            .unwrap_err();
        assert!(err.to_string().contains("definitely-not-a-real-tool: command not found"));
    }
}
