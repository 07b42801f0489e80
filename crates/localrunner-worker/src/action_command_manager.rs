// ActionCommandManager: applies the workflow commands a unit prints on its
// output to the execution context as the lines arrive.

use std::collections::BTreeMap;

use localrunner_common::ActionCommand;

use crate::errors::ContextError;
use crate::execution_context::{ExecutionContext, ScopeId};
use crate::file_command_manager::FileCommandUpdates;

/// Every recognised command name. Anything else is ordinary output.
const WORKFLOW_COMMANDS: &[&str] = &[
    "set-env",
    "set-output",
    "add-path",
    "save-state",
    "add-mask",
    "debug",
    "notice",
    "warning",
    "error",
    "group",
    "endgroup",
    "echo",
    "stop-commands",
];

/// Command state of one running unit.
#[derive(Debug, Default)]
pub struct ActionCommandManager {
    /// While set, only `::<token>::` is recognised.
    stop_token: Option<String>,
    echo_on_action_command: bool,
}

impl ActionCommandManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `line` if it is a command printed by `step_id` running in `scope`.
    ///
    /// Returns `false` for ordinary output, which the caller logs as is.
    pub fn try_process_command(
        &mut self,
        context: &mut ExecutionContext,
        scope: ScopeId,
        step_id: &str,
        line: &str,
    ) -> Result<bool, ContextError> {
        let Some(command) = ActionCommand::parse(line) else {
            return Ok(false);
        };

        if let Some(token) = &self.stop_token {
            if &command.command != token {
                return Ok(false);
            }
            self.stop_token = None;
            context.debug("Resuming workflow commands.");
            return Ok(true);
        }

        if !WORKFLOW_COMMANDS.contains(&command.command.as_str()) {
            return Ok(false);
        }

        tracing::trace!(target: "action_command_manager", step = step_id, command = %command.command, "processing command");
        self.dispatch(context, scope, step_id, &command)?;
        // after dispatch, so a new mask already covers the echoed line
        if self.echo_on_action_command {
            context.write(line);
        }
        Ok(true)
    }

    fn dispatch(
        &mut self,
        context: &mut ExecutionContext,
        scope: ScopeId,
        step_id: &str,
        command: &ActionCommand,
    ) -> Result<(), ContextError> {
        match command.command.as_str() {
            "set-env" => {
                if let Some(name) = required_name(context, command) {
                    let mut updates = FileCommandUpdates::default();
                    updates.env.insert(name, command.data.clone());
                    context.merge_from_step_output(scope, step_id, &updates)?;
                }
            }
            "set-output" => {
                if let Some(name) = required_name(context, command) {
                    let mut updates = FileCommandUpdates::default();
                    updates.outputs.insert(name, command.data.clone());
                    context.merge_from_step_output(scope, step_id, &updates)?;
                }
            }
            "add-path" => {
                let path = command.data.trim();
                if path.is_empty() {
                    context.warning("'add-path' requires a non-empty path.");
                } else {
                    let updates = FileCommandUpdates {
                        path: vec![path.to_string()],
                        ..Default::default()
                    };
                    context.merge_from_step_output(scope, step_id, &updates)?;
                }
            }
            "save-state" => {
                if let Some(name) = required_name(context, command) {
                    let state = BTreeMap::from([(name, command.data.clone())]);
                    context.save_state(step_id, &state);
                }
            }
            "add-mask" => {
                let secret = command.data.trim();
                if !secret.is_empty() {
                    context.secret_masker().add_value(secret);
                    context.debug("Registered a value to mask.");
                }
            }
            "debug" => context.debug(&command.data),
            "notice" => {
                let message = annotation(command);
                context.write(&format!("##[notice]{message}"));
            }
            "warning" => context.warning(&annotation(command)),
            "error" => context.error(&annotation(command)),
            "group" => context.section(&command.data),
            "endgroup" => context.end_section(),
            "echo" => match command.data.trim().to_lowercase().as_str() {
                "on" => self.echo_on_action_command = true,
                "off" => self.echo_on_action_command = false,
                other => context.warning(&format!("'echo' expects 'on' or 'off', got '{other}'.")),
            },
            "stop-commands" => {
                let token = command.data.trim();
                if token.is_empty() {
                    context.warning("'stop-commands' requires a resume token.");
                } else {
                    context.debug(&format!("Workflow commands are stopped until '::{token}::'."));
                    self.stop_token = Some(token.to_string());
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn required_name(context: &mut ExecutionContext, command: &ActionCommand) -> Option<String> {
    let name = command.property("name").map(str::to_string);
    if name.is_none() {
        context.warning(&format!("'{}' requires a 'name' property.", command.command));
    }
    name
}

/// `file=a.rs,line=3: message` when the command names a location.
fn annotation(command: &ActionCommand) -> String {
    let location: Vec<String> = ["title", "file", "line", "col"]
        .iter()
        .filter_map(|key| command.property(key).map(|value| format!("{key}={value}")))
        .collect();
    if location.is_empty() {
        command.data.clone()
    } else {
        format!("{}: {}", location.join(","), command.data)
    }
}
