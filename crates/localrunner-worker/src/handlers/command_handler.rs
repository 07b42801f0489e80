// CommandHandler: runs an action's program directly, without a shell.

use anyhow::{bail, Result};

use localrunner_sdk::ProcessSpec;

use crate::step::Runnable;
use crate::step_runner::RunRequest;

use super::handler::{process_environment, resolve_tool, Handler};

pub struct CommandHandler;

impl Handler for CommandHandler {
    fn prepare(&self, request: &RunRequest) -> Result<ProcessSpec> {
        let Runnable::Command { program, args } = &request.runnable else {
            bail!("'{}' is not a command", request.runnable.describe());
        };

        let file_name = resolve_tool(request, program)?;
        Ok(ProcessSpec::new(file_name)
            .args(args.iter().cloned())
            .current_dir(request.working_directory.clone())
            .envs(&process_environment(request)))
    }
}
