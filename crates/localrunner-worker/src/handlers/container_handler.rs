// ContainerHandler: runs a container action with `docker run`.
//
// The step's scratch directory is mounted so the container writes the same
// file-command files the engine collects; the workspace is the container's
// working directory.

use anyhow::{bail, Result};
use std::collections::BTreeMap;

use localrunner_common::constants::{file_commands, PATH_VARIABLE};
use localrunner_sdk::ProcessSpec;

use crate::step::Runnable;
use crate::step_runner::RunRequest;

use super::handler::{process_environment, resolve_tool, Handler};

const CONTAINER_FILE_COMMANDS: &str = "/github/file_commands";
const CONTAINER_WORKSPACE: &str = "/github/workspace";

pub struct ContainerHandler;

impl ContainerHandler {
    /// Arguments of `docker run` for `request`.
    pub fn docker_arguments(request: &RunRequest) -> Result<Vec<String>> {
        let Runnable::Container {
            image,
            entrypoint,
            args,
        } = &request.runnable
        else {
            bail!("'{}' is not a container", request.runnable.describe());
        };

        let mut docker_args = vec!["run".to_string(), "--rm".to_string()];

        for (key, value) in container_environment(request) {
            docker_args.push("-e".to_string());
            docker_args.push(format!("{key}={value}"));
        }

        docker_args.push("-v".to_string());
        docker_args.push(format!(
            "{}:{CONTAINER_FILE_COMMANDS}",
            request.temp_directory.display()
        ));
        docker_args.push("-v".to_string());
        docker_args.push(format!(
            "{}:{CONTAINER_WORKSPACE}",
            request.working_directory.display()
        ));
        docker_args.push("-w".to_string());
        docker_args.push(CONTAINER_WORKSPACE.to_string());

        if let Some(entrypoint) = entrypoint.as_deref().filter(|e| !e.is_empty()) {
            docker_args.push("--entrypoint".to_string());
            docker_args.push(entrypoint.to_string());
        }

        docker_args.push(image.clone());
        docker_args.extend(args.iter().cloned());
        Ok(docker_args)
    }
}

/// The step environment as seen from inside the container: file-command
/// paths rewritten to the mount point, the host search path left out.
fn container_environment(request: &RunRequest) -> BTreeMap<String, String> {
    let mut environment = request.environment.clone();
    environment.remove(PATH_VARIABLE);
    for name in file_commands::ALL {
        if let Some(host_path) = environment.get_mut(*name) {
            if let Some(file) = std::path::Path::new(host_path.as_str()).file_name() {
                *host_path = format!("{CONTAINER_FILE_COMMANDS}/{}", file.to_string_lossy());
            }
        }
    }
    environment
}

impl Handler for ContainerHandler {
    fn prepare(&self, request: &RunRequest) -> Result<ProcessSpec> {
        let arguments = Self::docker_arguments(request)?;
        let docker = resolve_tool(request, "docker")?;
        Ok(ProcessSpec::new(docker)
            .args(arguments)
            .envs(&process_environment(request)))
    }
}
