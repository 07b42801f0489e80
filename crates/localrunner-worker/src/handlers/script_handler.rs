// ScriptHandler: writes a `run:` script into the step's scratch directory
// and invokes it through the step's shell.

use anyhow::{bail, Context, Result};
use std::path::Path;

use localrunner_sdk::ProcessSpec;

use crate::step::Runnable;
use crate::step_runner::RunRequest;

use super::handler::{process_environment, resolve_tool, Handler};

/// Placeholder replaced by the script path in a shell option string.
const SCRIPT_PLACEHOLDER: &str = "{0}";

pub struct ScriptHandler {
    default_shell: String,
}

impl ScriptHandler {
    pub fn new(default_shell: String) -> Self {
        Self { default_shell }
    }

    fn shell_for<'r>(&'r self, request: &'r RunRequest) -> &'r str {
        match &request.runnable {
            Runnable::Script {
                shell: Some(shell), ..
            } if !shell.trim().is_empty() => shell,
            _ => &self.default_shell,
        }
    }
}

impl Handler for ScriptHandler {
    fn prepare(&self, request: &RunRequest) -> Result<ProcessSpec> {
        let Runnable::Script { script, .. } = &request.runnable else {
            bail!("'{}' is not a script", request.runnable.describe());
        };

        let shell = self.shell_for(request);
        let (command, args, extension) = ScriptHandlerHelpers::parse_shell_option_string(shell);

        // bash is only the implicit default; fall back to sh where it is missing
        let file_name = match resolve_tool(request, &command) {
            Ok(found) => found,
            Err(_) if command == "bash" && shell == self.default_shell => resolve_tool(request, "sh")?,
            Err(e) => return Err(e),
        };

        let script_file = request.temp_directory.join(format!(
            "{}.{extension}",
            uuid::Uuid::new_v4().as_simple()
        ));
        std::fs::write(&script_file, ScriptHandlerHelpers::fix_up_script_contents(&extension, script))
            .with_context(|| format!("Failed to write script file {:?}", script_file))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_file, std::fs::Permissions::from_mode(0o755))
                .with_context(|| format!("Failed to make {:?} executable", script_file))?;
        }

        let arguments = ScriptHandlerHelpers::substitute_script_path(&args, &script_file);
        tracing::debug!(target: "step_host", shell = %file_name, script = %script_file.display(), "prepared script");

        Ok(ProcessSpec::new(file_name)
            .args(arguments)
            .current_dir(request.working_directory.clone())
            .envs(&process_environment(request)))
    }
}

/// Shell option strings and script files.
pub struct ScriptHandlerHelpers;

impl ScriptHandlerHelpers {
    /// Parse a shell option string into (command, args, file extension).
    ///
    /// Well-known shells expand to their fail-fast invocation:
    /// - `bash` → `bash --noprofile --norc -e -o pipefail {0}`
    /// - `sh` → `sh -e {0}`
    /// - `pwsh` / `powershell` → `-command ". '{0}'"`
    /// - `python` → `python {0}`
    /// - `cmd` → `/D /E:ON /V:OFF /S /C "CALL "{0}""`
    ///
    /// Anything else is split on whitespace; `{0}` is appended when absent.
    pub fn parse_shell_option_string(shell: &str) -> (String, Vec<String>, String) {
        let owned = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        match shell.trim() {
            "bash" => (
                "bash".to_string(),
                owned(&["--noprofile", "--norc", "-e", "-o", "pipefail", SCRIPT_PLACEHOLDER]),
                "sh".to_string(),
            ),
            "sh" => ("sh".to_string(), owned(&["-e", SCRIPT_PLACEHOLDER]), "sh".to_string()),
            "pwsh" | "powershell" => (
                shell.trim().to_string(),
                owned(&["-command", ". '{0}'"]),
                "ps1".to_string(),
            ),
            "python" => ("python".to_string(), owned(&[SCRIPT_PLACEHOLDER]), "py".to_string()),
            "cmd" => (
                "cmd".to_string(),
                owned(&["/D", "/E:ON", "/V:OFF", "/S", "/C", "CALL \"{0}\""]),
                "cmd".to_string(),
            ),
            custom => {
                let mut parts = custom.split_whitespace().map(str::to_string);
                let command = parts.next().unwrap_or_else(|| "bash".to_string());
                let mut args: Vec<String> = parts.collect();
                if !args.iter().any(|a| a.contains(SCRIPT_PLACEHOLDER)) {
                    args.push(SCRIPT_PLACEHOLDER.to_string());
                }
                let extension = Self::get_script_file_extension(&command);
                (command, args, extension)
            }
        }
    }

    pub fn get_script_file_extension(shell: &str) -> String {
        let basename = Path::new(shell)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(shell);

        match basename.to_lowercase().as_str() {
            "pwsh" | "powershell" => "ps1",
            "python" | "python3" => "py",
            "cmd" => "cmd",
            "node" | "nodejs" => "js",
            "ruby" => "rb",
            "perl" => "pl",
            _ => "sh",
        }
        .to_string()
    }

    /// PowerShell scripts stop on the first error and surface `$LASTEXITCODE`.
    pub fn fix_up_script_contents(extension: &str, contents: &str) -> String {
        match extension {
            "ps1" => format!(
                "$ErrorActionPreference = 'stop'\n{contents}\nif ((Test-Path -LiteralPath variable:\\LASTEXITCODE)) {{ exit $LASTEXITCODE }}"
            ),
            "cmd" => format!("@echo off\n{contents}"),
            _ => contents.to_string(),
        }
    }

    pub fn substitute_script_path(args: &[String], script_file: &Path) -> Vec<String> {
        let path = script_file.to_string_lossy();
        args.iter()
            .map(|arg| arg.replace(SCRIPT_PLACEHOLDER, &path))
            .collect()
    }
}
