// RunnerSettings: engine configuration loaded from an optional JSON file and
// overridden by well-known environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{self, variables};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerSettings {
    /// Directory under which step-scoped file-command directories are created.
    pub temp_directory: PathBuf,

    /// Working directory of step processes unless the step names its own.
    pub workspace_directory: PathBuf,

    /// Shell used for `run:` steps that do not name one.
    pub default_shell: String,

    /// Deadline for pre and main units without `timeout-minutes`.
    pub default_step_timeout_minutes: u32,

    /// Deadline for post hooks without `timeout-minutes`.
    pub post_step_timeout_minutes: u32,

    /// Whether `##[debug]` lines are recorded in step logs.
    pub step_debug: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            temp_directory: std::env::temp_dir(),
            workspace_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            default_shell: default_shell().to_string(),
            default_step_timeout_minutes: constants::DEFAULT_STEP_TIMEOUT_MINUTES,
            post_step_timeout_minutes: constants::DEFAULT_POST_STEP_TIMEOUT_MINUTES,
            step_debug: false,
        }
    }
}

impl RunnerSettings {
    /// Load settings from `path` if given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read settings file {:?}", path))?;
                serde_json::from_str::<RunnerSettings>(&content)
                    .with_context(|| format!("Failed to parse settings file {:?}", path))?
            }
            None => RunnerSettings::default(),
        };
        if let Some(path) = path {
            tracing::debug!(target: "settings", path = %path.display(), "loaded settings file");
        }

        Ok(settings.with_overrides(|name| std::env::var(name).ok()))
    }

    /// Apply overrides from a variable lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(temp) = lookup(variables::RUNNER_TEMP).filter(|v| !v.is_empty()) {
            tracing::debug!(target: "settings", variable = variables::RUNNER_TEMP, value = %temp, "overriding temp directory");
            self.temp_directory = PathBuf::from(temp);
        }
        if let Some(workspace) = lookup(variables::RUNNER_WORKSPACE).filter(|v| !v.is_empty()) {
            tracing::debug!(target: "settings", variable = variables::RUNNER_WORKSPACE, value = %workspace, "overriding workspace directory");
            self.workspace_directory = PathBuf::from(workspace);
        }
        if let Some(value) = lookup(variables::STEP_DEBUG) {
            match convert_to_bool(&value) {
                Some(step_debug) => {
                    tracing::debug!(target: "settings", variable = variables::STEP_DEBUG, debug = step_debug, "overriding step debug");
                    self.step_debug = step_debug;
                }
                None => {
                    tracing::warn!(target: "settings", variable = variables::STEP_DEBUG, value = %value, "ignoring value that is not a boolean");
                }
            }
        }
        self
    }
}

/// `bash` on Unix, `pwsh` on Windows.
pub fn default_shell() -> &'static str {
    if cfg!(windows) {
        "pwsh"
    } else {
        "bash"
    }
}

/// Valid true values: `1`, `true`, `$true`; false: `0`, `false`, `$false`
/// (case-insensitive). Anything else is `None`.
pub fn convert_to_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "$true" => Some(true),
        "0" | "false" | "$false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "defaultShell": "sh", "postStepTimeoutMinutes": 2 }"#).unwrap();

        let settings = RunnerSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.default_shell, "sh");
        assert_eq!(settings.post_step_timeout_minutes, 2);
        assert_eq!(
            settings.default_step_timeout_minutes,
            constants::DEFAULT_STEP_TIMEOUT_MINUTES
        );
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let err = RunnerSettings::load(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse settings file"));
    }

    #[test]
    fn environment_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("RUNNER_TEMP", "/tmp/runner-temp"),
            ("ACTIONS_STEP_DEBUG", "TRUE"),
            ("RUNNER_WORKSPACE", ""),
        ]
        .into_iter()
        .collect();

        let base = RunnerSettings::default();
        let workspace = base.workspace_directory.clone();
        let settings = base.with_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(settings.temp_directory, PathBuf::from("/tmp/runner-temp"));
        assert!(settings.step_debug);
        assert_eq!(settings.workspace_directory, workspace);
    }

    #[test]
    fn unrecognised_step_debug_value_is_ignored() {
        let base = RunnerSettings {
            step_debug: true,
            ..RunnerSettings::default()
        };
        let settings = base.with_overrides(|name| (name == "ACTIONS_STEP_DEBUG").then(|| "verbose".to_string()));
        assert!(settings.step_debug);
    }

    #[test]
    fn convert_to_bool_accepts_known_spellings() {
        assert_eq!(convert_to_bool("$True"), Some(true));
        assert_eq!(convert_to_bool("0"), Some(false));
        assert_eq!(convert_to_bool("yes"), None);
    }
}
