use std::path::{Path, PathBuf};

/// Locates executables, optionally against a step's own `PATH` value rather
/// than the runner's.
pub struct WhichUtil;

impl WhichUtil {
    /// Locate `command` on the runner process `PATH`.
    pub fn which(command: &str, require: bool) -> anyhow::Result<Option<PathBuf>> {
        let path = std::env::var("PATH").ok();
        Self::which_in(command, path.as_deref(), require)
    }

    /// Locate `command` on the given `PATH` value.
    ///
    /// - An absolute path that exists is returned as-is.
    /// - If `require` is true and the command is not found, returns an error
    ///   naming the command; otherwise `Ok(None)`.
    pub fn which_in(command: &str, path: Option<&str>, require: bool) -> anyhow::Result<Option<PathBuf>> {
        if command.is_empty() {
            if require {
                anyhow::bail!("command must not be empty");
            }
            return Ok(None);
        }

        let command_path = Path::new(command);
        if command_path.is_absolute() && command_path.is_file() {
            return Ok(Some(command_path.to_path_buf()));
        }

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        match which::which_in(command, path, cwd) {
            Ok(found) => Ok(Some(found)),
            Err(_) if require => anyhow::bail!(
                "{command}: command not found. Make sure '{command}' is installed and its location included in the 'PATH' environment variable."
            ),
            Err(_) => Ok(None),
        }
    }
}
