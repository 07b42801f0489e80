// Constants shared by the engine, the process runner and the CLI.

/// Name of the search-path variable.
#[cfg(windows)]
pub const PATH_VARIABLE: &str = "Path";
#[cfg(not(windows))]
pub const PATH_VARIABLE: &str = "PATH";

/// Separator between entries of the search-path variable.
#[cfg(windows)]
pub const PATH_LIST_SEPARATOR: &str = ";";
#[cfg(not(windows))]
pub const PATH_LIST_SEPARATOR: &str = ":";

/// Separator used to join the lines of a multiline file-command value.
#[cfg(windows)]
pub const LINE_SEPARATOR: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_SEPARATOR: &str = "\n";

/// Maximum nesting of composite actions before resolution is refused.
pub const COMPOSITE_ACTIONS_MAX_DEPTH: u32 = 9;

/// Deadline for a pre or main unit that declares no timeout (6 hours).
pub const DEFAULT_STEP_TIMEOUT_MINUTES: u32 = 360;

/// Deadline for a post hook that declares no timeout.
pub const DEFAULT_POST_STEP_TIMEOUT_MINUTES: u32 = 5;

/// Maximum accepted size of one step summary file, in KiB.
pub const MAX_STEP_SUMMARY_SIZE_KB: usize = 1024;

/// Prefix of the variables that carry step inputs into a step process.
pub const INPUT_VARIABLE_PREFIX: &str = "INPUT_";

/// Prefix of the variables that carry saved state into later stages.
pub const STATE_VARIABLE_PREFIX: &str = "STATE_";

/// Well-known variables naming the step-scoped file-command files.
pub mod file_commands {
    pub const ENV: &str = "GITHUB_ENV";
    pub const PATH: &str = "GITHUB_PATH";
    pub const OUTPUT: &str = "GITHUB_OUTPUT";
    pub const STEP_SUMMARY: &str = "GITHUB_STEP_SUMMARY";
    pub const STATE: &str = "GITHUB_STATE";

    /// All of the above, in the order the files are created.
    pub const ALL: &[&str] = &[ENV, PATH, OUTPUT, STEP_SUMMARY, STATE];
}

/// Environment variables read by `RunnerSettings`.
pub mod variables {
    pub const RUNNER_TEMP: &str = "RUNNER_TEMP";
    pub const RUNNER_WORKSPACE: &str = "RUNNER_WORKSPACE";
    pub const STEP_DEBUG: &str = "ACTIONS_STEP_DEBUG";
}
