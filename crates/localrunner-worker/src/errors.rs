// Error taxonomy of the step engine.
//
// A condition skip is not an error and has no variant here; it is recorded as
// a `Skipped` result.

use std::fmt;

/// Malformed content in one of the file-command files.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{file} line {line}: {kind}")]
pub struct ProtocolParseError {
    /// Well-known name of the offending file (e.g. `GITHUB_ENV`).
    pub file: String,
    /// 1-based line number of the offending line.
    pub line: usize,
    pub kind: ProtocolErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    EmptyKey,
    EmptyDelimiter,
    /// The heredoc delimiter never appeared before end of file.
    MissingDelimiter(String),
    /// The line has neither `=` nor `<<`.
    InvalidLine(String),
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolErrorKind::EmptyKey => write!(f, "empty key"),
            ProtocolErrorKind::EmptyDelimiter => write!(f, "empty heredoc delimiter"),
            ProtocolErrorKind::MissingDelimiter(delim) => {
                write!(f, "delimiter '{delim}' not found before end of file")
            }
            ProtocolErrorKind::InvalidLine(line) => {
                write!(f, "invalid format '{line}', expected a line with '=' or '<<'")
            }
        }
    }
}

/// Failure to turn step definitions into a resolved step tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolverError {
    #[error("unable to resolve action '{0}'")]
    UnknownAction(String),

    #[error("action '{reference}' is used recursively: {chain}")]
    Cycle { reference: String, chain: String },

    #[error("composite action depth exceeded maximum of {max} at '{reference}'")]
    DepthExceeded { reference: String, max: u32 },

    #[error("action '{0}' declares no main entrypoint")]
    MissingMain(String),

    #[error("step '{0}' has neither 'run' nor 'uses'")]
    InvalidStep(String),

    #[error("step id '{0}' is used more than once in the same scope")]
    DuplicateStepId(String),

    #[error("step id '{0}' must not contain '/'")]
    InvalidStepId(String),
}

/// Errors raised by the execution context when the engine misuses it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("result for '{0}' has already been recorded")]
    AlreadyRecorded(String),

    #[error("scope {0} does not exist")]
    UnknownScope(usize),

    #[error("composite step '{0}' is not part of the plan")]
    UnknownComposite(String),

    #[error("step '{id}' cannot go from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },
}

/// Why a single pre, main or post unit did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The runnable exited non-zero.
    #[error("Process completed with exit code {0}.")]
    ExitCode(i32),

    /// The runnable could not run or crashed (missing binary, container
    /// failed to start, runner panicked, file-command setup failed).
    #[error("{0:#}")]
    Runtime(anyhow::Error),

    #[error("invalid file command: {0}")]
    Protocol(#[from] ProtocolParseError),

    #[error("The step has exceeded the maximum execution time of {0} minutes.")]
    Timeout(u32),

    #[error("The operation was canceled.")]
    Cancelled,

    /// The pre hook of the step failed, so its main body never ran.
    #[error("pre hook failed: {0}")]
    PreHookFailed(String),
}

impl StepError {
    /// Whether continue-on-error may turn this into a successful conclusion.
    pub fn is_recoverable(&self) -> bool {
        match self {
            StepError::ExitCode(_) | StepError::Runtime(_) | StepError::Timeout(_) => true,
            StepError::PreHookFailed(_) => true,
            StepError::Protocol(_) | StepError::Cancelled => false,
        }
    }
}
