// StepRunner: the capability the engine uses to execute one runnable.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::step::{Runnable, StepStage};

/// Everything a runner needs to execute one unit.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Qualified step id.
    pub step_id: String,
    pub display_name: String,
    pub stage: StepStage,
    pub runnable: Runnable,
    /// Complete environment snapshot: scope env, step env, `INPUT_*`,
    /// `STATE_*`, the `GITHUB_*` file-command paths and the search path.
    pub environment: BTreeMap<String, String>,
    /// Inputs after canonical stringification.
    pub inputs: BTreeMap<String, String>,
    /// Step-scoped scratch directory holding the file-command files. Removed
    /// after the unit.
    pub temp_directory: PathBuf,
    pub working_directory: PathBuf,
    /// Hard deadline enforced by the engine.
    pub timeout: Duration,
}

/// Exit status of a runnable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub exit_code: i32,
}

impl RunOutput {
    pub fn exit(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

/// Receives the lines a runnable prints while it is still running.
#[derive(Debug, Clone)]
pub struct OutputSink {
    sender: mpsc::UnboundedSender<String>,
}

impl OutputSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn line(&self, line: impl Into<String>) {
        // the unit is over once the receiver is gone
        let _ = self.sender.send(line.into());
    }
}

#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run `request.runnable` to completion, sending every line it prints to
    /// `output` as it arrives.
    ///
    /// A non-zero exit is returned as `Ok`; `Err` means the runnable could
    /// not run at all. Implementations should stop promptly once `cancel`
    /// fires.
    async fn run(
        &self,
        request: &RunRequest,
        output: OutputSink,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunOutput>;
}
