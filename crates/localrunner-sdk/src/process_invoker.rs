use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The duration to wait after sending SIGINT before escalating to SIGTERM.
const SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
/// The duration to wait after sending SIGTERM before escalating to SIGKILL.
const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);

/// Upper bound for a cancelled child to go through SIGINT, SIGTERM and SIGKILL.
pub const CANCEL_GRACE_PERIOD: Duration = Duration::from_millis(11_000);

/// Error type for non-zero process exit codes.
#[derive(Debug, thiserror::Error)]
#[error("Exit code {exit_code} returned from process: file name '{file_name}', arguments '{arguments}'.")]
pub struct ProcessExitCodeError {
    pub exit_code: i32,
    pub file_name: String,
    pub arguments: String,
}

/// Which stream a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A line received from the child.
#[derive(Debug, Clone)]
pub struct ProcessOutputLine {
    pub stream: OutputStream,
    pub data: String,
}

/// Everything needed to start one child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub file_name: String,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Variables set on top of the inherited host environment.
    pub environment: HashMap<String, String>,
    /// Fail with `ProcessExitCodeError` instead of returning a non-zero code.
    pub require_exit_code_zero: bool,
    /// Skip SIGINT/SIGTERM and kill straight away on cancellation.
    pub kill_process_on_cancel: bool,
}

impl ProcessSpec {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn envs(mut self, env: &HashMap<String, String>) -> Self {
        self.environment
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// Spawns a child process, streams stdout/stderr line by line through a
/// channel, and handles cancellation with SIGINT → SIGTERM → SIGKILL.
///
/// The child is spawned with `kill_on_drop`, so dropping the `execute`
/// future (a caller-side deadline) never leaks the process.
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
    output_tx: mpsc::UnboundedSender<ProcessOutputLine>,
    output_rx: Option<mpsc::UnboundedReceiver<ProcessOutputLine>>,
}

impl ProcessInvoker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            trace,
            output_tx,
            output_rx: Some(output_rx),
        }
    }

    /// Take the output receiver. Can only be called once.
    pub fn take_output_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessOutputLine>> {
        self.output_rx.take()
    }

    /// Run the process to completion and return its exit code.
    ///
    /// A cancelled process is reported as an error, never as an exit code.
    pub async fn execute(&self, spec: &ProcessSpec, cancellation_token: CancellationToken) -> Result<i32> {
        if spec.file_name.is_empty() {
            anyhow::bail!("file name must not be empty");
        }

        let arguments = spec.arguments.join(" ");
        self.trace.info("Starting process:");
        self.trace.info(&format!("  File name: '{}'", spec.file_name));
        self.trace.info(&format!("  Arguments: '{arguments}'"));
        if let Some(ref dir) = spec.working_directory {
            self.trace
                .info(&format!("  Working directory: '{}'", dir.display()));
        }

        let mut cmd = Command::new(&spec.file_name);
        cmd.args(&spec.arguments);
        if let Some(ref dir) = spec.working_directory {
            if dir.is_dir() {
                cmd.current_dir(dir);
            }
        }
        cmd.envs(&spec.environment);
        if !spec.environment.contains_key("CI") {
            cmd.env("CI", "true");
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let start = std::time::Instant::now();
        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to start process '{}' with arguments '{arguments}'",
                spec.file_name
            )
        })?;

        let pid = child.id().unwrap_or(0);
        self.trace
            .verbose(&format!("Process started with process id {pid}, waiting for process exit."));

        let stdout_task = child
            .stdout
            .take()
            .map(|s| self.spawn_reader(s, OutputStream::Stdout));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| self.spawn_reader(s, OutputStream::Stderr));

        let (exit_code, was_cancelled) = tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for process")?;
                (status.code().unwrap_or(-1), false)
            }
            _ = cancellation_token.cancelled() => {
                self.trace.info("Cancellation requested.");
                (self.cancel_and_kill_process(&mut child, spec.kill_process_on_cancel).await, true)
            }
        };

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = task.await;
        }

        self.trace.verbose(&format!(
            "Finished process {pid} with exit code {exit_code}, and elapsed time {:.2?}.",
            start.elapsed()
        ));

        if was_cancelled {
            anyhow::bail!("Process '{}' was cancelled", spec.file_name);
        }

        if exit_code != 0 && spec.require_exit_code_zero {
            return Err(ProcessExitCodeError {
                exit_code,
                file_name: spec.file_name.clone(),
                arguments,
            }
            .into());
        }

        Ok(exit_code)
    }

    fn spawn_reader<R>(&self, reader: R, stream: OutputStream) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.output_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx.send(ProcessOutputLine { stream, data: line });
            }
        })
    }

    async fn cancel_and_kill_process(&self, child: &mut tokio::process::Child, kill_immediately: bool) -> i32 {
        if !kill_immediately {
            if self.send_signal_and_wait(child, Signal::Int, SIGINT_TIMEOUT).await {
                self.trace.info("Process cancelled successfully through SIGINT.");
                return exit_code_of(child).await;
            }
            if self.send_signal_and_wait(child, Signal::Term, SIGTERM_TIMEOUT).await {
                self.trace.info("Process terminated successfully through SIGTERM.");
                return exit_code_of(child).await;
            }
        }

        self.trace
            .info("Killing process since both cancel and terminate signals have been ignored.");
        let _ = child.kill().await;
        exit_code_of(child).await
    }

    /// Returns `true` if the process exited within `timeout` after the signal.
    #[cfg(unix)]
    async fn send_signal_and_wait(&self, child: &mut tokio::process::Child, signal: Signal, timeout: Duration) -> bool {
        let Some(pid) = child.id() else {
            return true;
        };

        let sig = match signal {
            Signal::Int => nix::sys::signal::Signal::SIGINT,
            Signal::Term => nix::sys::signal::Signal::SIGTERM,
        };

        self.trace.verbose(&format!("Sending {sig:?} to process {pid}."));
        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig).is_err() {
            self.trace
                .info(&format!("{sig:?} signal failed to send to process {pid}."));
            return false;
        }

        tokio::time::timeout(timeout, child.wait()).await.is_ok()
    }

    #[cfg(not(unix))]
    async fn send_signal_and_wait(&self, _child: &mut tokio::process::Child, _signal: Signal, _timeout: Duration) -> bool {
        false
    }
}

async fn exit_code_of(child: &mut tokio::process::Child) -> i32 {
    child
        .wait()
        .await
        .map(|s| s.code().unwrap_or(-1))
        .unwrap_or(-1)
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Int,
    Term,
}
