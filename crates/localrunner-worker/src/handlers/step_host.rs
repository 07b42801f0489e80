// ProcessStepRunner: the StepRunner that launches real processes on the
// host through the ProcessInvoker.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use localrunner_common::RunnerSettings;
use localrunner_sdk::trace::TracingTraceWriter;
use localrunner_sdk::{ProcessInvoker, ProcessOutputLine};

use crate::step_runner::{OutputSink, RunOutput, RunRequest, StepRunner};

use super::handler::HandlerFactory;

pub struct ProcessStepRunner {
    handlers: HandlerFactory,
}

impl ProcessStepRunner {
    pub fn new(settings: &RunnerSettings) -> Self {
        Self {
            handlers: HandlerFactory::new(settings.default_shell.clone()),
        }
    }
}

#[async_trait]
impl StepRunner for ProcessStepRunner {
    async fn run(&self, request: &RunRequest, output: OutputSink, cancel: CancellationToken) -> Result<RunOutput> {
        let spec = self
            .handlers
            .create(&request.runnable)
            .prepare(request)
            .with_context(|| format!("Failed to prepare '{}'", request.display_name))?;

        let mut invoker = ProcessInvoker::new(Arc::new(TracingTraceWriter::new("step_host")));
        let mut receiver = invoker
            .take_output_receiver()
            .context("Process output is not available")?;

        let exit_code = {
            let execute = invoker.execute(&spec, cancel);
            tokio::pin!(execute);
            loop {
                tokio::select! {
                    exit_code = &mut execute => break exit_code?,
                    Some(line) = receiver.recv() => forward(request, &output, line),
                }
            }
        };

        // the readers have finished once execute returns
        while let Ok(line) = receiver.try_recv() {
            forward(request, &output, line);
        }

        Ok(RunOutput::exit(exit_code))
    }
}

fn forward(request: &RunRequest, output: &OutputSink, line: ProcessOutputLine) {
    tracing::trace!(target: "step_host", step = %request.step_id, stream = ?line.stream, "{}", line.data);
    output.line(line.data);
}
