// StepsRunner: drives a single pre, main or post unit through its lifecycle.
//
// Each unit gets fresh file-command files, runs under a hard deadline and the
// job's cancellation token (post hooks under a token of their own), has the
// workflow commands on its output applied as they arrive, and has its
// file-command output parsed and applied to the scope that ran it.

use chrono::Utc;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use localrunner_common::constants::{
    INPUT_VARIABLE_PREFIX, PATH_VARIABLE, STATE_VARIABLE_PREFIX,
};
use localrunner_common::{ActionResult, RunnerSettings};
use localrunner_sdk::process_invoker::CANCEL_GRACE_PERIOD;

use crate::action_command_manager::ActionCommandManager;
use crate::errors::{ContextError, StepError};
use crate::execution_context::{ExecutionContext, ScopeId};
use crate::file_command_manager::FileCommandSet;
use crate::step::{Runnable, StepStage};
use crate::step_plan::PlannedUnit;
use crate::step_runner::{OutputSink, RunOutput, RunRequest, StepRunner};
use crate::steps_context::StepResult;

/// Lifecycle state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Running,
    Completed(ActionResult),
}

impl StepState {
    fn name(self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Completed(result) => result.as_status_str(),
        }
    }

    fn can_become(self, next: StepState) -> bool {
        match (self, next) {
            (StepState::Pending, StepState::Running) => true,
            // skipped, or failed/settled without running (pre hook failure,
            // composite never entered)
            (StepState::Pending, StepState::Completed(_)) => true,
            (StepState::Running, StepState::Completed(result)) => result != ActionResult::Skipped,
            _ => false,
        }
    }
}

/// States of every step of a job, keyed by qualified id.
#[derive(Debug, Default)]
pub struct StepStates {
    states: HashMap<String, StepState>,
}

impl StepStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, step_id: &str) -> StepState {
        self.states.get(step_id).copied().unwrap_or(StepState::Pending)
    }

    pub fn is_terminal(&self, step_id: &str) -> bool {
        matches!(self.get(step_id), StepState::Completed(_))
    }

    pub fn start(&mut self, step_id: &str) -> Result<(), ContextError> {
        self.transition(step_id, StepState::Running)
    }

    pub fn complete(&mut self, step_id: &str, outcome: ActionResult) -> Result<(), ContextError> {
        self.transition(step_id, StepState::Completed(outcome))
    }

    pub fn skip(&mut self, step_id: &str) -> Result<(), ContextError> {
        self.transition(step_id, StepState::Completed(ActionResult::Skipped))
    }

    fn transition(&mut self, step_id: &str, next: StepState) -> Result<(), ContextError> {
        let current = self.get(step_id);
        if !current.can_become(next) {
            return Err(ContextError::InvalidTransition {
                id: step_id.to_string(),
                from: current.name(),
                to: next.name(),
            });
        }
        tracing::trace!(target: "steps_runner", step = step_id, from = current.name(), to = next.name(), "state change");
        self.states.insert(step_id.to_string(), next);
        Ok(())
    }
}

/// Apply continue-on-error to an outcome.
///
/// A failure or timeout is turned into success when the step continues on
/// error; protocol errors and external cancellation never are.
pub fn conclude(outcome: ActionResult, error: Option<&StepError>, continue_on_error: bool) -> ActionResult {
    let recoverable = match (outcome, error) {
        (ActionResult::Failure, Some(error)) => error.is_recoverable(),
        (ActionResult::Failure, None) => true,
        (ActionResult::Cancelled, Some(StepError::Timeout(_))) => true,
        _ => false,
    };

    if continue_on_error && recoverable {
        ActionResult::Success
    } else {
        outcome
    }
}

/// What running one unit produced.
#[derive(Debug)]
pub struct UnitReport {
    pub outcome: ActionResult,
    pub error: Option<StepError>,
    pub started_at: chrono::DateTime<Utc>,
}

impl UnitReport {
    /// Build the recorded result for this unit.
    pub fn into_result(self, continue_on_error: bool, outputs: BTreeMap<String, String>) -> StepResult {
        let conclusion = conclude(self.outcome, self.error.as_ref(), continue_on_error);
        let mut result = StepResult::new(self.outcome, conclusion)
            .with_outputs(outputs)
            .timed(self.started_at);
        if let Some(error) = self.error {
            result = result.with_error(error.to_string());
        }
        result
    }
}

enum Interruption {
    Timeout(u32),
    Cancelled,
}

enum Interrupted {
    No(Settled),
    Yes(Interruption),
}

/// Executes planned units against a `StepRunner`.
pub struct StepsRunner {
    runner: Arc<dyn StepRunner>,
    settings: Arc<RunnerSettings>,
}

impl StepsRunner {
    pub fn new(runner: Arc<dyn StepRunner>, settings: Arc<RunnerSettings>) -> Self {
        Self { runner, settings }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Run one unit in `scope`.
    ///
    /// Pre and main units observe the job's cancellation token; post units
    /// run under a fresh one so cleanup completes after a cancelled job.
    pub async fn run_unit(
        &self,
        context: &mut ExecutionContext,
        unit: &PlannedUnit<'_>,
        scope: ScopeId,
    ) -> Result<UnitReport, ContextError> {
        let started_at = Utc::now();
        let runnable = match runnable_of(unit) {
            Some(runnable) => runnable.clone(),
            None => {
                // the plan only schedules units that have something to run
                return Ok(UnitReport {
                    outcome: ActionResult::Skipped,
                    error: None,
                    started_at,
                });
            }
        };

        let display_name = match unit.stage {
            StepStage::Main => unit.step.display_name.clone(),
            StepStage::Pre => format!("Pre {}", unit.step.display_name),
            StepStage::Post => format!("Post {}", unit.step.display_name),
        };
        context.set_display_name(display_name.clone());
        context.section(&display_name);
        context.debug(&runnable.describe());

        let file_commands = match FileCommandSet::create(&self.settings.temp_directory) {
            Ok(set) => set,
            Err(e) => {
                let error = StepError::Runtime(
                    anyhow::Error::new(e).context("Failed to create file command files"),
                );
                context.error(&error.to_string());
                context.end_section();
                return Ok(UnitReport {
                    outcome: ActionResult::Failure,
                    error: Some(error),
                    started_at,
                });
            }
        };

        let request = self.build_request(context, unit, scope, runnable, &display_name, &file_commands)?;
        let timeout_minutes = self.timeout_minutes(unit);

        let job_token = context.cancel_token();
        let step_token = match unit.stage {
            StepStage::Post => CancellationToken::new(),
            _ => job_token.child_token(),
        };
        let watch_job = unit.stage != StepStage::Post;

        tracing::info!(
            target: "steps_runner",
            step = %unit.step_id,
            stage = %unit.stage,
            timeout_minutes,
            "starting unit"
        );

        let (sink, mut lines) = OutputSink::channel();
        let mut commands = ActionCommandManager::new();

        let (mut outcome, mut error) = {
            let run = AssertUnwindSafe(self.runner.run(&request, sink, step_token.clone())).catch_unwind();
            tokio::pin!(run);
            let deadline = tokio::time::sleep(request.timeout);
            tokio::pin!(deadline);

            let interrupted = loop {
                tokio::select! {
                    Some(line) = lines.recv() => {
                        forward_line(context, &mut commands, scope, &unit.step_id, &line)?;
                    }
                    finished = &mut run => break Interrupted::No(settle(finished)),
                    _ = &mut deadline => break Interrupted::Yes(Interruption::Timeout(timeout_minutes)),
                    _ = job_token.cancelled(), if watch_job => break Interrupted::Yes(Interruption::Cancelled),
                }
            };

            match interrupted {
                // a unit that failed because the job was cancelled under it
                Interrupted::No((outcome, _))
                    if watch_job && outcome != ActionResult::Success && job_token.is_cancelled() =>
                {
                    (ActionResult::Cancelled, Some(StepError::Cancelled))
                }
                Interrupted::No(settled) => settled,
                Interrupted::Yes(interruption) => {
                    step_token.cancel();
                    // let the runner stop its child before the future is dropped
                    if tokio::time::timeout(CANCEL_GRACE_PERIOD, &mut run).await.is_err() {
                        tracing::warn!(target: "steps_runner", step = %unit.step_id, "runner did not stop within the grace period");
                    }
                    let error = match interruption {
                        Interruption::Timeout(minutes) => StepError::Timeout(minutes),
                        Interruption::Cancelled => StepError::Cancelled,
                    };
                    (ActionResult::Cancelled, Some(error))
                }
            }
        };

        // lines the runner printed after the last one was forwarded
        while let Ok(line) = lines.try_recv() {
            forward_line(context, &mut commands, scope, &unit.step_id, &line)?;
        }

        match file_commands.collect() {
            Ok(updates) => {
                for warning in &updates.warnings {
                    context.warning(warning);
                }
                context.merge_from_step_output(scope, &unit.step_id, &updates)?;
                context.save_state(&unit.step_id, &updates.state);
                if let Some(summary) = &updates.summary {
                    context.append_summary(summary);
                }
            }
            Err(parse_error) if outcome == ActionResult::Cancelled => {
                context.warning(&format!("Ignoring file commands of cancelled step: {parse_error}"));
            }
            Err(parse_error) => {
                outcome = ActionResult::Failure;
                error = Some(parse_error);
            }
        }
        drop(file_commands);

        if let Some(error) = &error {
            context.error(&error.to_string());
        }
        context.end_section();

        tracing::info!(
            target: "steps_runner",
            step = %unit.step_id,
            stage = %unit.stage,
            outcome = %outcome,
            "finished unit"
        );

        Ok(UnitReport {
            outcome,
            error,
            started_at,
        })
    }

    /// The step's own `timeout-minutes` unless it is absent or zero.
    fn timeout_minutes(&self, unit: &PlannedUnit<'_>) -> u32 {
        let default = match unit.stage {
            StepStage::Post => self.settings.post_step_timeout_minutes,
            _ => self.settings.default_step_timeout_minutes,
        };
        unit.step
            .timeout_minutes
            .filter(|minutes| *minutes > 0)
            .unwrap_or(default)
    }

    fn build_request(
        &self,
        context: &ExecutionContext,
        unit: &PlannedUnit<'_>,
        scope: ScopeId,
        runnable: Runnable,
        display_name: &str,
        file_commands: &FileCommandSet,
    ) -> Result<RunRequest, ContextError> {
        let mut environment = context.env(scope)?.clone();
        environment.extend(unit.step.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut inputs = context.inputs(scope)?.clone();
        inputs.extend(
            unit.step
                .inputs
                .iter()
                .map(|(name, value)| (name.clone(), value.to_boundary_string())),
        );
        for (name, value) in &inputs {
            environment.insert(input_variable(name), value.clone());
        }

        if let Some(state) = context.state_of(&unit.step_id) {
            for (name, value) in state {
                environment.insert(format!("{STATE_VARIABLE_PREFIX}{name}"), value.clone());
            }
        }

        environment.extend(file_commands.environment());

        let host_path = std::env::var(PATH_VARIABLE).ok();
        let search_path = context.search_path(scope, host_path.as_deref())?;
        if !search_path.is_empty() {
            environment.insert(PATH_VARIABLE.to_string(), search_path);
        }

        let working_directory = match &runnable {
            Runnable::Script {
                working_directory: Some(dir),
                ..
            } => resolve_directory(&self.settings.workspace_directory, dir),
            _ => self.settings.workspace_directory.clone(),
        };

        Ok(RunRequest {
            step_id: unit.step_id.clone(),
            display_name: display_name.to_string(),
            stage: unit.stage,
            runnable,
            environment,
            inputs,
            temp_directory: file_commands.directory().to_path_buf(),
            working_directory,
            timeout: Duration::from_secs(u64::from(self.timeout_minutes(unit)) * 60),
        })
    }
}

/// Apply `line` as a workflow command, or log it.
fn forward_line(
    context: &mut ExecutionContext,
    commands: &mut ActionCommandManager,
    scope: ScopeId,
    step_id: &str,
    line: &str,
) -> Result<(), ContextError> {
    if !commands.try_process_command(context, scope, step_id, line)? {
        context.write(line);
    }
    Ok(())
}

fn runnable_of<'a>(unit: &'a PlannedUnit<'_>) -> Option<&'a Runnable> {
    match unit.stage {
        StepStage::Main => unit.step.main_runnable(),
        stage => unit.step.hook(stage).map(|hook| &hook.runnable),
    }
}

/// `INPUT_<NAME>`, upper-cased with spaces replaced by `_`.
pub fn input_variable(name: &str) -> String {
    format!("{INPUT_VARIABLE_PREFIX}{}", name.replace(' ', "_").to_uppercase())
}

fn resolve_directory(workspace: &Path, dir: &str) -> std::path::PathBuf {
    let path = Path::new(dir);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

type Settled = (ActionResult, Option<StepError>);

fn settle(finished: std::thread::Result<anyhow::Result<RunOutput>>) -> Settled {
    match finished {
        Ok(Ok(output)) if output.exit_code == 0 => (ActionResult::Success, None),
        Ok(Ok(output)) => (ActionResult::Failure, Some(StepError::ExitCode(output.exit_code))),
        Ok(Err(e)) => (ActionResult::Failure, Some(StepError::Runtime(e))),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            (
                ActionResult::Failure,
                Some(StepError::Runtime(anyhow::anyhow!("step runner panicked: {message}"))),
            )
        }
    }
}
