// JobRunner: runs one job from resolution to its conclusion.
//
// Resolve the step definitions, build the plan, run every pre hook, run the
// main steps until a failure halts the job, then drain the post stack in
// reverse registration order whatever happened before.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use localrunner_common::{ActionResult, ResultUtil, RunnerSettings, SecretMasker};

use crate::action_manager::{ActionManager, ActionResolver, StepDefinition};
use crate::errors::{ContextError, StepError};
use crate::execution_context::{ExecutionContext, ScopeId};
use crate::step::{HookCondition, Step, StepStage};
use crate::step_plan::{CompositeFrame, ExecutionPlan, PlannedUnit};
use crate::step_runner::StepRunner;
use crate::steps_context::{StepKey, StepResult};
use crate::steps_runner::{conclude, StepState, StepStates, StepsRunner};

/// Result of one pre or post hook.
#[derive(Debug, Clone, Serialize)]
pub struct HookResult {
    pub step_id: String,
    pub stage: StepStage,
    #[serde(flatten)]
    pub result: StepResult,
}

/// What a job produced.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub conclusion: ActionResult,
    /// Main-stage results by qualified step id.
    pub steps: BTreeMap<String, StepResult>,
    /// Hook results in execution order.
    pub hooks: Vec<HookResult>,
    /// Final top-level environment.
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub summary: String,
    /// Job-level error, e.g. a resolution failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
}

impl JobResult {
    fn failed(job_id: Uuid, error: String, env: BTreeMap<String, String>) -> Self {
        Self {
            job_id,
            conclusion: ActionResult::Failure,
            steps: BTreeMap::new(),
            hooks: Vec::new(),
            env,
            summary: String::new(),
            error: Some(error),
            log: Vec::new(),
        }
    }

    pub fn return_code(&self) -> i32 {
        ResultUtil::translate_to_return_code(self.conclusion)
    }

    pub fn hook(&self, step_id: &str, stage: StepStage) -> Option<&StepResult> {
        self.hooks
            .iter()
            .find(|h| h.step_id == step_id && h.stage == stage)
            .map(|h| &h.result)
    }
}

pub struct JobRunner {
    steps_runner: StepsRunner,
    secret_masker: SecretMasker,
}

impl JobRunner {
    pub fn new(runner: Arc<dyn StepRunner>, settings: Arc<RunnerSettings>) -> Self {
        Self {
            steps_runner: StepsRunner::new(runner, settings),
            secret_masker: SecretMasker::new(),
        }
    }

    pub fn with_secret_masker(mut self, secret_masker: SecretMasker) -> Self {
        self.secret_masker = secret_masker;
        self
    }

    /// Resolve `definitions` and run them.
    ///
    /// A resolution error fails the job before any step runs. `Err` is only
    /// returned when the engine itself misbehaves.
    pub async fn run_job(
        &self,
        definitions: &[StepDefinition],
        env: BTreeMap<String, String>,
        resolver: &dyn ActionResolver,
        cancel: CancellationToken,
    ) -> Result<JobResult, ContextError> {
        let steps = match ActionManager::new(resolver).resolve_steps(definitions) {
            Ok(steps) => steps,
            Err(e) => {
                let job_id = Uuid::new_v4();
                tracing::error!(target: "job_runner", %job_id, "{e}");
                return Ok(JobResult::failed(job_id, e.to_string(), env));
            }
        };

        self.run_steps(&steps, env, cancel).await
    }

    /// Run an already resolved step tree.
    pub async fn run_steps(
        &self,
        steps: &[Step],
        env: BTreeMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<JobResult, ContextError> {
        let job_id = Uuid::new_v4();
        let mut context = ExecutionContext::new(
            env,
            cancel,
            self.secret_masker.clone(),
            self.steps_runner.settings().step_debug,
        );

        let ExecutionPlan {
            pre_queue,
            main_queue,
            post_stack,
            skipped,
            composites,
        } = ExecutionPlan::build(steps);
        tracing::info!(
            target: "job_runner",
            %job_id,
            pre = pre_queue.len(),
            main = main_queue.len(),
            post = post_stack.len(),
            skipped = skipped.len(),
            "starting job"
        );

        for frame in &composites {
            for child in &frame.children {
                context.mark_nested(child);
            }
        }

        let mut job = JobExecution {
            steps_runner: &self.steps_runner,
            composites,
            context,
            states: StepStates::new(),
            frames: Vec::new(),
            halted: false,
            halted_frames: HashSet::new(),
        };

        job.skip_planned(&skipped)?;
        job.run_pre(pre_queue).await?;
        job.run_main(main_queue).await?;
        job.run_post(post_stack).await?;

        let result = job.finish(job_id)?;
        tracing::info!(target: "job_runner", %job_id, conclusion = %result.conclusion, "job finished");
        Ok(result)
    }
}

/// A composite whose scope is currently open.
struct Frame {
    step_id: String,
    scope: ScopeId,
}

struct JobExecution<'a, 'r> {
    steps_runner: &'r StepsRunner,
    composites: Vec<CompositeFrame<'a>>,
    context: ExecutionContext,
    states: StepStates,
    frames: Vec<Frame>,
    /// A failure escaped every composite: remaining main steps are skipped.
    halted: bool,
    /// Composites whose remaining children are skipped.
    halted_frames: HashSet<String>,
}

impl<'a, 'r> JobExecution<'a, 'r> {
    fn skip_planned(&mut self, skipped: &[PlannedUnit<'a>]) -> Result<(), ContextError> {
        for unit in skipped {
            self.states.skip(&unit.step_id)?;
            self.context
                .record_result(StepKey::main(&unit.step_id), StepResult::skipped())?;
            tracing::debug!(target: "job_runner", step = %unit.step_id, "condition is false, skipping");
        }
        Ok(())
    }

    async fn run_pre(&mut self, queue: VecDeque<PlannedUnit<'a>>) -> Result<(), ContextError> {
        tracing::info!(target: "job_runner", units = queue.len(), "running pre hooks");

        for unit in queue {
            let key = StepKey::new(&unit.step_id, StepStage::Pre);
            if self.context.is_cancelled() || !self.hook_condition_holds(&unit) {
                self.context.record_result(key, StepResult::skipped())?;
                continue;
            }

            let scope = self.enter_path(&unit.scope_path, StepStage::Pre)?;
            let report = self
                .steps_runner
                .run_unit(&mut self.context, &unit, scope)
                .await?;
            let result = report.into_result(unit.step.continue_on_error, BTreeMap::new());
            let outcome = result.outcome;
            let error = result.error.clone();
            self.context.record_result(key, result)?;

            // a hook cut short by job cancellation leaves its main body to be
            // skipped with the rest
            let cancelled = outcome == ActionResult::Cancelled && self.context.is_cancelled();
            if outcome != ActionResult::Success && !cancelled {
                self.fail_before_main(&unit, error)?;
            }
        }

        self.enter_path(&[], StepStage::Pre)?;
        Ok(())
    }

    async fn run_main(&mut self, queue: VecDeque<PlannedUnit<'a>>) -> Result<(), ContextError> {
        tracing::info!(target: "job_runner", units = queue.len(), "running main steps");

        for unit in queue {
            let step_id = unit.step_id.as_str();
            if self.states.is_terminal(step_id) {
                // settled by its pre hook
                continue;
            }

            if let Some(reason) = self.skip_reason(&unit) {
                self.states.skip(step_id)?;
                self.context
                    .record_result(StepKey::main(step_id), StepResult::skipped())?;
                tracing::info!(target: "job_runner", step = step_id, reason, "skipping step");
                continue;
            }

            let scope = self.enter_path(&unit.scope_path, StepStage::Main)?;
            self.states.start(step_id)?;
            let report = self
                .steps_runner
                .run_unit(&mut self.context, &unit, scope)
                .await?;
            self.states.complete(step_id, report.outcome)?;

            let outputs = self.context.outputs_of(step_id);
            let result = report.into_result(unit.step.continue_on_error, outputs);
            let conclusion = result.conclusion;
            self.context.record_result(StepKey::main(step_id), result)?;

            if matches!(conclusion, ActionResult::Failure | ActionResult::Cancelled) {
                self.propagate_failure(&unit.scope_path);
            }
        }

        self.enter_path(&[], StepStage::Main)?;

        // composites never entered, children before parents
        let pending: Vec<String> = self
            .composites
            .iter()
            .rev()
            .map(|c| c.step_id.clone())
            .collect();
        for step_id in pending {
            self.finish_composite(&step_id)?;
        }
        Ok(())
    }

    async fn run_post(&mut self, mut stack: Vec<PlannedUnit<'a>>) -> Result<(), ContextError> {
        tracing::info!(target: "job_runner", units = stack.len(), "running post hooks");

        while let Some(unit) = stack.pop() {
            let key = StepKey::new(&unit.step_id, StepStage::Post);
            let main_ran = self
                .context
                .steps()
                .main(&unit.step_id)
                .map_or(false, |r| r.outcome != ActionResult::Skipped);

            if !main_ran || !self.hook_condition_holds(&unit) {
                self.context.record_result(key, StepResult::skipped())?;
                continue;
            }

            let scope = self.enter_path(&unit.scope_path, StepStage::Post)?;
            let report = self
                .steps_runner
                .run_unit(&mut self.context, &unit, scope)
                .await?;
            let result = report.into_result(unit.step.continue_on_error, BTreeMap::new());
            self.context.record_result(key, result)?;
        }

        self.enter_path(&[], StepStage::Post)?;
        Ok(())
    }

    fn finish(self, job_id: Uuid) -> Result<JobResult, ContextError> {
        let mut steps = BTreeMap::new();
        let mut hooks = Vec::new();
        for (key, result) in self.context.steps().iter() {
            match key.stage {
                StepStage::Main => {
                    steps.insert(key.step_id.clone(), result.clone());
                }
                stage => hooks.push(HookResult {
                    step_id: key.step_id.clone(),
                    stage,
                    result: result.clone(),
                }),
            }
        }

        Ok(JobResult {
            job_id,
            conclusion: self.context.job_status(),
            steps,
            hooks,
            env: self.context.env(ScopeId::ROOT)?.clone(),
            summary: self.context.summary(),
            error: None,
            log: self.context.log_lines().to_vec(),
        })
    }

    // -- decisions ---------------------------------------------------------------

    fn skip_reason(&self, unit: &PlannedUnit<'_>) -> Option<&'static str> {
        if self.context.is_cancelled() {
            Some("job was cancelled")
        } else if self.halted {
            Some("a previous step failed")
        } else if unit.scope_path.iter().any(|id| self.halted_frames.contains(id)) {
            Some("a previous step of the composite action failed")
        } else {
            None
        }
    }

    /// Evaluated against the job status at the moment the hook would run.
    fn hook_condition_holds(&self, unit: &PlannedUnit<'_>) -> bool {
        let Some(hook) = unit.step.hook(unit.stage) else {
            return false;
        };
        match hook.condition {
            HookCondition::Always => true,
            HookCondition::Success => self.context.job_status() == ActionResult::Success,
            HookCondition::Failure => self.context.job_status() == ActionResult::Failure,
            HookCondition::Cancelled => self.context.is_cancelled(),
        }
    }

    /// Halt the composites enclosing a failed step, innermost first, up to the
    /// first one that continues on error. Halts the job if none does.
    fn propagate_failure(&mut self, scope_path: &[String]) {
        for ancestor in scope_path.iter().rev() {
            self.halted_frames.insert(ancestor.clone());
            let contained = self
                .composites
                .iter()
                .find(|c| &c.step_id == ancestor)
                .map_or(false, |c| c.step.continue_on_error);
            if contained {
                tracing::info!(target: "job_runner", composite = %ancestor, "failure contained by continue-on-error");
                return;
            }
        }

        if !self.halted {
            tracing::info!(target: "job_runner", "halting job, remaining steps will be skipped");
        }
        self.halted = true;
    }

    /// A failed pre hook fails its step without running the main body.
    fn fail_before_main(&mut self, unit: &PlannedUnit<'a>, hook_error: Option<String>) -> Result<(), ContextError> {
        let step_id = unit.step_id.as_str();
        if self.states.is_terminal(step_id) {
            return Ok(());
        }

        let error = StepError::PreHookFailed(hook_error.unwrap_or_else(|| "pre hook did not succeed".to_string()));
        let conclusion = conclude(ActionResult::Failure, Some(&error), unit.step.continue_on_error);
        self.states.complete(step_id, ActionResult::Failure)?;
        self.context.record_result(
            StepKey::main(step_id),
            StepResult::new(ActionResult::Failure, conclusion).with_error(error.to_string()),
        )?;

        let owner_path = if unit.step.is_composite() {
            // none of the composite's children run
            self.halted_frames.insert(step_id.to_string());
            &unit.scope_path[..unit.scope_path.len().saturating_sub(1)]
        } else {
            &unit.scope_path[..]
        };
        if conclusion != ActionResult::Success {
            self.propagate_failure(owner_path);
        }
        Ok(())
    }

    // -- composite scopes ----------------------------------------------------------

    fn current_scope(&self) -> ScopeId {
        self.frames.last().map_or(ScopeId::ROOT, |f| f.scope)
    }

    fn composite(&self, step_id: &str) -> Result<CompositeFrame<'a>, ContextError> {
        self.composites
            .iter()
            .find(|c| c.step_id == step_id)
            .cloned()
            .ok_or_else(|| ContextError::UnknownComposite(step_id.to_string()))
    }

    /// Leave open composites not on `path`, then enter the rest of `path`.
    fn enter_path(&mut self, path: &[String], stage: StepStage) -> Result<ScopeId, ContextError> {
        let common = self
            .frames
            .iter()
            .zip(path)
            .take_while(|(frame, id)| frame.step_id == **id)
            .count();

        while self.frames.len() > common {
            self.leave_frame(stage)?;
        }
        for step_id in &path[common..] {
            self.enter_frame(step_id, stage)?;
        }
        Ok(self.current_scope())
    }

    fn enter_frame(&mut self, step_id: &str, stage: StepStage) -> Result<(), ContextError> {
        let frame = self.composite(step_id)?;
        let inputs: BTreeMap<String, String> = frame
            .step
            .inputs
            .iter()
            .map(|(name, value)| (name.clone(), value.to_boundary_string()))
            .collect();
        let parent = self.current_scope();
        let scope = self.context.new_scope(parent, &frame.step.env, &inputs)?;

        if stage == StepStage::Main && self.states.get(step_id) == StepState::Pending {
            self.states.start(step_id)?;
            self.context.set_display_name(frame.step.display_name.clone());
            self.context.write(&format!("Run composite action '{step_id}'"));
        }

        tracing::debug!(target: "job_runner", step = step_id, stage = %stage, "entering composite scope");
        self.frames.push(Frame {
            step_id: step_id.to_string(),
            scope,
        });
        Ok(())
    }

    fn leave_frame(&mut self, stage: StepStage) -> Result<(), ContextError> {
        let Some(frame) = self.frames.pop() else {
            return Ok(());
        };
        tracing::debug!(target: "job_runner", step = %frame.step_id, stage = %stage, "leaving composite scope");
        self.context.leave_scope(frame.scope)?;
        if stage == StepStage::Main {
            self.finish_composite(&frame.step_id)?;
        }
        Ok(())
    }

    /// Record a composite's result from its children's, once.
    fn finish_composite(&mut self, step_id: &str) -> Result<(), ContextError> {
        let frame = self.composite(step_id)?;
        for child in &frame.children {
            if self.composites.iter().any(|c| &c.step_id == child) {
                self.finish_composite(child)?;
            }
        }

        let key = StepKey::main(step_id);
        if self.context.steps().has_result(&key) {
            return Ok(());
        }

        let conclusions: Vec<(&String, ActionResult)> = frame
            .children
            .iter()
            .filter_map(|child| self.context.steps().main(child).map(|r| (child, r.conclusion)))
            .collect();
        let first = |wanted: ActionResult| {
            conclusions
                .iter()
                .find(|(_, conclusion)| *conclusion == wanted)
                .map(|(child, _)| child.to_string())
        };

        let entered = self.states.get(step_id) == StepState::Running;
        let halted = self.halted
            || self.context.is_cancelled()
            || frame.parent_path.iter().any(|id| self.halted_frames.contains(id));

        let (outcome, error) = if let Some(child) = first(ActionResult::Failure) {
            (ActionResult::Failure, Some(format!("step '{child}' failed")))
        } else if let Some(child) = first(ActionResult::Cancelled) {
            (ActionResult::Cancelled, Some(format!("step '{child}' was cancelled")))
        } else if !entered && halted {
            (ActionResult::Skipped, None)
        } else {
            (ActionResult::Success, None)
        };

        let recoverable = matches!(outcome, ActionResult::Failure | ActionResult::Cancelled)
            && !self.context.is_cancelled();
        let conclusion = if frame.step.continue_on_error && recoverable {
            ActionResult::Success
        } else {
            outcome
        };

        let outputs: BTreeMap<String, String> = frame
            .step
            .action
            .as_ref()
            .map(|action| {
                action
                    .outputs
                    .iter()
                    .filter_map(|(name, mapping)| {
                        self.context
                            .outputs_of(&format!("{step_id}/{}", mapping.step))
                            .remove(&mapping.output)
                            .map(|value| (name.clone(), value))
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.context.set_outputs(step_id, outputs.clone());

        self.states.complete(step_id, outcome)?;
        let mut result = StepResult::new(outcome, conclusion).with_outputs(outputs);
        if let Some(error) = error {
            result = result.with_error(error);
        }
        tracing::info!(target: "job_runner", step = step_id, outcome = %outcome, conclusion = %conclusion, "composite finished");
        self.context.record_result(key, result)
    }
}
