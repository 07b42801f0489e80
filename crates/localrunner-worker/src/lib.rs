// localrunner-worker: job and step execution engine for the local workflow
// runner. Depends on `localrunner-sdk` and `localrunner-common`.
//
// Architecture:
//   JobRunner::run_job → ActionManager::resolve_steps → ExecutionPlan::build
//     → StepsRunner::run_unit per pre/main/post unit → StepRunner::run

pub mod action_command_manager;
pub mod action_manager;
pub mod errors;
pub mod execution_context;
pub mod file_command_manager;
pub mod handlers;
pub mod job_definition;
pub mod job_runner;
pub mod step;
pub mod step_plan;
pub mod step_runner;
pub mod steps_context;
pub mod steps_runner;

#[cfg(test)]
mod testing;

pub use action_manager::{ActionResolver, InMemoryActionResolver, ResolvedAction, StepDefinition};
pub use job_definition::JobDefinition;
pub use job_runner::{JobResult, JobRunner};
pub use step_runner::{OutputSink, RunOutput, RunRequest, StepRunner};
