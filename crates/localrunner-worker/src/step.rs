// Step model: the resolved, read-only tree the engine executes.
//
// Steps and the action entrypoints they reference are built once by the
// `ActionManager` and only read afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::action_manager::ResolvedAction;

/// What a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Run,
    UsesCommand,
    UsesContainer,
    UsesComposite,
}

/// The stage of a step a unit of work belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStage {
    Pre,
    Main,
    Post,
}

impl fmt::Display for StepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStage::Pre => "pre",
            StepStage::Main => "main",
            StepStage::Post => "post",
        };
        f.write_str(s)
    }
}

/// Something a `StepRunner` can execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "using", rename_all = "lowercase")]
pub enum Runnable {
    /// A script run through a shell.
    Script {
        script: String,
        #[serde(default)]
        shell: Option<String>,
        #[serde(default, rename = "working-directory")]
        working_directory: Option<String>,
    },
    /// A program invoked directly.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A container image run to completion.
    Container {
        image: String,
        #[serde(default)]
        entrypoint: Option<String>,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Runnable {
    /// One-line description for logs.
    pub fn describe(&self) -> String {
        match self {
            Runnable::Script { script, .. } => {
                let first = script.lines().next().unwrap_or_default();
                format!("run: {first}")
            }
            Runnable::Command { program, args } if args.is_empty() => program.clone(),
            Runnable::Command { program, args } => format!("{program} {}", args.join(" ")),
            Runnable::Container { image, .. } => format!("docker://{image}"),
        }
    }
}

/// Status function guarding a pre or post hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookCondition {
    #[default]
    Always,
    Success,
    Failure,
    Cancelled,
}

/// A pre or post entrypoint of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    #[serde(flatten)]
    pub runnable: Runnable,
    #[serde(default, rename = "if")]
    pub condition: HookCondition,
}

/// A typed input value. Crosses into a step process only as a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl InputValue {
    /// The one canonical stringification applied at the step boundary.
    pub fn to_boundary_string(&self) -> String {
        match self {
            InputValue::Bool(b) => b.to_string(),
            InputValue::Integer(i) => i.to_string(),
            InputValue::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
                format!("{}", *f as i64)
            }
            // Display for f64 is the shortest representation that round-trips
            InputValue::Float(f) => f.to_string(),
            InputValue::String(s) => s.clone(),
        }
    }
}

impl From<&str> for InputValue {
    fn from(value: &str) -> Self {
        InputValue::String(value.to_string())
    }
}

impl From<bool> for InputValue {
    fn from(value: bool) -> Self {
        InputValue::Bool(value)
    }
}

/// A resolved step.
#[derive(Debug, Clone)]
pub struct Step {
    /// Id unique among its siblings.
    pub id: String,
    pub display_name: String,
    pub kind: StepKind,
    /// Pre-evaluated `if:`.
    pub condition: bool,
    pub continue_on_error: bool,
    pub timeout_minutes: Option<u32>,
    /// Step-level `env:`, local to this step (and, for composites, its children).
    pub env: BTreeMap<String, String>,
    pub inputs: BTreeMap<String, InputValue>,
    /// Body of a `run:` step.
    pub run: Option<Runnable>,
    /// Action used by a `uses:` step.
    pub action: Option<Arc<ResolvedAction>>,
    /// Children of a composite step, in declared order.
    pub children: Vec<Step>,
}

impl Step {
    /// A `run:` step with default settings.
    pub fn script(id: impl Into<String>, script: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            kind: StepKind::Run,
            condition: true,
            continue_on_error: false,
            timeout_minutes: None,
            env: BTreeMap::new(),
            inputs: BTreeMap::new(),
            run: Some(Runnable::Script {
                script: script.into(),
                shell: None,
                working_directory: None,
            }),
            action: None,
            children: Vec::new(),
        }
    }

    pub fn is_composite(&self) -> bool {
        self.kind == StepKind::UsesComposite
    }

    /// The runnable of the main stage, if the step has one of its own.
    pub fn main_runnable(&self) -> Option<&Runnable> {
        match self.kind {
            StepKind::Run => self.run.as_ref(),
            StepKind::UsesCommand | StepKind::UsesContainer => {
                self.action.as_ref().and_then(|a| a.main.as_ref())
            }
            StepKind::UsesComposite => None,
        }
    }

    pub fn pre(&self) -> Option<&Hook> {
        self.action.as_ref().and_then(|a| a.pre.as_ref())
    }

    pub fn post(&self) -> Option<&Hook> {
        self.action.as_ref().and_then(|a| a.post.as_ref())
    }

    pub fn hook(&self, stage: StepStage) -> Option<&Hook> {
        match stage {
            StepStage::Pre => self.pre(),
            StepStage::Post => self.post(),
            StepStage::Main => None,
        }
    }
}
