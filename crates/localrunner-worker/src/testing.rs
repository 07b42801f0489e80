// In-memory StepRunner for engine tests. Each (step, stage) gets a scripted
// behavior that may print lines and write file-command files before it
// finishes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use tokio_util::sync::CancellationToken;

use crate::step::StepStage;
use crate::step_runner::{OutputSink, RunOutput, RunRequest, StepRunner};

pub enum Outcome {
    Exit(i32),
    Error(String),
    /// Wait until cancelled, then report exit code 130.
    Hang,
    Panic,
}

pub struct Behavior {
    pub lines: Vec<String>,
    pub writes: Vec<(&'static str, String)>,
    pub outcome: Outcome,
}

impl Behavior {
    pub fn exit(code: i32) -> Self {
        Self {
            lines: Vec::new(),
            writes: Vec::new(),
            outcome: Outcome::Exit(code),
        }
    }

    pub fn hang() -> Self {
        Self {
            lines: Vec::new(),
            writes: Vec::new(),
            outcome: Outcome::Hang,
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            lines: Vec::new(),
            writes: Vec::new(),
            outcome: Outcome::Error(message.to_string()),
        }
    }

    pub fn panic() -> Self {
        Self {
            lines: Vec::new(),
            writes: Vec::new(),
            outcome: Outcome::Panic,
        }
    }

    /// Print `line` before finishing.
    pub fn print(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    /// Append `content` to the file named by the well-known variable `file`.
    pub fn write(mut self, file: &'static str, content: impl Into<String>) -> Self {
        self.writes.push((file, content.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub step_id: String,
    pub stage: StepStage,
    pub environment: BTreeMap<String, String>,
    pub inputs: BTreeMap<String, String>,
}

impl Invocation {
    /// `id` for main units, `id:pre` / `id:post` for hooks.
    pub fn label(&self) -> String {
        match self.stage {
            StepStage::Main => self.step_id.clone(),
            stage => format!("{}:{stage}", self.step_id),
        }
    }
}

type Script = Box<dyn Fn(&RunRequest) -> Behavior + Send + Sync>;

#[derive(Default)]
pub struct ScriptedStepRunner {
    scripts: HashMap<(String, StepStage), Script>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedStepRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, step_id: &str, stage: StepStage, script: F) -> Self
    where
        F: Fn(&RunRequest) -> Behavior + Send + Sync + 'static,
    {
        self.scripts.insert((step_id.to_string(), stage), Box::new(script));
        self
    }

    pub fn on_main<F>(self, step_id: &str, script: F) -> Self
    where
        F: Fn(&RunRequest) -> Behavior + Send + Sync + 'static,
    {
        self.on(step_id, StepStage::Main, script)
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    /// Labels of every unit that ran, in order.
    pub fn labels(&self) -> Vec<String> {
        self.invocations.lock().iter().map(Invocation::label).collect()
    }

    pub fn invocation(&self, label: &str) -> Option<Invocation> {
        self.invocations.lock().iter().find(|i| i.label() == label).cloned()
    }
}

#[async_trait]
impl StepRunner for ScriptedStepRunner {
    async fn run(
        &self,
        request: &RunRequest,
        output: OutputSink,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunOutput> {
        self.invocations.lock().push(Invocation {
            step_id: request.step_id.clone(),
            stage: request.stage,
            environment: request.environment.clone(),
            inputs: request.inputs.clone(),
        });

        let behavior = match self.scripts.get(&(request.step_id.clone(), request.stage)) {
            Some(script) => script(request),
            None => Behavior::exit(0),
        };

        for line in &behavior.lines {
            output.line(line.clone());
        }

        for (file, content) in &behavior.writes {
            let path = request
                .environment
                .get(*file)
                .ok_or_else(|| anyhow::anyhow!("{file} is not set"))?;
            let mut handle = OpenOptions::new().append(true).open(path)?;
            handle.write_all(content.as_bytes())?;
        }

        match behavior.outcome {
            Outcome::Exit(code) => Ok(RunOutput::exit(code)),
            Outcome::Error(message) => Err(anyhow::anyhow!(message)),
            Outcome::Hang => {
                cancel.cancelled().await;
                Ok(RunOutput::exit(130))
            }
            Outcome::Panic => panic!("scripted runner panicked"),
        }
    }
}
