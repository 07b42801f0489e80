// ActionManager: resolves `uses:` references through an `ActionResolver` and
// builds the step tree the engine runs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use localrunner_common::constants::COMPOSITE_ACTIONS_MAX_DEPTH;

use crate::errors::ResolverError;
use crate::step::{Hook, InputValue, Runnable, Step, StepKind};

/// The kind of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Command,
    Container,
    Composite,
}

/// Where a composite output takes its value from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMapping {
    /// Id of the child step, relative to the composite.
    pub step: String,
    /// Name of the child's output.
    pub output: String,
}

/// An action as returned by a resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResolvedAction {
    #[serde(default)]
    pub name: Option<String>,
    pub kind: ActionKind,
    /// Required for command and container actions.
    #[serde(default)]
    pub main: Option<Runnable>,
    #[serde(default)]
    pub pre: Option<Hook>,
    #[serde(default)]
    pub post: Option<Hook>,
    /// Default values of declared inputs.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
    /// Child steps of a composite action.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputMapping>,
}

/// An unresolved step as it appears in a job document or composite action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StepDefinition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Pre-evaluated condition.
    #[serde(default = "default_condition", rename = "if")]
    pub condition: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub with: BTreeMap<String, InputValue>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub uses: Option<String>,
}

fn default_condition() -> bool {
    true
}

impl Default for StepDefinition {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            condition: default_condition(),
            continue_on_error: false,
            timeout_minutes: None,
            env: BTreeMap::new(),
            with: BTreeMap::new(),
            run: None,
            shell: None,
            working_directory: None,
            uses: None,
        }
    }
}

/// Resolves an action reference to its declared entrypoints.
///
/// Implementations that fetch remote actions are expected to do so before the
/// job starts; resolution itself is synchronous.
pub trait ActionResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Result<Arc<ResolvedAction>, ResolverError>;
}

/// A resolver backed by a fixed registry of actions.
#[derive(Debug, Clone, Default)]
pub struct InMemoryActionResolver {
    actions: HashMap<String, Arc<ResolvedAction>>,
}

impl InMemoryActionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, reference: impl Into<String>, action: ResolvedAction) {
        self.actions.insert(reference.into(), Arc::new(action));
    }

    pub fn with_action(mut self, reference: impl Into<String>, action: ResolvedAction) -> Self {
        self.register(reference, action);
        self
    }
}

impl FromIterator<(String, ResolvedAction)> for InMemoryActionResolver {
    fn from_iter<T: IntoIterator<Item = (String, ResolvedAction)>>(iter: T) -> Self {
        Self {
            actions: iter.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
        }
    }
}

impl ActionResolver for InMemoryActionResolver {
    fn resolve(&self, reference: &str) -> Result<Arc<ResolvedAction>, ResolverError> {
        self.actions
            .get(reference)
            .cloned()
            .ok_or_else(|| ResolverError::UnknownAction(reference.to_string()))
    }
}

/// Builds resolved step trees, caching each reference once per job.
pub struct ActionManager<'r> {
    resolver: &'r dyn ActionResolver,
    cache: HashMap<String, Arc<ResolvedAction>>,
}

impl<'r> ActionManager<'r> {
    pub fn new(resolver: &'r dyn ActionResolver) -> Self {
        Self {
            resolver,
            cache: HashMap::new(),
        }
    }

    /// Resolve a list of top-level step definitions.
    ///
    /// Fails on the first unknown reference, cycle or composite nested deeper
    /// than `COMPOSITE_ACTIONS_MAX_DEPTH`.
    pub fn resolve_steps(&mut self, definitions: &[StepDefinition]) -> Result<Vec<Step>, ResolverError> {
        let mut chain = Vec::new();
        self.resolve_list(definitions, &mut chain)
    }

    fn resolve_list(
        &mut self,
        definitions: &[StepDefinition],
        chain: &mut Vec<String>,
    ) -> Result<Vec<Step>, ResolverError> {
        let mut seen = HashSet::new();
        let mut steps = Vec::with_capacity(definitions.len());

        for (index, definition) in definitions.iter().enumerate() {
            let step = self.resolve_step(definition, index, chain)?;
            if !seen.insert(step.id.clone()) {
                return Err(ResolverError::DuplicateStepId(step.id));
            }
            steps.push(step);
        }

        Ok(steps)
    }

    fn resolve_step(
        &mut self,
        definition: &StepDefinition,
        index: usize,
        chain: &mut Vec<String>,
    ) -> Result<Step, ResolverError> {
        let id = definition
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("__{index}"));
        // `/` joins a composite's id to its children's
        if id.contains('/') {
            return Err(ResolverError::InvalidStepId(id));
        }

        let mut step = Step {
            display_name: definition.name.clone().unwrap_or_else(|| id.clone()),
            id,
            kind: StepKind::Run,
            condition: definition.condition,
            continue_on_error: definition.continue_on_error,
            timeout_minutes: definition.timeout_minutes,
            env: definition.env.clone(),
            inputs: definition.with.clone(),
            run: None,
            action: None,
            children: Vec::new(),
        };

        match (&definition.run, &definition.uses) {
            (Some(script), None) => {
                step.run = Some(Runnable::Script {
                    script: script.clone(),
                    shell: definition.shell.clone(),
                    working_directory: definition.working_directory.clone(),
                });
                if definition.name.is_none() {
                    step.display_name = format!("Run {}", script.lines().next().unwrap_or_default());
                }
            }
            (None, Some(reference)) => {
                let action = self.lookup(reference)?;

                let mut inputs = action.inputs.clone();
                inputs.extend(definition.with.clone());
                step.inputs = inputs;

                if definition.name.is_none() {
                    step.display_name = format!("Run {reference}");
                }

                step.kind = match action.kind {
                    ActionKind::Command | ActionKind::Container if action.main.is_none() => {
                        return Err(ResolverError::MissingMain(reference.clone()));
                    }
                    ActionKind::Command => StepKind::UsesCommand,
                    ActionKind::Container => StepKind::UsesContainer,
                    ActionKind::Composite => {
                        if chain.iter().any(|r| r == reference) {
                            let mut cycle = chain.clone();
                            cycle.push(reference.clone());
                            return Err(ResolverError::Cycle {
                                reference: reference.clone(),
                                chain: cycle.join(" -> "),
                            });
                        }
                        if chain.len() as u32 >= COMPOSITE_ACTIONS_MAX_DEPTH {
                            return Err(ResolverError::DepthExceeded {
                                reference: reference.clone(),
                                max: COMPOSITE_ACTIONS_MAX_DEPTH,
                            });
                        }

                        chain.push(reference.clone());
                        let children = self.resolve_list(&action.steps, chain);
                        chain.pop();
                        step.children = children?;
                        StepKind::UsesComposite
                    }
                };
                step.action = Some(action);
            }
            _ => return Err(ResolverError::InvalidStep(step.id)),
        }

        Ok(step)
    }

    fn lookup(&mut self, reference: &str) -> Result<Arc<ResolvedAction>, ResolverError> {
        if let Some(action) = self.cache.get(reference) {
            return Ok(Arc::clone(action));
        }

        let action = self.resolver.resolve(reference)?;
        tracing::debug!(target: "action_manager", reference, kind = ?action.kind, "resolved action");
        self.cache.insert(reference.to_string(), Arc::clone(&action));
        Ok(action)
    }
}
