// JobDefinition: a job document as loaded by the CLI. Steps are already
// resolved to pre-evaluated conditions; `actions` is the registry the
// in-memory resolver serves `uses:` references from.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::action_manager::{InMemoryActionResolver, ResolvedAction, StepDefinition};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobDefinition {
    #[serde(default)]
    pub name: Option<String>,
    /// Job-level environment; the top-level scope starts from it.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub steps: Vec<StepDefinition>,
    /// Action reference to action.
    #[serde(default)]
    pub actions: BTreeMap<String, ResolvedAction>,
}

impl JobDefinition {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse job document")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read job document {:?}", path))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid job document {:?}", path))
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("job")
    }

    pub fn resolver(&self) -> InMemoryActionResolver {
        self.actions
            .iter()
            .map(|(reference, action)| (reference.clone(), action.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_manager::{ActionKind, ActionResolver};
    use crate::step::{HookCondition, Runnable};

    const JOB: &str = r#"
name: build
env:
  GREETING: hello
steps:
  - id: checkout
    uses: ./checkout
  - run: echo $GREETING
actions:
  ./checkout:
    kind: command
    main:
      using: command
      program: git
      args: [status]
    post:
      using: script
      script: echo cleanup
      if: failure
"#;

    #[test]
    fn parses_steps_and_registry() {
        let job = JobDefinition::from_yaml(JOB).unwrap();
        assert_eq!(job.display_name(), "build");
        assert_eq!(job.env["GREETING"], "hello");
        assert_eq!(job.steps.len(), 2);

        let action = job.resolver().resolve("./checkout").unwrap();
        assert_eq!(action.kind, ActionKind::Command);
        assert_eq!(
            action.main,
            Some(Runnable::Command {
                program: "git".to_string(),
                args: vec!["status".to_string()],
            })
        );
        assert_eq!(action.post.as_ref().unwrap().condition, HookCondition::Failure);
    }

    #[test]
    fn load_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.yml");
        fs::write(&path, "steps: not-a-list").unwrap();

        let err = JobDefinition::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("job.yml"));
    }
}
