// StepsContext: write-once record of step results, keyed by step and stage.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use localrunner_common::ActionResult;

use crate::errors::ContextError;
use crate::step::StepStage;

/// Recorded result of one unit (a main step or one of its hooks).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    /// Result before `continue-on-error` adjustment.
    pub outcome: ActionResult,

    /// Result after `continue-on-error` adjustment.
    pub conclusion: ActionResult,

    pub outputs: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn new(outcome: ActionResult, conclusion: ActionResult) -> Self {
        Self {
            outcome,
            conclusion,
            outputs: BTreeMap::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn skipped() -> Self {
        Self::new(ActionResult::Skipped, ActionResult::Skipped)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_outputs(mut self, outputs: BTreeMap<String, String>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn timed(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self.finished_at = Some(Utc::now());
        self
    }
}

/// Key of a recorded result.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepKey {
    pub step_id: String,
    pub stage: StepStage,
}

impl StepKey {
    pub fn new(step_id: impl Into<String>, stage: StepStage) -> Self {
        Self {
            step_id: step_id.into(),
            stage,
        }
    }

    pub fn main(step_id: impl Into<String>) -> Self {
        Self::new(step_id, StepStage::Main)
    }
}

/// Results of every unit that finished, in recording order.
#[derive(Debug, Clone, Default)]
pub struct StepsContext {
    results: BTreeMap<StepKey, StepResult>,
    order: Vec<StepKey>,
}

impl StepsContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a result. Each key may be recorded once.
    pub fn record(&mut self, key: StepKey, result: StepResult) -> Result<(), ContextError> {
        if self.results.contains_key(&key) {
            return Err(ContextError::AlreadyRecorded(describe(&key)));
        }
        self.order.push(key.clone());
        self.results.insert(key, result);
        Ok(())
    }

    pub fn get(&self, key: &StepKey) -> Option<&StepResult> {
        self.results.get(key)
    }

    /// Result of a step's main stage.
    pub fn main(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(&StepKey::main(step_id))
    }

    pub fn has_result(&self, key: &StepKey) -> bool {
        self.results.contains_key(key)
    }

    /// Results in the order they were recorded.
    pub fn iter(&self) -> impl Iterator<Item = (&StepKey, &StepResult)> {
        self.order.iter().filter_map(|key| self.results.get(key).map(|r| (key, r)))
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

fn describe(key: &StepKey) -> String {
    match key.stage {
        StepStage::Main => key.step_id.clone(),
        stage => format!("{} ({stage})", key.step_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_are_write_once() {
        let mut ctx = StepsContext::new();
        ctx.record(StepKey::main("build"), StepResult::new(ActionResult::Success, ActionResult::Success))
            .unwrap();

        let err = ctx
            .record(StepKey::main("build"), StepResult::skipped())
            .unwrap_err();
        assert_eq!(err, ContextError::AlreadyRecorded("build".to_string()));
        assert_eq!(ctx.main("build").unwrap().outcome, ActionResult::Success);
    }

    #[test]
    fn stages_are_recorded_separately() {
        let mut ctx = StepsContext::new();
        ctx.record(StepKey::new("a", StepStage::Post), StepResult::skipped()).unwrap();
        ctx.record(StepKey::main("a"), StepResult::skipped()).unwrap();

        let err = ctx
            .record(StepKey::new("a", StepStage::Post), StepResult::skipped())
            .unwrap_err();
        assert_eq!(err, ContextError::AlreadyRecorded("a (post)".to_string()));

        let order: Vec<_> = ctx.iter().map(|(k, _)| k.stage).collect();
        assert_eq!(order, vec![StepStage::Post, StepStage::Main]);
    }

    #[test]
    fn serializes_lowercase_results() {
        let result = StepResult::new(ActionResult::Failure, ActionResult::Success)
            .with_error("Process completed with exit code 1.");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "failure");
        assert_eq!(json["conclusion"], "success");
        assert_eq!(json["error"], "Process completed with exit code 1.");
        assert!(json.get("started_at").is_none());
    }
}
