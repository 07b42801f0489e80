// ExecutionContext: the per-job store of scoped environment, search path,
// step results, outputs, saved state and summaries, plus the job's log.
//
// Scopes form an arena indexed by `ScopeId`. The job's top-level scope is
// created with the context; each composite invocation gets a child scope
// seeded from a snapshot of its parent.

use std::collections::{BTreeMap, HashSet};
use tokio_util::sync::CancellationToken;

use localrunner_common::constants::{PATH_LIST_SEPARATOR, PATH_VARIABLE};
use localrunner_common::{ActionResult, ResultUtil, SecretMasker};

use crate::errors::ContextError;
use crate::file_command_manager::FileCommandUpdates;
use crate::step::StepStage;
use crate::steps_context::{StepKey, StepResult, StepsContext};

/// Handle to a scope of an `ExecutionContext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

impl ScopeId {
    pub const ROOT: ScopeId = ScopeId(0);
}

/// An environment-file update waiting to be promoted to the parent scope.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Promotion {
    Env(String, String),
    Path(Vec<String>),
}

#[derive(Debug, Clone, Default)]
struct Scope {
    parent: Option<ScopeId>,
    env: BTreeMap<String, String>,
    /// Highest precedence first.
    path_prepend: Vec<String>,
    inputs: BTreeMap<String, String>,
    journal: Vec<Promotion>,
    closed: bool,
}

impl Scope {
    fn set_env(&mut self, key: &str, value: &str) {
        self.env.insert(key.to_string(), value.to_string());
        self.journal.push(Promotion::Env(key.to_string(), value.to_string()));
    }

    fn prepend_path(&mut self, entries: &[String]) {
        self.path_prepend = merge_path(entries, &self.path_prepend);
        self.journal.push(Promotion::Path(entries.to_vec()));
    }
}

/// `entries` in order, followed by the existing entries they do not repeat.
fn merge_path(entries: &[String], existing: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(entries.len() + existing.len());
    for entry in entries.iter().chain(existing) {
        if !merged.contains(entry) {
            merged.push(entry.clone());
        }
    }
    merged
}

pub struct ExecutionContext {
    display_name: String,
    scopes: Vec<Scope>,
    steps: StepsContext,
    outputs: BTreeMap<String, BTreeMap<String, String>>,
    state: BTreeMap<String, BTreeMap<String, String>>,
    summaries: Vec<String>,
    /// Steps declared inside a composite.
    nested: HashSet<String>,
    cancel_token: CancellationToken,
    secret_masker: SecretMasker,
    write_debug: bool,
    log_lines: Vec<String>,
}

impl ExecutionContext {
    /// Create the job context with `env` as the top-level environment.
    pub fn new(
        env: BTreeMap<String, String>,
        cancel_token: CancellationToken,
        secret_masker: SecretMasker,
        write_debug: bool,
    ) -> Self {
        let root = Scope {
            env,
            ..Default::default()
        };
        Self {
            display_name: "job".to_string(),
            scopes: vec![root],
            steps: StepsContext::new(),
            outputs: BTreeMap::new(),
            state: BTreeMap::new(),
            summaries: Vec::new(),
            nested: HashSet::new(),
            cancel_token,
            secret_masker,
            write_debug,
            log_lines: Vec::new(),
        }
    }

    // -- scopes ---------------------------------------------------------------

    /// Open a child scope of `parent`.
    ///
    /// The child starts from a snapshot of the parent's env, path and inputs;
    /// `env` and `inputs` are layered on top and are never promoted.
    pub fn new_scope(
        &mut self,
        parent: ScopeId,
        env: &BTreeMap<String, String>,
        inputs: &BTreeMap<String, String>,
    ) -> Result<ScopeId, ContextError> {
        let parent_scope = self.scope(parent)?;
        let mut child = Scope {
            parent: Some(parent),
            env: parent_scope.env.clone(),
            path_prepend: parent_scope.path_prepend.clone(),
            inputs: parent_scope.inputs.clone(),
            ..Default::default()
        };
        child.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        child.inputs.extend(inputs.iter().map(|(k, v)| (k.clone(), v.clone())));

        self.scopes.push(child);
        Ok(ScopeId(self.scopes.len() - 1))
    }

    /// Close a child scope and promote its environment-file updates into the
    /// parent, where they are journaled again for the next level up.
    pub fn leave_scope(&mut self, id: ScopeId) -> Result<(), ContextError> {
        let scope = self.scope_mut(id)?;
        let Some(parent) = scope.parent else {
            return Ok(());
        };
        if scope.closed {
            return Ok(());
        }
        scope.closed = true;
        let journal = std::mem::take(&mut scope.journal);

        let parent = self.scope_mut(parent)?;
        for promotion in journal {
            match promotion {
                Promotion::Env(key, value) => parent.set_env(&key, &value),
                Promotion::Path(entries) => parent.prepend_path(&entries),
            }
        }
        Ok(())
    }

    /// Apply parsed env, path and output updates of `step_id` to the scope
    /// that ran it.
    pub fn merge_from_step_output(
        &mut self,
        scope: ScopeId,
        step_id: &str,
        updates: &FileCommandUpdates,
    ) -> Result<(), ContextError> {
        let target = self.scope_mut(scope)?;
        for (key, value) in &updates.env {
            target.set_env(key, value);
        }
        if !updates.path.is_empty() {
            target.prepend_path(&updates.path);
        }

        if !updates.outputs.is_empty() {
            self.outputs
                .entry(step_id.to_string())
                .or_default()
                .extend(updates.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        for (key, value) in &updates.env {
            self.debug(&format!("{key}={value}"));
        }
        for entry in &updates.path {
            self.debug(&format!("Prepend path: {entry}"));
        }
        Ok(())
    }

    pub fn env(&self, scope: ScopeId) -> Result<&BTreeMap<String, String>, ContextError> {
        Ok(&self.scope(scope)?.env)
    }

    pub fn path_prepend(&self, scope: ScopeId) -> Result<&[String], ContextError> {
        Ok(&self.scope(scope)?.path_prepend)
    }

    pub fn inputs(&self, scope: ScopeId) -> Result<&BTreeMap<String, String>, ContextError> {
        Ok(&self.scope(scope)?.inputs)
    }

    /// Value for the search-path variable of a process started in `scope`:
    /// the scope's prepends ahead of `base`.
    pub fn search_path(&self, scope: ScopeId, base: Option<&str>) -> Result<String, ContextError> {
        let scope = self.scope(scope)?;
        let base = scope
            .env
            .get(PATH_VARIABLE)
            .map(String::as_str)
            .or(base)
            .unwrap_or_default();

        let mut entries: Vec<&str> = scope.path_prepend.iter().map(String::as_str).collect();
        if !base.is_empty() {
            entries.push(base);
        }
        Ok(entries.join(PATH_LIST_SEPARATOR))
    }

    fn scope(&self, id: ScopeId) -> Result<&Scope, ContextError> {
        self.scopes.get(id.0).ok_or(ContextError::UnknownScope(id.0))
    }

    fn scope_mut(&mut self, id: ScopeId) -> Result<&mut Scope, ContextError> {
        self.scopes.get_mut(id.0).ok_or(ContextError::UnknownScope(id.0))
    }

    // -- results, outputs, state ------------------------------------------------

    pub fn record_result(&mut self, key: StepKey, result: StepResult) -> Result<(), ContextError> {
        self.steps.record(key, result)
    }

    pub fn steps(&self) -> &StepsContext {
        &self.steps
    }

    /// Mark `step_id` as a child of a composite.
    pub fn mark_nested(&mut self, step_id: &str) {
        self.nested.insert(step_id.to_string());
    }

    /// Outputs recorded for `step_id`, or empty.
    pub fn outputs_of(&self, step_id: &str) -> BTreeMap<String, String> {
        self.outputs.get(step_id).cloned().unwrap_or_default()
    }

    pub fn set_outputs(&mut self, step_id: &str, outputs: BTreeMap<String, String>) {
        self.outputs.insert(step_id.to_string(), outputs);
    }

    pub fn save_state(&mut self, step_id: &str, state: &BTreeMap<String, String>) {
        if state.is_empty() {
            return;
        }
        self.state
            .entry(step_id.to_string())
            .or_default()
            .extend(state.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    pub fn state_of(&self, step_id: &str) -> Option<&BTreeMap<String, String>> {
        self.state.get(step_id)
    }

    pub fn append_summary(&mut self, markdown: &str) {
        self.summaries.push(markdown.to_string());
    }

    /// Job summary: every step summary in execution order.
    pub fn summary(&self) -> String {
        self.summaries.join("\n")
    }

    /// Status the `success()`/`failure()`/`cancelled()` hook conditions see.
    ///
    /// Main results of steps inside a composite are left out; the composite's
    /// own result stands for them. Hooks count at every depth.
    pub fn job_status(&self) -> ActionResult {
        let status = ResultUtil::fold_conclusions(
            self.steps
                .iter()
                .filter(|(key, _)| key.stage != StepStage::Main || !self.nested.contains(&key.step_id))
                .map(|(_, r)| r.conclusion),
        );
        if status != ActionResult::Failure && self.is_cancelled() {
            ActionResult::Cancelled
        } else {
            status
        }
    }

    // -- cancellation -----------------------------------------------------------

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    // -- logging -----------------------------------------------------------------

    pub fn secret_masker(&self) -> &SecretMasker {
        &self.secret_masker
    }

    pub fn set_display_name(&mut self, display_name: impl Into<String>) {
        self.display_name = display_name.into();
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn write(&mut self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        tracing::info!(target: "step", "[{}] {}", self.display_name, masked);
        self.log_lines.push(masked);
    }

    /// Recorded only when step debug is on.
    pub fn debug(&mut self, message: &str) {
        if self.write_debug {
            let masked = self.secret_masker.mask_secrets(message);
            tracing::debug!(target: "step", "[{}] {}", self.display_name, masked);
            self.log_lines.push(format!("##[debug]{masked}"));
        }
    }

    pub fn warning(&mut self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        tracing::warn!(target: "step", "[{}] {}", self.display_name, masked);
        self.log_lines.push(format!("##[warning]{masked}"));
    }

    pub fn error(&mut self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        tracing::error!(target: "step", "[{}] {}", self.display_name, masked);
        self.log_lines.push(format!("##[error]{masked}"));
    }

    pub fn section(&mut self, message: &str) {
        let masked = self.secret_masker.mask_secrets(message);
        tracing::info!(target: "step", "[{}] >> {}", self.display_name, masked);
        self.log_lines.push(format!("##[group]{masked}"));
    }

    pub fn end_section(&mut self) {
        self.log_lines.push("##[endgroup]".to_string());
    }

    pub fn log_lines(&self) -> &[String] {
        &self.log_lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_command_manager::{parse_key_value_file, parse_path_file};

    fn context() -> ExecutionContext {
        let env = [("JOB".to_string(), "1".to_string())].into_iter().collect();
        ExecutionContext::new(env, CancellationToken::new(), SecretMasker::new(), true)
    }

    fn updates(env: &[(&str, &str)], path: &[&str]) -> FileCommandUpdates {
        FileCommandUpdates {
            env: env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            path: path.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn child_scope_inherits_snapshot() {
        let mut ctx = context();
        ctx.merge_from_step_output(ScopeId::ROOT, "a", &updates(&[("A", "1")], &["/a"]))
            .unwrap();

        let child = ctx
            .new_scope(ScopeId::ROOT, &BTreeMap::new(), &BTreeMap::new())
            .unwrap();
        ctx.merge_from_step_output(ScopeId::ROOT, "b", &updates(&[("LATER", "x")], &[]))
            .unwrap();

        assert_eq!(ctx.env(child).unwrap()["A"], "1");
        assert_eq!(ctx.env(child).unwrap()["JOB"], "1");
        assert!(!ctx.env(child).unwrap().contains_key("LATER"));
        assert_eq!(ctx.path_prepend(child).unwrap(), ["/a".to_string()]);
    }

    #[test]
    fn child_writes_stay_local_until_left() {
        let mut ctx = context();
        let own_env = [("OWN".to_string(), "composite".to_string())].into_iter().collect();
        let inputs = [("who".to_string(), "me".to_string())].into_iter().collect();
        let child = ctx.new_scope(ScopeId::ROOT, &own_env, &inputs).unwrap();

        ctx.merge_from_step_output(child, "c", &updates(&[("FROM_CHILD", "v")], &["/child"]))
            .unwrap();
        assert!(!ctx.env(ScopeId::ROOT).unwrap().contains_key("FROM_CHILD"));
        assert!(ctx.path_prepend(ScopeId::ROOT).unwrap().is_empty());
        assert_eq!(ctx.inputs(child).unwrap()["who"], "me");

        ctx.leave_scope(child).unwrap();
        let root = ctx.env(ScopeId::ROOT).unwrap();
        assert_eq!(root["FROM_CHILD"], "v");
        assert!(!root.contains_key("OWN"));
        assert_eq!(ctx.path_prepend(ScopeId::ROOT).unwrap(), ["/child".to_string()]);

        // leaving twice promotes nothing more
        ctx.leave_scope(child).unwrap();
        assert_eq!(ctx.path_prepend(ScopeId::ROOT).unwrap().len(), 1);
    }

    #[test]
    fn promotion_chains_through_nested_scopes() {
        let mut ctx = context();
        let outer = ctx.new_scope(ScopeId::ROOT, &BTreeMap::new(), &BTreeMap::new()).unwrap();
        let inner = ctx.new_scope(outer, &BTreeMap::new(), &BTreeMap::new()).unwrap();

        ctx.merge_from_step_output(inner, "x", &updates(&[("DEEP", "1")], &[])).unwrap();
        ctx.leave_scope(inner).unwrap();
        assert_eq!(ctx.env(outer).unwrap()["DEEP"], "1");
        assert!(!ctx.env(ScopeId::ROOT).unwrap().contains_key("DEEP"));

        ctx.leave_scope(outer).unwrap();
        assert_eq!(ctx.env(ScopeId::ROOT).unwrap()["DEEP"], "1");
    }

    #[test]
    fn earlier_path_entries_take_precedence() {
        let mut ctx = context();
        ctx.merge_from_step_output(ScopeId::ROOT, "a", &updates(&[], &["/old"])).unwrap();
        ctx.merge_from_step_output(ScopeId::ROOT, "b", &updates(&[], &["/first", "/second"]))
            .unwrap();

        assert_eq!(
            ctx.search_path(ScopeId::ROOT, Some("/usr/bin")).unwrap(),
            ["/first", "/second", "/old", "/usr/bin"].join(PATH_LIST_SEPARATOR)
        );
    }

    #[test]
    fn reapplying_the_same_files_is_idempotent() {
        let env_file = "A=1\nB<<EOF\nx\nEOF\n";
        let path_file = "/tools\n/more\n";
        let apply = |ctx: &mut ExecutionContext| {
            let update = FileCommandUpdates {
                env: parse_key_value_file("GITHUB_ENV", env_file).unwrap().into_iter().collect(),
                path: parse_path_file(path_file),
                ..Default::default()
            };
            ctx.merge_from_step_output(ScopeId::ROOT, "s", &update).unwrap();
        };

        let mut ctx = context();
        apply(&mut ctx);
        let env_once = ctx.env(ScopeId::ROOT).unwrap().clone();
        let path_once = ctx.path_prepend(ScopeId::ROOT).unwrap().to_vec();
        apply(&mut ctx);

        assert_eq!(ctx.env(ScopeId::ROOT).unwrap(), &env_once);
        assert_eq!(ctx.path_prepend(ScopeId::ROOT).unwrap(), path_once.as_slice());
    }

    #[test]
    fn outputs_accumulate_per_step() {
        let mut ctx = context();
        let mut first = FileCommandUpdates::default();
        first.outputs.insert("a".to_string(), "1".to_string());
        let mut second = FileCommandUpdates::default();
        second.outputs.insert("b".to_string(), "2".to_string());

        ctx.merge_from_step_output(ScopeId::ROOT, "s", &first).unwrap();
        ctx.merge_from_step_output(ScopeId::ROOT, "s", &second).unwrap();

        let outputs = ctx.outputs_of("s");
        assert_eq!(outputs.len(), 2);
        assert!(ctx.outputs_of("unknown").is_empty());
    }

    #[test]
    fn unknown_scope_is_an_error() {
        let mut ctx = context();
        let err = ctx.leave_scope(ScopeId(7)).unwrap_err();
        assert_eq!(err, ContextError::UnknownScope(7));
    }

    #[test]
    fn job_status_reflects_conclusions_and_cancellation() {
        let mut ctx = context();
        assert_eq!(ctx.job_status(), ActionResult::Success);

        ctx.record_result(
            StepKey::main("a"),
            StepResult::new(ActionResult::Failure, ActionResult::Success),
        )
        .unwrap();
        assert_eq!(ctx.job_status(), ActionResult::Success);

        ctx.cancel_token().cancel();
        assert_eq!(ctx.job_status(), ActionResult::Cancelled);

        ctx.record_result(
            StepKey::main("b"),
            StepResult::new(ActionResult::Failure, ActionResult::Failure),
        )
        .unwrap();
        assert_eq!(ctx.job_status(), ActionResult::Failure);
    }

    #[test]
    fn nested_main_results_are_represented_by_their_composite() {
        let mut ctx = context();
        ctx.mark_nested("wrap/boom");
        ctx.mark_nested("wrap/cleanup");
        ctx.record_result(
            StepKey::main("wrap/boom"),
            StepResult::new(ActionResult::Failure, ActionResult::Failure),
        )
        .unwrap();
        assert_eq!(ctx.job_status(), ActionResult::Success);

        ctx.record_result(
            StepKey::new("wrap/cleanup", StepStage::Post),
            StepResult::new(ActionResult::Failure, ActionResult::Failure),
        )
        .unwrap();
        assert_eq!(ctx.job_status(), ActionResult::Failure);
    }

    #[test]
    fn only_marked_children_are_left_out_of_the_status() {
        let mut ctx = context();
        ctx.mark_nested("wrap/child");
        ctx.record_result(
            StepKey::main("build/test"),
            StepResult::new(ActionResult::Failure, ActionResult::Failure),
        )
        .unwrap();
        assert_eq!(ctx.job_status(), ActionResult::Failure);
    }

    #[test]
    fn log_lines_are_masked() {
        let mut ctx = context();
        ctx.secret_masker().add_value("s3cr3t");
        ctx.write("token is s3cr3t");
        ctx.warning("again s3cr3t");
        ctx.debug("debug s3cr3t");

        assert_eq!(
            ctx.log_lines(),
            [
                "token is ***".to_string(),
                "##[warning]again ***".to_string(),
                "##[debug]debug ***".to_string(),
            ]
        );
    }
}
