// StepPlan: flattens the resolved step tree into the order the job driver
// executes it. Pure; no I/O.

use std::collections::VecDeque;

use crate::step::{Step, StepStage};

/// One stage of one step, as scheduled.
#[derive(Debug, Clone)]
pub struct PlannedUnit<'a> {
    pub step: &'a Step,
    /// Qualified id (`parent/child` inside composites).
    pub step_id: String,
    pub stage: StepStage,
    /// Qualified ids of the enclosing composites, outermost first. A
    /// composite's own hooks run inside its scope, so its path ends with itself.
    pub scope_path: Vec<String>,
}

/// A scheduled composite step.
#[derive(Debug, Clone)]
pub struct CompositeFrame<'a> {
    pub step: &'a Step,
    pub step_id: String,
    /// Composites enclosing this one, outermost first.
    pub parent_path: Vec<String>,
    /// Qualified ids of the direct children, in declared order.
    pub children: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ExecutionPlan<'a> {
    pub pre_queue: VecDeque<PlannedUnit<'a>>,
    pub main_queue: VecDeque<PlannedUnit<'a>>,
    /// Last pushed pops first.
    pub post_stack: Vec<PlannedUnit<'a>>,
    /// Steps whose condition was false; none of their hooks or children are
    /// scheduled.
    pub skipped: Vec<PlannedUnit<'a>>,
    /// Composites in declared order, parents before children.
    pub composites: Vec<CompositeFrame<'a>>,
}

impl<'a> ExecutionPlan<'a> {
    pub fn build(steps: &'a [Step]) -> Self {
        let mut plan = ExecutionPlan::default();
        plan.flatten(steps, None, &[]);
        plan
    }

    pub fn composite(&self, step_id: &str) -> Option<&CompositeFrame<'a>> {
        self.composites.iter().find(|c| c.step_id == step_id)
    }

    /// Post units in the order they will run.
    pub fn post_order(&self) -> impl Iterator<Item = &PlannedUnit<'a>> {
        self.post_stack.iter().rev()
    }

    fn flatten(&mut self, steps: &'a [Step], parent_id: Option<&str>, scope_path: &[String]) {
        for step in steps {
            let step_id = match parent_id {
                Some(parent) => format!("{parent}/{}", step.id),
                None => step.id.clone(),
            };

            if !step.condition {
                self.skipped.push(unit(step, &step_id, StepStage::Main, scope_path.to_vec()));
                continue;
            }

            // a composite's hooks run inside its own scope
            let hook_path = if step.is_composite() {
                let mut path = scope_path.to_vec();
                path.push(step_id.clone());
                path
            } else {
                scope_path.to_vec()
            };

            if step.pre().is_some() {
                self.pre_queue
                    .push_back(unit(step, &step_id, StepStage::Pre, hook_path.clone()));
            }
            if step.post().is_some() {
                self.post_stack
                    .push(unit(step, &step_id, StepStage::Post, hook_path.clone()));
            }

            if step.is_composite() {
                self.composites.push(CompositeFrame {
                    step,
                    step_id: step_id.clone(),
                    parent_path: scope_path.to_vec(),
                    children: step
                        .children
                        .iter()
                        .map(|child| format!("{step_id}/{}", child.id))
                        .collect(),
                });
                self.flatten(&step.children, Some(&step_id), &hook_path);
            } else if step.main_runnable().is_some() {
                self.main_queue
                    .push_back(unit(step, &step_id, StepStage::Main, scope_path.to_vec()));
            }
        }
    }
}

fn unit<'a>(step: &'a Step, step_id: &str, stage: StepStage, scope_path: Vec<String>) -> PlannedUnit<'a> {
    PlannedUnit {
        step,
        step_id: step_id.to_string(),
        stage,
        scope_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_manager::{ActionKind, ResolvedAction};
    use crate::step::{Hook, HookCondition, Runnable, StepKind};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn hook(name: &str) -> Hook {
        Hook {
            runnable: Runnable::Command {
                program: name.to_string(),
                args: vec![],
            },
            condition: HookCondition::Always,
        }
    }

    fn action(kind: ActionKind, pre: bool, post: bool) -> Arc<ResolvedAction> {
        Arc::new(ResolvedAction {
            name: None,
            kind,
            main: (kind != ActionKind::Composite).then(|| Runnable::Command {
                program: "main".to_string(),
                args: vec![],
            }),
            pre: pre.then(|| hook("pre")),
            post: post.then(|| hook("post")),
            inputs: BTreeMap::new(),
            steps: vec![],
            outputs: BTreeMap::new(),
        })
    }

    fn uses(id: &str, pre: bool, post: bool) -> Step {
        Step {
            kind: StepKind::UsesCommand,
            run: None,
            action: Some(action(ActionKind::Command, pre, post)),
            ..Step::script(id, "")
        }
    }

    fn composite(id: &str, post: bool, children: Vec<Step>) -> Step {
        Step {
            kind: StepKind::UsesComposite,
            run: None,
            action: Some(action(ActionKind::Composite, false, post)),
            children,
            ..Step::script(id, "")
        }
    }

    #[test]
    fn post_hooks_unwind_in_reverse_across_nesting() {
        let steps = vec![
            uses("A", false, true),
            composite("B", false, vec![uses("B1", false, true), uses("B2", false, true)]),
        ];
        let plan = ExecutionPlan::build(&steps);

        let order: Vec<_> = plan.post_order().map(|u| u.step_id.as_str()).collect();
        assert_eq!(order, ["B/B2", "B/B1", "A"]);

        let mains: Vec<_> = plan.main_queue.iter().map(|u| u.step_id.as_str()).collect();
        assert_eq!(mains, ["A", "B/B1", "B/B2"]);
        assert_eq!(plan.main_queue[1].scope_path, vec!["B".to_string()]);
    }

    #[test]
    fn parent_hooks_bracket_children() {
        let mut parent = composite("P", true, vec![uses("c", true, true)]);
        parent.action = Some(Arc::new(ResolvedAction {
            pre: Some(hook("setup")),
            ..(*action(ActionKind::Composite, false, true)).clone()
        }));
        let steps = vec![parent];
        let plan = ExecutionPlan::build(&steps);

        let pres: Vec<_> = plan.pre_queue.iter().map(|u| u.step_id.as_str()).collect();
        assert_eq!(pres, ["P", "P/c"]);
        let posts: Vec<_> = plan.post_order().map(|u| u.step_id.as_str()).collect();
        assert_eq!(posts, ["P/c", "P"]);

        // the composite's own hooks run inside its scope
        assert_eq!(plan.pre_queue[0].scope_path, vec!["P".to_string()]);
        assert_eq!(plan.composite("P").unwrap().children, vec!["P/c".to_string()]);
    }

    #[test]
    fn false_condition_schedules_nothing() {
        let mut skipped = composite("S", true, vec![uses("inner", true, true)]);
        skipped.condition = false;
        let steps = vec![skipped, uses("after", true, false)];
        let plan = ExecutionPlan::build(&steps);

        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].step_id, "S");
        assert!(plan.composite("S").is_none());
        let pres: Vec<_> = plan.pre_queue.iter().map(|u| u.step_id.as_str()).collect();
        assert_eq!(pres, ["after"]);
        assert!(plan.post_stack.is_empty());
    }

    #[test]
    fn nested_composites_qualify_ids() {
        let steps = vec![composite(
            "outer",
            false,
            vec![composite("inner", false, vec![Step::script("leaf", "true")])],
        )];
        let plan = ExecutionPlan::build(&steps);

        assert_eq!(plan.main_queue.len(), 1);
        assert_eq!(plan.main_queue[0].step_id, "outer/inner/leaf");
        assert_eq!(
            plan.main_queue[0].scope_path,
            vec!["outer".to_string(), "outer/inner".to_string()]
        );
        let frames: Vec<_> = plan.composites.iter().map(|c| c.step_id.as_str()).collect();
        assert_eq!(frames, ["outer", "outer/inner"]);
        assert_eq!(plan.composites[1].parent_path, vec!["outer".to_string()]);
    }
}
