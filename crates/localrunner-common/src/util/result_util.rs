// Result folding and process return codes.

use crate::action_result::ActionResult;

/// Offset added to result values to produce process return codes.
const RETURN_CODE_OFFSET: i32 = 100;

pub struct ResultUtil;

impl ResultUtil {
    /// Translate a job conclusion into the process return code.
    pub fn translate_to_return_code(result: ActionResult) -> i32 {
        RETURN_CODE_OFFSET + (result as i32)
    }

    /// Translate a process return code back into a result.
    ///
    /// Returns `ActionResult::Failure` for unrecognized codes.
    pub fn translate_from_return_code(return_code: i32) -> ActionResult {
        match return_code - RETURN_CODE_OFFSET {
            0 => ActionResult::Success,
            2 => ActionResult::Cancelled,
            3 => ActionResult::Skipped,
            _ => ActionResult::Failure,
        }
    }

    /// Fold one more conclusion into a running job conclusion.
    ///
    /// Precedence: `Failure` over `Cancelled` over everything else. `Skipped`
    /// never makes a job unsuccessful.
    pub fn merge_conclusions(current: Option<ActionResult>, coming: ActionResult) -> ActionResult {
        let current = current.unwrap_or(ActionResult::Success);
        match (current, coming) {
            (ActionResult::Failure, _) | (_, ActionResult::Failure) => ActionResult::Failure,
            (ActionResult::Cancelled, _) | (_, ActionResult::Cancelled) => ActionResult::Cancelled,
            _ => ActionResult::Success,
        }
    }

    /// Fold a whole sequence of conclusions.
    pub fn fold_conclusions<I>(conclusions: I) -> ActionResult
    where
        I: IntoIterator<Item = ActionResult>,
    {
        conclusions
            .into_iter()
            .fold(ActionResult::Success, |acc, c| Self::merge_conclusions(Some(acc), c))
    }
}
