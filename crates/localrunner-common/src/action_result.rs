use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal state of a step, a hook, or a whole job.
///
/// Used both for the raw `outcome` of running something and for the
/// `conclusion` after continue-on-error has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionResult {
    Success = 0,
    Failure = 1,
    Cancelled = 2,
    Skipped = 3,
}

impl fmt::Display for ActionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_status_str())
    }
}

impl ActionResult {
    /// Returns `true` if the result represents a successful outcome.
    pub fn is_success(&self) -> bool {
        matches!(self, ActionResult::Success)
    }

    /// The lowercase status string used by `steps.<id>.outcome`.
    pub fn as_status_str(&self) -> &'static str {
        match self {
            ActionResult::Success => "success",
            ActionResult::Failure => "failure",
            ActionResult::Cancelled => "cancelled",
            ActionResult::Skipped => "skipped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ActionResult::Cancelled).unwrap(),
            "\"cancelled\""
        );
        let parsed: ActionResult = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(parsed, ActionResult::Skipped);
    }

    #[test]
    fn display_matches_status_string() {
        assert_eq!(ActionResult::Failure.to_string(), "failure");
        assert!(ActionResult::Success.is_success());
        assert!(!ActionResult::Skipped.is_success());
    }
}
