//! Handing a paused session to a person, and picking it back up.

use std::fs::{self, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::session::SessionState;
use crate::types::{Complexity, FieldDescriptor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ReviewReason {
    AccessDenied { selector: String },
    /// The queue ran dry short of the thresholds, or auto-submit is off.
    Incomplete,
    CycleBudgetExhausted,
    DeadlineExceeded,
    SubmitFailed { message: String },
}

impl ReviewReason {
    /// Field the reviewer is asked about, if the pause is about one field.
    pub fn selector(&self) -> Option<&str> {
        match self {
            Self::AccessDenied { selector } => Some(selector),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub reason: ReviewReason,
    pub field: Option<FieldDescriptor>,
    pub urgency: Urgency,
    pub form_completion: f64,
    pub screenshot: Option<PathBuf>,
    pub snapshot: Option<PathBuf>,
    pub suggested_actions: Vec<String>,
}

impl ReviewRequest {
    pub fn new(reason: ReviewReason, state: &SessionState) -> Self {
        let field = reason
            .selector()
            .and_then(|s| {
                state
                    .failed
                    .iter()
                    .chain(state.skipped.iter())
                    .find(|f| f.selector == s)
            })
            .cloned();
        let complexity = state
            .current
            .as_ref()
            .and_then(|c| c.verdict.as_ref())
            .map(|v| v.complexity);
        let urgency = assess_urgency(
            &reason,
            field.as_ref(),
            state.form_completion,
            state.retry_count,
            complexity,
        );
        Self {
            suggested_actions: suggestions(&reason),
            reason,
            field,
            urgency,
            form_completion: state.form_completion,
            screenshot: None,
            snapshot: None,
        }
    }
}

/// A nearly finished form blocked on a required field is the most pressing case.
pub fn assess_urgency(
    reason: &ReviewReason,
    field: Option<&FieldDescriptor>,
    form_completion: f64,
    retry_count: u32,
    complexity: Option<Complexity>,
) -> Urgency {
    let required = field.is_some_and(|f| f.required);
    if (required && form_completion > 0.8) || matches!(reason, ReviewReason::SubmitFailed { .. }) {
        Urgency::Critical
    } else if retry_count > 2 || matches!(reason, ReviewReason::DeadlineExceeded) {
        Urgency::High
    } else if required || complexity.is_some_and(|c| c >= Complexity::Complex) {
        Urgency::Medium
    } else {
        Urgency::Low
    }
}

fn suggestions(reason: &ReviewReason) -> Vec<String> {
    let lines: &[&str] = match reason {
        ReviewReason::AccessDenied { .. } => &[
            "fill the field by hand and resume with its value",
            "skip the field if it is optional",
        ],
        ReviewReason::Incomplete => &[
            "check skipped and failed fields",
            "submit manually if the form looks complete",
        ],
        ReviewReason::CycleBudgetExhausted => &[
            "check whether the page keeps revealing new fields",
            "resume to run another pass",
        ],
        ReviewReason::DeadlineExceeded => &["resume to continue where the session stopped"],
        ReviewReason::SubmitFailed { .. } => &[
            "locate the submit button and click it manually",
            "check for validation messages on the page",
        ],
    };
    lines.iter().map(|s| s.to_string()).collect()
}

/// What the reviewer decided about the paused field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "value", rename_all = "snake_case")]
pub enum HumanDecision {
    Fill(String),
    Skip,
    Retry,
}

pub fn snapshot_path(dir: &Path, started: &str) -> PathBuf {
    dir.join(format!("session-{started}.json"))
}

pub fn save_snapshot(path: &Path, state: &SessionState) -> Result<(), AgentError> {
    let persist = |source| AgentError::Persist {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(persist)?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(persist)?;
    serde_json::to_writer_pretty(file, state)?;
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<SessionState, AgentError> {
    let file = fs::File::open(path).map_err(|source| AgentError::Persist {
        path: path.to_path_buf(),
        source,
    })?;
    let state = serde_json::from_reader(BufReader::new(file))?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Bucket;

    #[test]
    fn required_field_on_nearly_done_form_is_critical() {
        let field = FieldDescriptor {
            selector: "#ssn".into(),
            required: true,
            ..Default::default()
        };
        let reason = ReviewReason::AccessDenied {
            selector: "#ssn".into(),
        };
        assert_eq!(
            assess_urgency(&reason, Some(&field), 0.85, 0, None),
            Urgency::Critical
        );
        assert_eq!(
            assess_urgency(&reason, Some(&field), 0.5, 0, None),
            Urgency::Medium
        );
        assert_eq!(
            assess_urgency(&ReviewReason::Incomplete, None, 0.5, 0, None),
            Urgency::Low
        );
        assert_eq!(
            assess_urgency(&ReviewReason::Incomplete, None, 0.5, 0, Some(Complexity::Expert)),
            Urgency::Medium
        );
    }

    #[test]
    fn request_points_at_the_escalated_field() {
        let mut state = SessionState::new("https://jobs.example.com");
        state.enqueue(vec![FieldDescriptor {
            selector: "#ssn".into(),
            ..Default::default()
        }]);
        state.begin_next();
        state.settle(Bucket::Failed);
        let request = ReviewRequest::new(
            ReviewReason::AccessDenied {
                selector: "#ssn".into(),
            },
            &state,
        );
        assert_eq!(request.field.map(|f| f.selector), Some("#ssn".to_string()));
        assert!(!request.suggested_actions.is_empty());
    }

    #[test]
    fn snapshot_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(dir.path(), "20261018T101500");
        let mut state = SessionState::new("https://jobs.example.com/apply");
        state.enqueue(vec![FieldDescriptor {
            selector: "#email".into(),
            required: true,
            ..Default::default()
        }]);
        state.escalation = Some(ReviewReason::DeadlineExceeded);

        save_snapshot(&path, &state).unwrap();
        let restored = load_snapshot(&path).unwrap();
        assert_eq!(restored.url, state.url);
        assert_eq!(restored.field_queue.len(), 1);
        assert_eq!(restored.observed, 1);
        assert_eq!(restored.escalation, Some(ReviewReason::DeadlineExceeded));
    }

    #[test]
    fn decisions_read_from_json() {
        let fill: HumanDecision =
            serde_json::from_str(r#"{"decision":"fill","value":"123-45-6789"}"#).unwrap();
        assert_eq!(fill, HumanDecision::Fill("123-45-6789".into()));
        let skip: HumanDecision = serde_json::from_str(r#"{"decision":"skip"}"#).unwrap();
        assert_eq!(skip, HumanDecision::Skip);
    }
}
