use serde::{Deserialize, Serialize};

use crate::config::GateThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Continue,
    ReadyForSubmit,
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    pub form_completion: f64,
    pub success_rate: f64,
    pub decision: GateDecision,
}

/// Bucket counts the gate needs; everything else about the session is irrelevant to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub observed: usize,
    pub completed: usize,
    pub failed: usize,
    pub queued: usize,
}

impl Tally {
    /// Completed share of every field observed, one unit per field.
    pub fn form_completion(&self) -> f64 {
        if self.observed == 0 {
            0.0
        } else {
            self.completed as f64 / self.observed as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        let attempted = self.completed + self.failed;
        if attempted == 0 {
            0.0
        } else {
            self.completed as f64 / attempted as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionGate {
    thresholds: GateThresholds,
    auto_submit: bool,
}

impl CompletionGate {
    pub fn new(thresholds: GateThresholds, auto_submit: bool) -> Self {
        Self {
            thresholds,
            auto_submit,
        }
    }

    /// Whether the ratios alone would allow submission, ignoring the auto-submit switch.
    pub fn thresholds_met(&self, form_completion: f64, success_rate: f64) -> bool {
        form_completion >= self.thresholds.min_completion
            && success_rate >= self.thresholds.min_success_rate
    }

    pub fn decide(&self, form_completion: f64, success_rate: f64, queued: usize) -> GateDecision {
        if self.auto_submit && self.thresholds_met(form_completion, success_rate) {
            GateDecision::ReadyForSubmit
        } else if queued > 0 {
            GateDecision::Continue
        } else {
            GateDecision::Escalate
        }
    }

    pub fn evaluate(&self, tally: &Tally) -> GateReport {
        let form_completion = tally.form_completion();
        let success_rate = tally.success_rate();
        GateReport {
            form_completion,
            success_rate,
            decision: self.decide(form_completion, success_rate, tally.queued),
        }
    }
}
