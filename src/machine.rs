//! The orchestration state machine as a plain table, free of I/O.

use serde::{Deserialize, Serialize};

use crate::gate::GateDecision;
use crate::types::FillStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PageAnalysis,
    FieldAnalysis,
    SimpleFill,
    RagFill,
    OptionFill,
    SkipRouting,
    Validation,
    CompletionCheck,
    SubmitForm,
    HumanReview,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::SubmitForm | Self::HumanReview)
    }
}

/// What a phase reports when it is done; the table turns it into the next phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKey {
    Scanned,
    Strategy(FillStrategy),
    Filled,
    /// Same field again, with a repair plan attached.
    Retry,
    Advance,
    QueueExhausted,
    Gate(GateDecision),
    /// Stop and hand over to a human (access denied, deadline, cycle budget).
    Escalate,
}

pub fn transition(phase: Phase, key: RouteKey) -> Option<Phase> {
    use Phase::*;
    use RouteKey::*;

    let next = match (phase, key) {
        (SubmitForm | HumanReview, _) => return None,
        (_, Escalate) => HumanReview,

        (PageAnalysis, Scanned) => FieldAnalysis,

        (FieldAnalysis, Strategy(FillStrategy::SimpleMapping)) => SimpleFill,
        (FieldAnalysis, Strategy(FillStrategy::RagGeneration)) => RagFill,
        (FieldAnalysis, Strategy(FillStrategy::OptionSelection)) => OptionFill,
        (FieldAnalysis, Strategy(FillStrategy::SkipField)) => SkipRouting,
        (FieldAnalysis, QueueExhausted) => CompletionCheck,

        (SkipRouting, Advance) => FieldAnalysis,

        (SimpleFill | RagFill | OptionFill, Filled) => Validation,

        (Validation, Retry | Advance) => FieldAnalysis,
        (Validation, QueueExhausted) => CompletionCheck,

        (CompletionCheck, Gate(GateDecision::ReadyForSubmit)) => SubmitForm,
        (CompletionCheck, Gate(GateDecision::Continue)) => FieldAnalysis,
        (CompletionCheck, Gate(GateDecision::Escalate)) => HumanReview,

        _ => return None,
    };
    Some(next)
}
