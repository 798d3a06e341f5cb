use tracing::debug;

use crate::types::{Action, ActionKind, FailureKind, FieldDescriptor, RepairKind, RepairPlan};

const ALTERNATIVE_SETTLE_MS: u64 = 1000;
const STABILITY_WAIT_MS: u64 = 3000;

/// Decides how to recover from a failed fill.
///
/// A pure function of the failure kind and the retry count; the descriptor is
/// only read to derive alternative selectors. `AccessDenied` escalates at once,
/// the first retry swaps selectors, the second waits for the page to settle,
/// later retries keep waiting with decaying confidence, and once the budget
/// is spent the field is skipped.
pub fn repair(
    descriptor: &FieldDescriptor,
    error_kind: FailureKind,
    retry_count: u32,
    max_retries: u32,
) -> RepairPlan {
    let plan = if error_kind == FailureKind::AccessDenied {
        RepairPlan {
            kind: RepairKind::Escalate,
            confidence: 1.0,
            actions: Vec::new(),
        }
    } else if retry_count >= max_retries {
        RepairPlan {
            kind: RepairKind::SkipField,
            confidence: 1.0,
            actions: Vec::new(),
        }
    } else if retry_count == 0 {
        let kind = target_kind(descriptor);
        let mut actions = vec![Action::wait(ALTERNATIVE_SETTLE_MS)];
        actions.extend(
            alternative_selectors(descriptor)
                .into_iter()
                .map(|selector| Action::new(kind, selector, None)),
        );
        actions.push(Action::new(kind, descriptor.selector.clone(), None));
        RepairPlan {
            kind: RepairKind::AlternativeSelectors,
            confidence: 0.8,
            actions,
        }
    } else {
        // 0.6 on the first wait, then 0.5, 0.4, ... which drops below the apply threshold.
        let confidence = 0.6 - 0.1 * f64::from(retry_count - 1);
        RepairPlan {
            kind: RepairKind::WaitAndRetry,
            confidence,
            actions: vec![
                Action::wait(STABILITY_WAIT_MS),
                Action::new(target_kind(descriptor), descriptor.selector.clone(), None),
            ],
        }
    };
    debug!(
        selector = %descriptor.selector,
        error = ?error_kind,
        retry_count,
        plan = ?plan.kind,
        confidence = plan.confidence,
        "repair planned"
    );
    plan
}

fn target_kind(descriptor: &FieldDescriptor) -> ActionKind {
    if descriptor.is_choice() {
        ActionKind::Select
    } else {
        ActionKind::Type
    }
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Other ways to address the same element, derived from its stable attributes.
pub fn alternative_selectors(descriptor: &FieldDescriptor) -> Vec<String> {
    let tag = if descriptor.tag.is_empty() {
        "*".to_string()
    } else {
        descriptor.tag.to_ascii_lowercase()
    };
    let mut candidates = Vec::new();
    if let Some(id) = descriptor.attr("id").filter(|v| !v.trim().is_empty()) {
        candidates.push(format!("[id=\"{}\"]", quote(id)));
    }
    if let Some(name) = descriptor.attr("name").filter(|v| !v.trim().is_empty()) {
        candidates.push(format!("{tag}[name=\"{}\"]", quote(name)));
    }
    if !descriptor.placeholder.trim().is_empty() {
        candidates.push(format!(
            "{tag}[placeholder=\"{}\"]",
            quote(&descriptor.placeholder)
        ));
    }
    if let Some(aria) = descriptor.attr("aria-label").filter(|v| !v.trim().is_empty()) {
        candidates.push(format!("{tag}[aria-label=\"{}\"]", quote(aria)));
    }
    candidates.retain(|c| c != &descriptor.selector);
    candidates.dedup();
    candidates
}
