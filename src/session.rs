use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::gate::{GateReport, Tally};
use crate::machine::Phase;
use crate::review::ReviewReason;
use crate::types::{
    ActionOutcome, FailureKind, FieldDescriptor, FieldVerdict, FinalState, PageContext,
    RepairKind, RepairPlan,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Completed,
    Failed,
    Skipped,
}

/// The field currently being worked on, between leaving the queue and landing in a bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentField {
    pub descriptor: FieldDescriptor,
    pub verdict: Option<FieldVerdict>,
    /// Value of the first attempt, reused by every repair.
    #[serde(default)]
    pub value: Option<String>,
    pub pending_repair: Option<RepairPlan>,
    pub last_outcome: Option<ActionOutcome>,
}

impl CurrentField {
    pub fn new(descriptor: FieldDescriptor) -> Self {
        Self {
            descriptor,
            verdict: None,
            value: None,
            pending_repair: None,
            last_outcome: None,
        }
    }
}

/// What re-matching a rescanned page changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rebound {
    /// Known fields now addressed by a different selector.
    pub moved: usize,
    /// Completed fields found empty again and put back in the queue.
    pub reopened: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairRecord {
    pub selector: String,
    pub error: FailureKind,
    pub retry_count: u32,
    pub kind: RepairKind,
    pub confidence: f64,
}

/// Everything one application session knows. Mutated only by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub url: String,
    pub phase: Phase,
    pub context: PageContext,
    pub submit_selector: Option<String>,
    pub field_queue: VecDeque<FieldDescriptor>,
    pub current: Option<CurrentField>,
    pub completed: Vec<FieldDescriptor>,
    pub failed: Vec<FieldDescriptor>,
    pub skipped: Vec<FieldDescriptor>,
    /// Fields ever enqueued; the denominator of form completion.
    pub observed: usize,
    seen: BTreeSet<String>,
    pub cycle_count: u32,
    /// Repair attempts spent on the current field.
    pub retry_count: u32,
    pub form_completion: f64,
    pub last_gate: Option<GateReport>,
    pub repairs: Vec<RepairRecord>,
    pub escalation: Option<ReviewReason>,
    pub final_state: FinalState,
}

impl SessionState {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            phase: Phase::PageAnalysis,
            context: PageContext::default(),
            submit_selector: None,
            field_queue: VecDeque::new(),
            current: None,
            completed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            observed: 0,
            seen: BTreeSet::new(),
            cycle_count: 0,
            retry_count: 0,
            form_completion: 0.0,
            last_gate: None,
            repairs: Vec::new(),
            escalation: None,
            final_state: FinalState::Running,
        }
    }

    /// Queues fields not seen before this session, required ones first.
    /// Returns how many were added.
    pub fn enqueue(&mut self, fields: Vec<FieldDescriptor>) -> usize {
        let mut fresh: Vec<_> = fields
            .into_iter()
            .filter(|f| self.seen.insert(f.selector.clone()))
            .collect();
        fresh.sort_by_key(|f| !f.required);
        let added = fresh.len();
        self.observed += added;
        self.field_queue.extend(fresh);
        added
    }

    /// Pulls the next field into `current`. False when the queue is empty.
    pub fn begin_next(&mut self) -> bool {
        match self.field_queue.pop_front() {
            Some(descriptor) => {
                self.current = Some(CurrentField::new(descriptor));
                self.retry_count = 0;
                true
            }
            None => false,
        }
    }

    /// Commits the current field to a bucket. Returns it for logging.
    pub fn settle(&mut self, bucket: Bucket) -> Option<FieldDescriptor> {
        let current = self.current.take()?;
        self.retry_count = 0;
        let descriptor = current.descriptor;
        match bucket {
            Bucket::Completed => self.completed.push(descriptor.clone()),
            Bucket::Failed => self.failed.push(descriptor.clone()),
            Bucket::Skipped => self.skipped.push(descriptor.clone()),
        }
        Some(descriptor)
    }

    /// Takes a settled field back out of its bucket.
    pub fn reclaim(&mut self, selector: &str) -> Option<(Bucket, FieldDescriptor)> {
        for (bucket, list) in [
            (Bucket::Completed, &mut self.completed),
            (Bucket::Failed, &mut self.failed),
            (Bucket::Skipped, &mut self.skipped),
        ] {
            if let Some(pos) = list.iter().position(|f| f.selector == selector) {
                return Some((bucket, list.remove(pos)));
            }
        }
        None
    }

    /// Matches known fields to a fresh scan of a possibly reloaded page.
    ///
    /// Fields are paired by `FieldDescriptor::identity`; an identity shared by
    /// several fresh fields is ambiguous and left alone. Paired fields take the
    /// fresh selector, and completed fields whose fresh value is empty go back
    /// to the front of the queue.
    pub fn rebind(&mut self, fresh: &[FieldDescriptor]) -> Rebound {
        let mut by_identity: BTreeMap<String, Vec<&FieldDescriptor>> = BTreeMap::new();
        for field in fresh {
            by_identity.entry(field.identity()).or_default().push(field);
        }
        let lookup = |known: &FieldDescriptor| match by_identity.get(&known.identity()) {
            Some(found) if found.len() == 1 => Some(found[0]),
            _ => None,
        };

        let mut moved: BTreeMap<String, String> = BTreeMap::new();
        let known = self
            .field_queue
            .iter_mut()
            .chain(self.current.as_mut().map(|c| &mut c.descriptor))
            .chain(self.completed.iter_mut())
            .chain(self.failed.iter_mut())
            .chain(self.skipped.iter_mut());
        for descriptor in known {
            if let Some(now) = lookup(descriptor)
                && now.selector != descriptor.selector
            {
                moved.insert(descriptor.selector.clone(), now.selector.clone());
                descriptor.selector = now.selector.clone();
            }
        }

        if !moved.is_empty() {
            let rename = |selector: String| moved.get(&selector).cloned().unwrap_or(selector);
            self.seen = std::mem::take(&mut self.seen).into_iter().map(rename).collect();
            for record in &mut self.repairs {
                record.selector = rename(std::mem::take(&mut record.selector));
            }
            if let Some(ReviewReason::AccessDenied { selector }) = self.escalation.as_mut() {
                *selector = rename(std::mem::take(selector));
            }
        }

        let (emptied, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.completed)
            .into_iter()
            .partition(|f| lookup(f).is_some_and(|now| now.current_value.trim().is_empty()));
        self.completed = kept;
        let reopened = emptied.len();
        for field in emptied.into_iter().rev() {
            self.field_queue.push_front(field);
        }

        Rebound {
            moved: moved.len(),
            reopened,
        }
    }

    pub fn bucket_of(&self, selector: &str) -> Option<Bucket> {
        let has = |list: &[FieldDescriptor]| list.iter().any(|f| f.selector == selector);
        if has(&self.completed) {
            Some(Bucket::Completed)
        } else if has(&self.failed) {
            Some(Bucket::Failed)
        } else if has(&self.skipped) {
            Some(Bucket::Skipped)
        } else {
            None
        }
    }

    pub fn tally(&self) -> Tally {
        Tally {
            observed: self.observed,
            completed: self.completed.len(),
            failed: self.failed.len(),
            queued: self.field_queue.len(),
        }
    }

    pub fn completed_labels(&self) -> Vec<String> {
        self.completed
            .iter()
            .map(|f| f.display_name().to_string())
            .collect()
    }

    pub fn current_descriptor(&self) -> Option<&FieldDescriptor> {
        self.current.as_ref().map(|c| &c.descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(selector: &str, required: bool) -> FieldDescriptor {
        FieldDescriptor {
            selector: selector.into(),
            required,
            ..Default::default()
        }
    }

    #[test]
    fn enqueue_puts_required_first_and_ignores_repeats() {
        let mut state = SessionState::new("https://example.com");
        let added = state.enqueue(vec![field("#a", false), field("#b", true), field("#c", false)]);
        assert_eq!(added, 3);
        let order: Vec<_> = state.field_queue.iter().map(|f| f.selector.as_str()).collect();
        assert_eq!(order, vec!["#b", "#a", "#c"]);

        assert_eq!(state.enqueue(vec![field("#a", false), field("#d", false)]), 1);
        assert_eq!(state.observed, 4);
    }

    #[test]
    fn settled_fields_land_in_exactly_one_bucket() {
        let mut state = SessionState::new("u");
        state.enqueue(vec![field("#a", true), field("#b", true), field("#c", true)]);
        for bucket in [Bucket::Completed, Bucket::Failed, Bucket::Skipped] {
            assert!(state.begin_next());
            state.retry_count = 2;
            state.settle(bucket);
            assert_eq!(state.retry_count, 0);
        }
        assert!(!state.begin_next());
        assert_eq!(state.bucket_of("#a"), Some(Bucket::Completed));
        assert_eq!(state.bucket_of("#b"), Some(Bucket::Failed));
        assert_eq!(state.bucket_of("#c"), Some(Bucket::Skipped));
        assert_eq!(state.tally().completed, 1);
    }

    #[test]
    fn reclaim_removes_from_bucket() {
        let mut state = SessionState::new("u");
        state.enqueue(vec![field("#a", true)]);
        state.begin_next();
        state.settle(Bucket::Failed);
        let (bucket, descriptor) = state.reclaim("#a").unwrap();
        assert_eq!(bucket, Bucket::Failed);
        assert_eq!(descriptor.selector, "#a");
        assert_eq!(state.bucket_of("#a"), None);
    }

    fn named(selector: &str, name: &str, value: &str) -> FieldDescriptor {
        let mut field = field(selector, true);
        field.attributes.insert("name".into(), name.into());
        field.current_value = value.into();
        field
    }

    #[test]
    fn rebind_follows_fields_to_their_new_selectors() {
        let mut state = SessionState::new("u");
        state.enqueue(vec![named("#f0", "first", ""), named("#f1", "email", ""), named("#f2", "phone", "")]);
        for bucket in [Bucket::Completed, Bucket::Failed] {
            state.begin_next();
            state.settle(bucket);
        }
        state.escalation = Some(ReviewReason::AccessDenied {
            selector: "#f1".into(),
        });

        // Reloaded page: fresh tags, and the first answer is gone.
        let rebound = state.rebind(&[
            named("#f5", "phone", ""),
            named("#f3", "first", ""),
            named("#f4", "email", ""),
        ]);

        assert_eq!(rebound, Rebound { moved: 3, reopened: 1 });
        assert_eq!(state.bucket_of("#f4"), Some(Bucket::Failed));
        assert_eq!(
            state.escalation,
            Some(ReviewReason::AccessDenied {
                selector: "#f4".into()
            })
        );
        let queue: Vec<_> = state.field_queue.iter().map(|f| f.selector.as_str()).collect();
        assert_eq!(queue, vec!["#f3", "#f5"]);
        assert!(state.completed.is_empty());
        // Known fields are not enqueued a second time.
        assert_eq!(state.enqueue(vec![named("#f3", "first", "")]), 0);
        assert_eq!(state.observed, 3);
    }

    #[test]
    fn rebind_keeps_filled_fields_and_skips_ambiguous_matches() {
        let mut state = SessionState::new("u");
        state.enqueue(vec![named("#a", "first", ""), field("#b", true)]);
        state.begin_next();
        state.settle(Bucket::Completed);

        let rebound = state.rebind(&[
            named("#a", "first", "Timothy"),
            field("#x", true),
            field("#y", true),
        ]);

        assert_eq!(rebound, Rebound::default());
        assert_eq!(state.bucket_of("#a"), Some(Bucket::Completed));
        assert_eq!(state.field_queue[0].selector, "#b");
    }
}
