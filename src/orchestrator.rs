//! Drives one application session through the phase table.
//!
//! Each phase does its work, reports a `RouteKey`, and `machine::transition`
//! picks the next phase. The session owns its state outright; nothing is
//! shared with other sessions except the collaborators passed in.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::brain::{Drafter, Oracle};
use crate::classifier::{ClassificationEngine, ClassificationStats};
use crate::config::AgentConfig;
use crate::driver::BrowserDriver;
use crate::error::{AgentError, DriverError};
use crate::executor::FillExecutor;
use crate::gate::{CompletionGate, GateDecision};
use crate::journal::{self, Journal, JournalEvent};
use crate::machine::{Phase, RouteKey, transition};
use crate::profile::ProfileStore;
use crate::repair::repair;
use crate::review::{self, HumanDecision, ReviewReason, ReviewRequest};
use crate::session::{Bucket, CurrentField, Rebound, RepairRecord, SessionState};
use crate::types::{
    Action, ActionKind, FailureKind, FieldDescriptor, FinalState, MIN_REPAIR_CONFIDENCE,
    PageContext, PageSnapshot, RepairKind,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub url: String,
    pub final_state: FinalState,
    pub phase: Phase,
    pub form_completion: f64,
    pub success_rate: f64,
    pub observed: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub cycles: u32,
    pub repairs: Vec<RepairRecord>,
    pub review: Option<ReviewRequest>,
    pub classification: ClassificationStats,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct Orchestrator {
    config: AgentConfig,
    driver: Arc<dyn BrowserDriver>,
    classifier: ClassificationEngine,
    executor: FillExecutor,
    gate: CompletionGate,
    profile_available: bool,
    rag_available: bool,
    journal: Option<Journal>,
    session_id: String,
    last_state: Option<SessionState>,
}

impl Orchestrator {
    pub fn new(
        config: AgentConfig,
        driver: Arc<dyn BrowserDriver>,
        profile: ProfileStore,
        oracle: Option<Arc<dyn Oracle>>,
        drafter: Option<Arc<dyn Drafter>>,
    ) -> Self {
        let profile_available = !profile.is_empty();
        let rag_available = drafter.is_some();
        let executor = FillExecutor::new(
            driver.clone(),
            drafter,
            Arc::new(profile),
            Duration::from_millis(config.agent.action_delay_ms),
        );
        let gate = CompletionGate::new(config.gate, config.agent.auto_submit);
        Self {
            driver,
            classifier: ClassificationEngine::new(oracle),
            executor,
            gate,
            profile_available,
            rag_available,
            journal: None,
            session_id: String::new(),
            last_state: None,
            config,
        }
    }

    /// Runs a fresh session against the page the driver is on.
    ///
    /// Never fails: faults are reported through `SessionReport::final_state`.
    pub async fn run(&mut self, url: &str) -> SessionReport {
        self.classifier.reset();
        self.drive(SessionState::new(url), None).await
    }

    /// Continues a paused session after a reviewer decided about it.
    ///
    /// The page may have been reloaded since the pause, so it is rescanned and
    /// known fields are re-matched before the decision is applied.
    pub async fn resume(&mut self, state: SessionState, decision: HumanDecision) -> SessionReport {
        self.drive(state, Some(decision)).await
    }

    /// State of the last finished session, for persisting or resuming.
    pub fn take_state(&mut self) -> Option<SessionState> {
        self.last_state.take()
    }

    pub fn classification_stats(&self) -> &ClassificationStats {
        self.classifier.stats()
    }

    async fn drive(&mut self, mut state: SessionState, decision: Option<HumanDecision>) -> SessionReport {
        let started_at = Utc::now();
        self.session_id = started_at.format("%Y%m%dT%H%M%S%3f").to_string();
        self.open_journal();

        let span = info_span!("session", id = %self.session_id, url = %state.url);
        let result = self.play(&mut state, decision).instrument(span).await;

        let (review, error) = match result {
            Ok(review) => (review, None),
            Err(e) => {
                warn!(error = %e, phase = ?state.phase, "session aborted");
                state.final_state = FinalState::Error;
                (None, Some(e.to_string()))
            }
        };
        requeue_current(&mut state);

        let report = self.report(&state, review, error, started_at);
        info!(
            final_state = ?report.final_state,
            form_completion = report.form_completion,
            success_rate = report.success_rate,
            completed = report.completed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "session finished"
        );
        if self.journal.take().is_some() {
            let path = self
                .config
                .agent
                .artifacts_dir
                .join(format!("session-{}-summary.json", self.session_id));
            if let Err(e) = journal::write_summary(&path, &report) {
                warn!(error = %e, "could not write session summary");
            }
        }
        self.last_state = Some(state);
        report
    }

    async fn play(
        &mut self,
        state: &mut SessionState,
        decision: Option<HumanDecision>,
    ) -> Result<Option<ReviewRequest>, AgentError> {
        if let Some(decision) = decision {
            self.reattach(state).await?;
            self.apply_decision(state, decision).await?;
        }
        self.run_phases(state).await
    }

    async fn run_phases(&mut self, state: &mut SessionState) -> Result<Option<ReviewRequest>, AgentError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.agent.session_timeout_secs);
        let cycle_base = state.cycle_count;

        while !state.phase.is_terminal() {
            let key = if Instant::now() >= deadline {
                warn!(phase = ?state.phase, "session deadline passed");
                requeue_current(state);
                state.escalation = Some(ReviewReason::DeadlineExceeded);
                RouteKey::Escalate
            } else {
                self.step(state, cycle_base).await?
            };
            let phase = state.phase;
            let next = transition(phase, key).ok_or(AgentError::InvalidTransition { phase, key })?;
            debug!(from = ?phase, to = ?next, key = ?key, "transition");
            state.phase = next;
        }

        match state.phase {
            Phase::SubmitForm => self.submit(state).await,
            _ => Ok(Some(self.hand_over(state).await)),
        }
    }

    async fn step(&mut self, state: &mut SessionState, cycle_base: u32) -> Result<RouteKey, AgentError> {
        match state.phase {
            Phase::PageAnalysis => self.analyse_page(state).await,
            Phase::FieldAnalysis => Ok(self.analyse_field(state).await),
            Phase::SkipRouting => {
                self.settle(state, Bucket::Skipped, None);
                Ok(RouteKey::Advance)
            }
            Phase::SimpleFill | Phase::RagFill | Phase::OptionFill => self.fill(state).await,
            Phase::Validation => self.validate(state),
            Phase::CompletionCheck => self.check_completion(state, cycle_base).await,
            Phase::SubmitForm | Phase::HumanReview => {
                unreachable!("terminal phases are handled after the loop")
            }
        }
    }

    async fn analyse_page(&mut self, state: &mut SessionState) -> Result<RouteKey, AgentError> {
        let snapshot = self.scan().await?;
        let added = self.absorb(state, snapshot);
        info!(fields = added, title = %state.context.title, "page analysed");
        Ok(RouteKey::Scanned)
    }

    /// Snapshot with one retry after the page settles.
    async fn scan(&self) -> Result<PageSnapshot, DriverError> {
        match self.driver.snapshot().await {
            Ok(snapshot) => Ok(snapshot),
            Err(DriverError::Action(msg)) => {
                warn!(error = %msg, "scan failed, waiting for the page to settle");
                self.driver
                    .wait_for_stability(Duration::from_millis(self.config.browser.stability_timeout_ms))
                    .await?;
                self.driver.snapshot().await
            }
            Err(fatal) => Err(fatal),
        }
    }

    async fn reattach(&mut self, state: &mut SessionState) -> Result<(), AgentError> {
        let snapshot = match self.scan().await {
            Ok(snapshot) => snapshot,
            Err(DriverError::Action(msg)) => {
                warn!(error = %msg, "could not rescan before resuming");
                return Ok(());
            }
            Err(fatal) => return Err(fatal.into()),
        };
        let rebound = state.rebind(&snapshot.fields);
        if rebound != Rebound::default() {
            info!(moved = rebound.moved, reopened = rebound.reopened, "page changed since the pause");
        }
        self.absorb(state, snapshot);
        Ok(())
    }

    fn absorb(&mut self, state: &mut SessionState, snapshot: PageSnapshot) -> usize {
        state.context = snapshot.context;
        if snapshot.submit_selector.is_some() {
            state.submit_selector = snapshot.submit_selector;
        }
        let added = state.enqueue(snapshot.fields);
        self.note(JournalEvent::Scanned {
            url: state.context.url.clone(),
            added,
        });
        added
    }

    async fn analyse_field(&mut self, state: &mut SessionState) -> RouteKey {
        if state.current.is_none() && !state.begin_next() {
            return RouteKey::QueueExhausted;
        }
        let context = PageContext {
            user_profile_available: self.profile_available,
            rag_available: self.rag_available,
            completed_fields: state.completed_labels(),
            ..state.context.clone()
        };
        let Some(current) = state.current.as_mut() else {
            return RouteKey::QueueExhausted;
        };
        let verdict = self.classifier.classify(&current.descriptor, &context).await;
        let strategy = verdict.strategy;
        let event = JournalEvent::Classified {
            selector: current.descriptor.selector.clone(),
            strategy,
            confidence: verdict.confidence,
        };
        current.verdict = Some(verdict);
        self.note(event);
        RouteKey::Strategy(strategy)
    }

    async fn fill(&mut self, state: &mut SessionState) -> Result<RouteKey, AgentError> {
        let phase = state.phase;
        let missing = AgentError::InvalidTransition {
            phase,
            key: RouteKey::Filled,
        };
        let Some(current) = state.current.as_mut() else {
            return Err(missing);
        };
        let Some(verdict) = current.verdict.clone() else {
            return Err(missing);
        };
        let value = match current.value.clone() {
            Some(value) => value,
            None => match self.executor.resolve_value(&current.descriptor, &verdict).await {
                Ok(value) => {
                    current.value = Some(value.clone());
                    value
                }
                Err(outcome) => {
                    current.last_outcome = Some(outcome);
                    return Ok(RouteKey::Filled);
                }
            },
        };
        let outcome = match current.pending_repair.take() {
            Some(plan) => {
                self.executor
                    .fill_with_repair(&current.descriptor, &verdict, &plan, &value)
                    .await?
            }
            None => {
                self.executor
                    .fill_value(&current.descriptor, &verdict, &value)
                    .await?
            }
        };
        current.last_outcome = Some(outcome);
        Ok(RouteKey::Filled)
    }

    fn validate(&mut self, state: &mut SessionState) -> Result<RouteKey, AgentError> {
        let phase = state.phase;
        let (outcome, descriptor) = match state.current.as_mut() {
            Some(current) => (
                current.last_outcome.take().unwrap_or_default(),
                current.descriptor.clone(),
            ),
            None => {
                return Err(AgentError::InvalidTransition {
                    phase,
                    key: RouteKey::Advance,
                });
            }
        };

        if outcome.success {
            self.settle(state, Bucket::Completed, None);
            return Ok(next_in_queue(state));
        }

        let kind = outcome.error_kind.unwrap_or(FailureKind::Unknown);
        warn!(
            selector = %descriptor.selector,
            error = ?kind,
            message = outcome.error.as_deref().unwrap_or_default(),
            retry = state.retry_count,
            "fill failed"
        );
        if !kind.is_retryable() {
            self.settle(state, Bucket::Failed, Some(kind));
            return Ok(next_in_queue(state));
        }

        let plan = repair(&descriptor, kind, state.retry_count, self.config.agent.max_retries);
        let (repair_kind, confidence) = (plan.kind, plan.confidence);
        match repair_kind {
            RepairKind::Escalate => {
                self.settle(state, Bucket::Failed, Some(kind));
                state.escalation = Some(ReviewReason::AccessDenied {
                    selector: descriptor.selector,
                });
                Ok(RouteKey::Escalate)
            }
            RepairKind::SkipField => {
                self.settle(state, Bucket::Skipped, Some(kind));
                Ok(next_in_queue(state))
            }
            _ if confidence < MIN_REPAIR_CONFIDENCE => {
                info!(selector = %descriptor.selector, confidence, "repair not worth applying");
                self.settle(state, Bucket::Skipped, Some(kind));
                Ok(next_in_queue(state))
            }
            _ => {
                state.repairs.push(RepairRecord {
                    selector: descriptor.selector.clone(),
                    error: kind,
                    retry_count: state.retry_count,
                    kind: repair_kind,
                    confidence,
                });
                self.note(JournalEvent::Repair {
                    selector: descriptor.selector,
                    kind: repair_kind,
                    confidence,
                });
                state.retry_count += 1;
                if let Some(current) = state.current.as_mut() {
                    current.pending_repair = Some(plan);
                }
                Ok(RouteKey::Retry)
            }
        }
    }

    async fn check_completion(
        &mut self,
        state: &mut SessionState,
        cycle_base: u32,
    ) -> Result<RouteKey, AgentError> {
        state.cycle_count += 1;
        let budget_left = state.cycle_count - cycle_base < self.config.agent.max_cycles;

        // Filling can reveal fields that were hidden on the first scan.
        if budget_left {
            match self.driver.snapshot().await {
                Ok(snapshot) => {
                    let added = self.absorb(state, snapshot);
                    if added > 0 {
                        info!(added, cycle = state.cycle_count, "new fields appeared");
                    }
                }
                Err(DriverError::Action(msg)) => warn!(error = %msg, "rescan failed"),
                Err(fatal) => return Err(fatal.into()),
            }
        }

        let report = self.gate.evaluate(&state.tally());
        state.form_completion = report.form_completion;
        state.last_gate = Some(report);
        self.note(JournalEvent::Gate {
            form_completion: report.form_completion,
            success_rate: report.success_rate,
            cycle: state.cycle_count,
        });
        info!(
            form_completion = report.form_completion,
            success_rate = report.success_rate,
            decision = ?report.decision,
            cycle = state.cycle_count,
            "completion gate"
        );

        match report.decision {
            GateDecision::ReadyForSubmit => state.final_state = FinalState::ReadyForSubmit,
            GateDecision::Continue => {}
            GateDecision::Escalate => {
                state.escalation = Some(if budget_left {
                    ReviewReason::Incomplete
                } else {
                    ReviewReason::CycleBudgetExhausted
                });
            }
        }
        Ok(RouteKey::Gate(report.decision))
    }

    async fn submit(&mut self, state: &mut SessionState) -> Result<Option<ReviewRequest>, AgentError> {
        let failure = match state.submit_selector.clone() {
            None => "no submit control on the page".to_string(),
            Some(selector) => {
                let click =
                    Action::new(ActionKind::Click, selector, None).with_reasoning("completion gate passed");
                match self.driver.execute(&click).await {
                    Ok(true) => {
                        state.final_state = FinalState::Submitted;
                        info!(selector = %click.selector, "form submitted");
                        return Ok(None);
                    }
                    Ok(false) => "submit click had no effect".to_string(),
                    Err(DriverError::Action(msg)) => msg,
                    Err(fatal) => return Err(fatal.into()),
                }
            }
        };
        warn!(error = %failure, "submit failed");
        state.escalation = Some(ReviewReason::SubmitFailed { message: failure });
        Ok(Some(self.hand_over(state).await))
    }

    /// Ends the session in a human-facing state and leaves what a reviewer needs on disk.
    async fn hand_over(&mut self, state: &mut SessionState) -> ReviewRequest {
        let reason = state.escalation.clone().unwrap_or(ReviewReason::Incomplete);
        state.escalation = Some(reason.clone());

        let tally = state.tally();
        state.form_completion = tally.form_completion();
        let filled_enough = self
            .gate
            .thresholds_met(tally.form_completion(), tally.success_rate());
        state.final_state = match reason {
            ReviewReason::Incomplete | ReviewReason::CycleBudgetExhausted if filled_enough => {
                FinalState::FormFilled
            }
            _ => FinalState::PausedForHuman,
        };

        let mut request = ReviewRequest::new(reason, state);
        let dir = &self.config.agent.artifacts_dir;

        let screenshot = dir.join(format!("review-{}.png", self.session_id));
        match self.driver.screenshot(&screenshot).await {
            Ok(()) => request.screenshot = Some(screenshot),
            Err(e) => warn!(error = %e, "could not capture review screenshot"),
        }

        let snapshot = review::snapshot_path(dir, &self.session_id);
        match review::save_snapshot(&snapshot, state) {
            Ok(()) => request.snapshot = Some(snapshot),
            Err(e) => warn!(error = %e, "could not save session snapshot"),
        }

        info!(
            reason = ?request.reason,
            urgency = ?request.urgency,
            final_state = ?state.final_state,
            "handed over for review"
        );
        request
    }

    async fn apply_decision(
        &mut self,
        state: &mut SessionState,
        decision: HumanDecision,
    ) -> Result<(), AgentError> {
        let reason = state.escalation.take();
        state.final_state = FinalState::Running;
        state.phase = Phase::PageAnalysis;
        info!(reason = ?reason, decision = ?decision, "resuming session");

        let Some(selector) = reason.as_ref().and_then(|r| r.selector()) else {
            match decision {
                HumanDecision::Retry => {
                    // Give everything that did not make it another pass.
                    let retry: Vec<_> = state.failed.drain(..).chain(state.skipped.drain(..)).collect();
                    state.field_queue.extend(retry);
                }
                HumanDecision::Skip => {}
                HumanDecision::Fill(_) => {
                    warn!(reason = ?reason, "pause is not about one field; ignoring the supplied value")
                }
            }
            return Ok(());
        };
        let Some((_, descriptor)) = state.reclaim(selector) else {
            warn!(selector, "reviewed field is no longer tracked");
            return Ok(());
        };

        match decision {
            HumanDecision::Skip => state.skipped.push(descriptor),
            HumanDecision::Retry => state.field_queue.push_front(descriptor),
            HumanDecision::Fill(value) => {
                let context = PageContext {
                    completed_fields: state.completed_labels(),
                    ..state.context.clone()
                };
                let verdict = self.classifier.classify(&descriptor, &context).await;
                let outcome = self
                    .executor
                    .fill_literal(&descriptor, &verdict, &value)
                    .await?;
                let error = outcome.error_kind;
                state.current = Some(CurrentField {
                    verdict: Some(verdict),
                    value: Some(value),
                    ..CurrentField::new(descriptor)
                });
                let bucket = if outcome.success {
                    Bucket::Completed
                } else {
                    Bucket::Failed
                };
                self.settle(state, bucket, error);
            }
        }
        Ok(())
    }

    fn settle(&mut self, state: &mut SessionState, bucket: Bucket, error: Option<FailureKind>) {
        if let Some(descriptor) = state.settle(bucket) {
            info!(selector = %descriptor.selector, bucket = ?bucket, "field settled");
            self.note(JournalEvent::Settled {
                label: descriptor.display_name().to_string(),
                selector: descriptor.selector,
                bucket,
                error,
            });
        }
    }

    fn open_journal(&mut self) {
        if !self.config.agent.write_journal {
            return;
        }
        let path = self
            .config
            .agent
            .artifacts_dir
            .join(format!("session-{}.jsonl", self.session_id));
        match Journal::create(path) {
            Ok(journal) => self.journal = Some(journal),
            Err(e) => warn!(error = %e, "journal disabled"),
        }
    }

    fn note(&mut self, event: JournalEvent) {
        if let Some(journal) = self.journal.as_mut()
            && let Err(e) = journal.record(&event)
        {
            warn!(error = %e, "journal write failed, disabling");
            self.journal = None;
        }
    }

    fn report(
        &self,
        state: &SessionState,
        review: Option<ReviewRequest>,
        error: Option<String>,
        started_at: DateTime<Utc>,
    ) -> SessionReport {
        let tally = state.tally();
        SessionReport {
            url: state.url.clone(),
            final_state: state.final_state,
            phase: state.phase,
            form_completion: tally.form_completion(),
            success_rate: tally.success_rate(),
            observed: state.observed,
            completed: selectors(&state.completed),
            failed: selectors(&state.failed),
            skipped: selectors(&state.skipped),
            cycles: state.cycle_count,
            repairs: state.repairs.clone(),
            review,
            classification: self.classifier.stats().clone(),
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

fn selectors(fields: &[FieldDescriptor]) -> Vec<String> {
    fields.iter().map(|f| f.selector.clone()).collect()
}

fn next_in_queue(state: &SessionState) -> RouteKey {
    if state.field_queue.is_empty() {
        RouteKey::QueueExhausted
    } else {
        RouteKey::Advance
    }
}

/// An interrupted field goes back to the front of the queue rather than into a bucket.
fn requeue_current(state: &mut SessionState) {
    if let Some(current) = state.current.take() {
        state.field_queue.push_front(current.descriptor);
        state.retry_count = 0;
    }
}
