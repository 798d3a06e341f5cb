use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use job_form_agent::brain::{Drafter, Oracle};
use job_form_agent::config::AgentConfig;
use job_form_agent::driver::BrowserDriver;
use job_form_agent::error::{DriverError, OracleError};
use job_form_agent::machine::Phase;
use job_form_agent::orchestrator::Orchestrator;
use job_form_agent::profile::ProfileStore;
use job_form_agent::review::{HumanDecision, ReviewReason, load_snapshot};
use job_form_agent::session::Bucket;
use job_form_agent::types::{
    Action, ActionKind, FieldDescriptor, FinalState, PageContext, PageSnapshot, RepairKind,
};

const URL: &str = "https://jobs.example.com/apply/42";

/// In-memory application form. Scans replay `pages` in order, then repeat the last one,
/// reporting whatever has been typed into each field.
#[derive(Default)]
struct FakeForm {
    pages: Mutex<VecDeque<Vec<FieldDescriptor>>>,
    current: Mutex<Vec<FieldDescriptor>>,
    submit_selector: Option<String>,
    values: Mutex<HashMap<String, String>>,
    /// Queued errors per selector, consumed one per `execute`.
    failures: Mutex<HashMap<String, VecDeque<DriverError>>>,
    /// Every non-wait action fails with this text.
    unreachable: Option<String>,
    /// How the page rewrites a typed value (input masks).
    reformat: HashMap<String, String>,
    actions: Mutex<Vec<Action>>,
    screenshots: Mutex<u32>,
}

impl FakeForm {
    fn with_fields(fields: Vec<FieldDescriptor>) -> Self {
        Self {
            pages: Mutex::new(VecDeque::from([fields])),
            submit_selector: Some("[data-eid=\"s0\"]".into()),
            ..Default::default()
        }
    }

    fn then_page(self, fields: Vec<FieldDescriptor>) -> Self {
        self.pages.lock().unwrap().push_back(fields);
        self
    }

    fn fail_next(&self, selector: &str, err: DriverError) {
        self.failures
            .lock()
            .unwrap()
            .entry(selector.to_string())
            .or_default()
            .push_back(err);
    }

    fn executed(&self) -> Vec<Action> {
        self.actions.lock().unwrap().clone()
    }

    fn touched(&self, selector: &str) -> bool {
        self.executed().iter().any(|a| a.selector == selector)
    }

    fn value(&self, selector: &str) -> Option<String> {
        self.values.lock().unwrap().get(selector).cloned()
    }
}

#[async_trait]
impl BrowserDriver for FakeForm {
    async fn snapshot(&self) -> Result<PageSnapshot, DriverError> {
        let mut current = self.current.lock().unwrap();
        if let Some(next) = self.pages.lock().unwrap().pop_front() {
            *current = next;
        }
        let values = self.values.lock().unwrap();
        let fields = current
            .iter()
            .cloned()
            .map(|mut field| {
                field.current_value = values.get(&field.selector).cloned().unwrap_or_default();
                field
            })
            .collect();
        Ok(PageSnapshot {
            context: PageContext {
                url: URL.into(),
                title: "Software Engineer - Apply".into(),
                form_count: 1,
                ..Default::default()
            },
            fields,
            submit_selector: self.submit_selector.clone(),
        })
    }

    async fn execute(&self, action: &Action) -> Result<bool, DriverError> {
        self.actions.lock().unwrap().push(action.clone());
        if action.kind == ActionKind::Wait {
            return Ok(true);
        }
        if let Some(msg) = &self.unreachable {
            return Err(DriverError::Action(msg.clone()));
        }
        let queued = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&action.selector)
            .and_then(VecDeque::pop_front);
        if let Some(err) = queued {
            return Err(err);
        }
        if let Some(value) = &action.value {
            let stored = self
                .reformat
                .get(&action.selector)
                .cloned()
                .unwrap_or_else(|| value.clone());
            self.values
                .lock()
                .unwrap()
                .insert(action.selector.clone(), stored);
        }
        Ok(true)
    }

    async fn verify(&self, selector: &str, expected: &str) -> Result<(bool, String), DriverError> {
        let actual = self.value(selector).unwrap_or_default();
        Ok((actual == expected, actual))
    }

    async fn wait_for_stability(&self, _timeout: Duration) -> Result<(), DriverError> {
        Ok(())
    }

    async fn screenshot(&self, _path: &Path) -> Result<(), DriverError> {
        *self.screenshots.lock().unwrap() += 1;
        Ok(())
    }
}

struct CannedDrafter;

#[async_trait]
impl Drafter for CannedDrafter {
    async fn draft_answer(
        &self,
        question: &str,
        _profile: &ProfileStore,
        max_length: usize,
    ) -> Result<String, OracleError> {
        Ok(format!("I am drawn to this role because {question}")
            .chars()
            .take(max_length)
            .collect())
    }
}

/// Numbers its drafts so a second draft is visible in the typed value.
#[derive(Default)]
struct CountingDrafter {
    calls: Mutex<u32>,
}

#[async_trait]
impl Drafter for CountingDrafter {
    async fn draft_answer(
        &self,
        _question: &str,
        _profile: &ProfileStore,
        _max_length: usize,
    ) -> Result<String, OracleError> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        Ok(format!("Draft number {calls} about why I want this role"))
    }
}

struct DownOracle {
    calls: Mutex<u32>,
}

#[async_trait]
impl Oracle for DownOracle {
    async fn complete(&self, _prompt: &str) -> Result<String, OracleError> {
        *self.calls.lock().unwrap() += 1;
        Err(OracleError::Status {
            status: 503,
            message: "service unavailable".into(),
        })
    }
}

fn input(selector: &str, placeholder: &str, required: bool) -> FieldDescriptor {
    FieldDescriptor {
        selector: selector.into(),
        tag: "input".into(),
        input_type: "text".into(),
        placeholder: placeholder.into(),
        required,
        ..Default::default()
    }
}

fn essay(selector: &str) -> FieldDescriptor {
    FieldDescriptor {
        selector: selector.into(),
        tag: "textarea".into(),
        placeholder: "Why do you want this job?".into(),
        ..Default::default()
    }
}

fn named(selector: &str, name: &str, placeholder: &str) -> FieldDescriptor {
    let mut field = input(selector, placeholder, true);
    field.attributes.insert("name".into(), name.into());
    field
}

fn quiz(selector: &str) -> FieldDescriptor {
    let mut field = input(selector, "Answer", true);
    field.attributes.insert("data-assessment".into(), "true".into());
    field
}

fn profile() -> ProfileStore {
    [
        ("personal.first_name", "Timothy"),
        ("personal.email", "tim@example.com"),
        ("personal.phone", "5551234567"),
    ]
    .into_iter()
    .collect()
}

fn config(dir: &TempDir, auto_submit: bool) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.agent.auto_submit = auto_submit;
    config.agent.action_delay_ms = 0;
    config.agent.artifacts_dir = dir.path().to_path_buf();
    config
}

fn orchestrator(config: AgentConfig, form: &Arc<FakeForm>) -> Orchestrator {
    Orchestrator::new(
        config,
        form.clone(),
        profile(),
        None,
        Some(Arc::new(CannedDrafter)),
    )
}

#[tokio::test]
async fn complete_form_is_submitted_when_auto_submit_is_on() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm::with_fields(vec![
        input("#first", "First Name", true),
        input("#email", "Email", true),
        essay("#why"),
    ]));

    let report = orchestrator(config(&dir, true), &form).run(URL).await;

    assert_eq!(report.final_state, FinalState::Submitted);
    assert_eq!(report.phase, Phase::SubmitForm);
    assert_eq!(report.completed.len(), 3);
    assert_eq!(report.form_completion, 1.0);
    assert_eq!(form.value("#first").as_deref(), Some("Timothy"));
    assert!(
        form.value("#why")
            .is_some_and(|v| v.starts_with("I am drawn to this role"))
    );
    let last = form.executed().pop().unwrap();
    assert_eq!(last.kind, ActionKind::Click);
    assert_eq!(last.selector, "[data-eid=\"s0\"]");
}

#[tokio::test]
async fn thresholds_met_without_auto_submit_stops_at_form_filled() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm::with_fields(vec![
        input("#first", "First Name", true),
        input("#email", "Email", true),
    ]));

    let report = orchestrator(config(&dir, false), &form).run(URL).await;

    assert_eq!(report.final_state, FinalState::FormFilled);
    assert_eq!(report.phase, Phase::HumanReview);
    assert!(!form.executed().iter().any(|a| a.kind == ActionKind::Click));
    let review = report.review.unwrap();
    assert_eq!(review.reason, ReviewReason::Incomplete);
    assert!(review.snapshot.is_some_and(|p| p.exists()));
}

#[tokio::test]
async fn assessment_fields_are_skipped_without_touching_them() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm::with_fields(vec![
        input("#first", "First Name", true),
        quiz("#q1"),
    ]));

    let report = orchestrator(config(&dir, true), &form).run(URL).await;

    assert_eq!(report.skipped, vec!["#q1".to_string()]);
    assert!(!form.touched("#q1"));
    // Half the form is done, so nothing is submitted.
    assert_eq!(report.form_completion, 0.5);
    assert_eq!(report.final_state, FinalState::PausedForHuman);
}

#[tokio::test]
async fn element_never_found_is_skipped_after_two_repairs() {
    let dir = TempDir::new().unwrap();
    let mut field = input("#first", "First Name", true);
    field.attributes.insert("id".into(), "first".into());
    let form = Arc::new(FakeForm {
        unreachable: Some("No element found for selector".into()),
        ..FakeForm::with_fields(vec![field])
    });

    let report = orchestrator(config(&dir, true), &form).run(URL).await;

    assert_eq!(report.skipped, vec!["#first".to_string()]);
    assert!(report.failed.is_empty());
    let kinds: Vec<_> = report.repairs.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![RepairKind::AlternativeSelectors, RepairKind::WaitAndRetry]
    );
    // First attempt, three selectors from the alternative plan, one after waiting.
    let attempts = form
        .executed()
        .iter()
        .filter(|a| a.kind != ActionKind::Wait)
        .count();
    assert_eq!(attempts, 5);
    // Retries re-classify the same field from the cache.
    assert_eq!(report.classification.cache_hits, 2);
    assert_eq!(report.classification.total_classified, 1);
}

#[tokio::test]
async fn access_denied_pauses_then_resumes_with_reviewer_value() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm::with_fields(vec![
        input("#first", "First Name", true),
        input("#email", "Email", true),
    ]));
    form.fail_next("#email", DriverError::Action("Permission denied".into()));

    let mut agent = orchestrator(config(&dir, false), &form);
    let report = agent.run(URL).await;

    assert_eq!(report.final_state, FinalState::PausedForHuman);
    assert_eq!(report.phase, Phase::HumanReview);
    assert_eq!(report.failed, vec!["#email".to_string()]);
    assert!(report.repairs.is_empty());
    let review = report.review.unwrap();
    assert_eq!(
        review.reason,
        ReviewReason::AccessDenied {
            selector: "#email".into()
        }
    );
    assert_eq!(review.field.map(|f| f.selector).as_deref(), Some("#email"));
    assert!(review.screenshot.is_some());
    assert_eq!(*form.screenshots.lock().unwrap(), 1);

    let snapshot = review.snapshot.unwrap();
    let state = load_snapshot(&snapshot).unwrap();
    assert_eq!(state.bucket_of("#email"), Some(Bucket::Failed));

    let resumed = agent
        .resume(state, HumanDecision::Fill("tim@example.com".into()))
        .await;
    assert_eq!(resumed.completed.len(), 2);
    assert!(resumed.failed.is_empty());
    assert_eq!(resumed.final_state, FinalState::FormFilled);
}

#[tokio::test]
async fn profile_gap_fails_the_field_without_repairs() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm::with_fields(vec![input(
        "#color",
        "Favourite colour",
        false,
    )]));

    let report = orchestrator(config(&dir, true), &form).run(URL).await;

    assert_eq!(report.failed, vec!["#color".to_string()]);
    assert!(report.repairs.is_empty());
    assert!(form.executed().is_empty());
    assert_eq!(report.success_rate, 0.0);
}

#[tokio::test]
async fn fatal_browser_fault_ends_in_error() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm::with_fields(vec![
        input("#first", "First Name", true),
        input("#email", "Email", true),
    ]));
    form.fail_next("#first", DriverError::Fatal("connection is closed".into()));

    let report = orchestrator(config(&dir, true), &form).run(URL).await;

    assert_eq!(report.final_state, FinalState::Error);
    assert!(report.error.unwrap().contains("connection is closed"));
    assert!(report.completed.is_empty() && report.failed.is_empty() && report.skipped.is_empty());
}

#[tokio::test]
async fn fields_revealed_after_a_pass_are_filled_next_cycle() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(
        FakeForm::with_fields(vec![input("#first", "First Name", true)]).then_page(vec![
            input("#first", "First Name", true),
            input("#email", "Email", true),
        ]),
    );

    let report = orchestrator(config(&dir, true), &form).run(URL).await;

    assert_eq!(report.final_state, FinalState::Submitted);
    assert_eq!(report.observed, 2);
    assert_eq!(report.cycles, 2);
    assert_eq!(form.value("#email").as_deref(), Some("tim@example.com"));
}

#[tokio::test]
async fn cycle_budget_stops_rescanning() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, false);
    config.agent.max_cycles = 1;
    let form = Arc::new(
        FakeForm::with_fields(vec![input("#first", "First Name", true)])
            .then_page(vec![input("#email", "Email", true)]),
    );

    let report = orchestrator(config, &form).run(URL).await;

    assert_eq!(report.cycles, 1);
    assert!(!form.touched("#email"));
    assert_eq!(
        report.review.map(|r| r.reason),
        Some(ReviewReason::CycleBudgetExhausted)
    );
    assert_eq!(report.final_state, FinalState::FormFilled);
}

#[tokio::test]
async fn deadline_pauses_and_resume_starts_over_from_the_scan() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm::with_fields(vec![input(
        "#first",
        "First Name",
        true,
    )]));

    let mut expired = config(&dir, true);
    expired.agent.session_timeout_secs = 0;
    let mut agent = orchestrator(expired, &form);
    let report = agent.run(URL).await;

    assert_eq!(report.final_state, FinalState::PausedForHuman);
    assert_eq!(
        report.review.as_ref().map(|r| r.reason.clone()),
        Some(ReviewReason::DeadlineExceeded)
    );
    assert_eq!(report.observed, 0);

    let state = agent.take_state().unwrap();
    let resumed = orchestrator(config(&dir, true), &form)
        .resume(state, HumanDecision::Retry)
        .await;
    assert_eq!(resumed.final_state, FinalState::Submitted);
    assert_eq!(resumed.completed, vec!["#first".to_string()]);
}

#[tokio::test]
async fn missing_submit_control_hands_over() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm {
        submit_selector: None,
        ..FakeForm::with_fields(vec![input("#first", "First Name", true)])
    });

    let report = orchestrator(config(&dir, true), &form).run(URL).await;

    assert_eq!(report.final_state, FinalState::PausedForHuman);
    assert!(matches!(
        report.review.map(|r| r.reason),
        Some(ReviewReason::SubmitFailed { .. })
    ));
}

#[tokio::test]
async fn masked_phone_value_still_verifies() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm {
        reformat: HashMap::from([("#phone".to_string(), "(555) 123-4567".to_string())]),
        ..FakeForm::with_fields(vec![input("#phone", "Phone", true)])
    });

    let report = orchestrator(config(&dir, true), &form).run(URL).await;

    assert_eq!(report.completed, vec!["#phone".to_string()]);
    assert_eq!(report.final_state, FinalState::Submitted);
}

#[tokio::test]
async fn unreachable_oracle_degrades_to_keyword_rules() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm::with_fields(vec![
        input("#first", "First Name", true),
        essay("#why"),
    ]));
    let oracle = Arc::new(DownOracle {
        calls: Mutex::new(0),
    });

    let mut agent = Orchestrator::new(
        config(&dir, true),
        form.clone(),
        profile(),
        Some(oracle.clone()),
        Some(Arc::new(CannedDrafter)),
    );
    let report = agent.run(URL).await;

    assert_eq!(report.final_state, FinalState::Submitted);
    assert_eq!(*oracle.calls.lock().unwrap(), 2);
    assert_eq!(report.classification.fallbacks, 2);
}

#[tokio::test]
async fn journal_and_summary_land_in_artifacts_dir() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm::with_fields(vec![input(
        "#first",
        "First Name",
        true,
    )]));

    orchestrator(config(&dir, true), &form).run(URL).await;

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    let journal = names.iter().find(|n| n.ends_with(".jsonl")).unwrap();
    assert!(names.iter().any(|n| n.ends_with("-summary.json")));

    let lines = std::fs::read_to_string(dir.path().join(journal)).unwrap();
    let events: Vec<serde_json::Value> = lines
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(events.iter().any(|e| e["event"] == "settled" && e["bucket"] == "completed"));
    assert!(events.iter().any(|e| e["event"] == "gate"));
}

#[tokio::test]
async fn resume_after_reload_follows_fields_to_new_selectors() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm::with_fields(vec![
        named("[data-eid=\"f0\"]", "first_name", "First Name"),
        named("[data-eid=\"f1\"]", "email", "Email"),
    ]));
    form.fail_next("[data-eid=\"f1\"]", DriverError::Action("Permission denied".into()));
    let mut agent = orchestrator(config(&dir, false), &form);
    let report = agent.run(URL).await;
    assert_eq!(report.final_state, FinalState::PausedForHuman);
    let state = agent.take_state().unwrap();

    // A fresh browser: nothing typed, and the fields tagged in another order.
    let reloaded = Arc::new(FakeForm::with_fields(vec![
        named("[data-eid=\"f0\"]", "email", "Email"),
        named("[data-eid=\"f1\"]", "first_name", "First Name"),
    ]));
    let resumed = orchestrator(config(&dir, false), &reloaded)
        .resume(state, HumanDecision::Fill("tim@example.com".into()))
        .await;

    assert_eq!(resumed.final_state, FinalState::FormFilled);
    assert!(resumed.failed.is_empty());
    assert_eq!(resumed.completed.len(), 2);
    assert_eq!(resumed.observed, 2);
    assert_eq!(
        reloaded.value("[data-eid=\"f0\"]").as_deref(),
        Some("tim@example.com")
    );
    assert_eq!(
        reloaded.value("[data-eid=\"f1\"]").as_deref(),
        Some("Timothy")
    );
}

#[tokio::test]
async fn repairs_reuse_the_first_draft() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm::with_fields(vec![essay("#why")]));
    form.fail_next("#why", DriverError::Action("No element found for #why".into()));
    let drafter = Arc::new(CountingDrafter::default());

    let report = Orchestrator::new(
        config(&dir, true),
        form.clone(),
        profile(),
        None,
        Some(drafter.clone()),
    )
    .run(URL)
    .await;

    assert_eq!(report.final_state, FinalState::Submitted);
    assert_eq!(report.repairs.len(), 1);
    assert_eq!(*drafter.calls.lock().unwrap(), 1);
    let typed: Vec<_> = form
        .executed()
        .into_iter()
        .filter(|a| a.kind == ActionKind::Type)
        .filter_map(|a| a.value)
        .collect();
    assert_eq!(typed.len(), 2);
    assert!(typed.iter().all(|v| v.starts_with("Draft number 1")));
}

#[tokio::test]
async fn value_for_a_whole_form_pause_is_ignored() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm::with_fields(vec![input(
        "#first",
        "First Name",
        true,
    )]));
    let mut expired = config(&dir, true);
    expired.agent.session_timeout_secs = 0;
    let mut agent = orchestrator(expired, &form);
    agent.run(URL).await;
    let state = agent.take_state().unwrap();

    let resumed = orchestrator(config(&dir, true), &form)
        .resume(state, HumanDecision::Fill("stray value".into()))
        .await;

    assert_eq!(resumed.final_state, FinalState::Submitted);
    assert_eq!(form.value("#first").as_deref(), Some("Timothy"));
    assert!(
        !form
            .executed()
            .iter()
            .any(|a| a.value.as_deref() == Some("stray value"))
    );
}

#[tokio::test]
async fn each_run_classifies_from_scratch() {
    let dir = TempDir::new().unwrap();
    let form = Arc::new(FakeForm::with_fields(vec![input(
        "#first",
        "First Name",
        true,
    )]));
    let mut agent = orchestrator(config(&dir, true), &form);

    let first = agent.run(URL).await;
    let second = agent.run(URL).await;

    assert_eq!(first.classification.total_classified, 1);
    assert_eq!(second.classification.total_classified, 1);
    assert_eq!(second.classification.cache_hits, 0);
}
