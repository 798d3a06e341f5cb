//! Verdict → concrete `Action` → dispatched, read back, judged.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::brain::{Drafter, truncate_chars};
use crate::driver::BrowserDriver;
use crate::error::DriverError;
use crate::profile::ProfileStore;
use crate::types::{
    Action, ActionKind, ActionOutcome, FailureKind, FieldDescriptor, FieldVerdict, FillStrategy,
    RepairPlan,
};
use crate::verify::{self, ValueFormat};

const RESUME_KEY: &str = "documents.resume";
const DEFAULT_DRAFT_LENGTH: usize = 2000;

pub struct FillExecutor {
    driver: Arc<dyn BrowserDriver>,
    drafter: Option<Arc<dyn Drafter>>,
    profile: Arc<ProfileStore>,
    action_delay: Duration,
}

impl FillExecutor {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        drafter: Option<Arc<dyn Drafter>>,
        profile: Arc<ProfileStore>,
        action_delay: Duration,
    ) -> Self {
        Self {
            driver,
            drafter,
            profile,
            action_delay,
        }
    }

    /// Fills the field at its own selector.
    ///
    /// Only a dead browser is an `Err`; every other failure is in the outcome.
    pub async fn fill(
        &self,
        descriptor: &FieldDescriptor,
        verdict: &FieldVerdict,
    ) -> Result<ActionOutcome, DriverError> {
        let value = match self.resolve_value(descriptor, verdict).await {
            Ok(value) => value,
            Err(outcome) => return Ok(outcome),
        };
        self.fill_value(descriptor, verdict, &value).await
    }

    /// Fills the field at its own selector with an already resolved value.
    pub async fn fill_value(
        &self,
        descriptor: &FieldDescriptor,
        verdict: &FieldVerdict,
        value: &str,
    ) -> Result<ActionOutcome, DriverError> {
        let action = build_action(descriptor, verdict, &descriptor.selector, value);
        self.run(descriptor, verdict, action).await
    }

    /// Puts a value supplied from outside (a reviewer) into the field.
    pub async fn fill_literal(
        &self,
        descriptor: &FieldDescriptor,
        verdict: &FieldVerdict,
        value: &str,
    ) -> Result<ActionOutcome, DriverError> {
        let action = build_action(descriptor, verdict, &descriptor.selector, value)
            .with_reasoning("value supplied by reviewer");
        self.run(descriptor, verdict, action).await
    }

    /// Applies a repair plan: waits run as stability waits, every other action
    /// retargets the fill at its selector. First success wins.
    ///
    /// Takes the value the first attempt used, so a drafted answer is not redrafted.
    pub async fn fill_with_repair(
        &self,
        descriptor: &FieldDescriptor,
        verdict: &FieldVerdict,
        plan: &RepairPlan,
        value: &str,
    ) -> Result<ActionOutcome, DriverError> {
        info!(selector = %descriptor.selector, repair = ?plan.kind, steps = plan.actions.len(), "applying repair");

        let mut last = ActionOutcome::failed(
            FailureKind::ElementNotFound,
            "repair plan had no target selector",
        );
        for step in &plan.actions {
            if let Some(ms) = step.wait_ms() {
                match self.driver.wait_for_stability(Duration::from_millis(ms)).await {
                    Ok(()) => {}
                    Err(DriverError::Action(msg)) => {
                        warn!(error = %msg, "page did not settle, continuing repair")
                    }
                    Err(fatal) => return Err(fatal),
                }
                continue;
            }
            let action = build_action(descriptor, verdict, &step.selector, value)
                .with_reasoning(format!("repair {:?}", plan.kind));
            last = self.run(descriptor, verdict, action).await?;
            if last.success {
                return Ok(last);
            }
        }
        Ok(last)
    }

    async fn run(
        &self,
        descriptor: &FieldDescriptor,
        verdict: &FieldVerdict,
        action: Action,
    ) -> Result<ActionOutcome, DriverError> {
        self.pause().await;
        debug!(kind = ?action.kind, selector = %action.selector, "dispatching action");

        match self.driver.execute(&action).await {
            Ok(true) => {}
            Ok(false) => {
                return Ok(ActionOutcome::failed(
                    FailureKind::Unknown,
                    format!("{:?} on {} had no effect", action.kind, action.selector),
                ));
            }
            Err(DriverError::Action(msg)) => {
                return Ok(ActionOutcome::failed(FailureKind::from_error_text(&msg), msg));
            }
            Err(fatal) => return Err(fatal),
        }

        if !action.is_verifiable() {
            return Ok(ActionOutcome::succeeded(None));
        }
        let expected = action.value.as_deref().unwrap_or_default();
        let (exact, actual) = match self.driver.verify(&action.selector, expected).await {
            Ok(read) => read,
            Err(DriverError::Action(msg)) => {
                return Ok(ActionOutcome::failed(FailureKind::from_error_text(&msg), msg));
            }
            Err(fatal) => return Err(fatal),
        };

        let format = ValueFormat::of(descriptor, verdict.mapped_to.as_deref());
        if exact || verify::check(expected, &actual, format).is_some() {
            Ok(ActionOutcome::succeeded(Some(actual)))
        } else {
            Ok(ActionOutcome::failed(
                FailureKind::ValueRejected,
                format!("verification mismatch: expected {expected:?}, field holds {actual:?}"),
            ))
        }
    }

    /// Produces the literal to put in the field, or the failed outcome explaining why not.
    pub async fn resolve_value(
        &self,
        descriptor: &FieldDescriptor,
        verdict: &FieldVerdict,
    ) -> Result<String, ActionOutcome> {
        let missing = |why: String| ActionOutcome::failed(FailureKind::MissingValue, why);

        match verdict.strategy {
            FillStrategy::SkipField => Err(missing(format!(
                "{} is classified as skip; refusing to fill",
                descriptor.selector
            ))),
            FillStrategy::SimpleMapping => {
                let key = mapping_key(descriptor, verdict)
                    .ok_or_else(|| missing("no profile key for field".to_string()))?;
                let value = self
                    .profile
                    .get(key)
                    .ok_or_else(|| missing(format!("profile has no value for {key}")))?;
                if descriptor.options.is_empty() {
                    Ok(value.to_string())
                } else {
                    choose_option(&descriptor.options, value)
                        .ok_or_else(|| missing(format!("no option matches {value:?}")))
                }
            }
            FillStrategy::OptionSelection => {
                let wanted = verdict
                    .mapped_to
                    .as_deref()
                    .and_then(|key| self.profile.get(key))
                    .ok_or_else(|| missing("no preferred option in profile".to_string()))?;
                if descriptor.options.is_empty() {
                    return Ok(wanted.to_string());
                }
                choose_option(&descriptor.options, wanted)
                    .ok_or_else(|| missing(format!("no option matches {wanted:?}")))
            }
            FillStrategy::RagGeneration => {
                let drafter = self
                    .drafter
                    .as_ref()
                    .ok_or_else(|| missing("answer drafting unavailable".to_string()))?;
                let question = verdict
                    .extracted_question
                    .clone()
                    .unwrap_or_else(|| descriptor.display_name().to_string());
                let max_length = verdict
                    .max_length
                    .or_else(|| descriptor.max_length_attr())
                    .unwrap_or(DEFAULT_DRAFT_LENGTH);
                match drafter.draft_answer(&question, &self.profile, max_length).await {
                    Ok(draft) if !draft.trim().is_empty() => {
                        Ok(truncate_chars(draft.trim(), max_length))
                    }
                    Ok(_) => Err(missing("drafter returned an empty answer".to_string())),
                    Err(e) => {
                        warn!(selector = %descriptor.selector, error = %e, "drafting failed");
                        Err(ActionOutcome::failed(
                            FailureKind::MissingValue,
                            format!("drafting failed: {e}"),
                        ))
                    }
                }
            }
        }
    }

    async fn pause(&self) {
        if self.action_delay.is_zero() {
            return;
        }
        let jitter = 1.0 + rand::random::<f64>() * 0.5;
        tokio::time::sleep(self.action_delay.mul_f64(jitter)).await;
    }
}

fn mapping_key<'a>(descriptor: &FieldDescriptor, verdict: &'a FieldVerdict) -> Option<&'a str> {
    verdict.mapped_to.as_deref().or_else(|| {
        descriptor
            .input_type
            .eq_ignore_ascii_case("file")
            .then_some(RESUME_KEY)
    })
}

/// The action kind follows the element, the value follows the verdict.
pub fn build_action(
    descriptor: &FieldDescriptor,
    verdict: &FieldVerdict,
    selector: &str,
    value: &str,
) -> Action {
    let input_type = descriptor.input_type.to_ascii_lowercase();
    let kind = if descriptor.is_choice() {
        ActionKind::Select
    } else if input_type == "file" {
        ActionKind::Upload
    } else if matches!(input_type.as_str(), "checkbox" | "radio") {
        ActionKind::Click
    } else {
        ActionKind::Type
    };
    Action::new(kind, selector, Some(value.to_string()))
        .with_reasoning(format!("{:?}: {}", verdict.strategy, verdict.reasoning))
}

/// Case-insensitive equality first, then containment either way.
pub fn choose_option(options: &[String], wanted: &str) -> Option<String> {
    let wanted = wanted.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }
    options
        .iter()
        .find(|o| o.trim().to_lowercase() == wanted)
        .or_else(|| {
            options.iter().find(|o| {
                let o = o.trim().to_lowercase();
                !o.is_empty() && (o.contains(&wanted) || wanted.contains(&o))
            })
        })
        .cloned()
}
