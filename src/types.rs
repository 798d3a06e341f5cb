use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One form field as observed on the page. Produced fresh on every scan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldDescriptor {
    pub selector: String,
    pub tag: String,
    pub input_type: String,
    pub label: String,
    pub placeholder: String,
    pub required: bool,
    pub current_value: String,
    pub attributes: BTreeMap<String, String>,
    pub nearby_text: Vec<String>,
    /// Discrete choices for selects and radio groups.
    pub options: Vec<String>,
}

impl FieldDescriptor {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Best human-readable name for the field, used in prompts and logs.
    pub fn display_name(&self) -> &str {
        [self.label.as_str(), self.placeholder.as_str()]
            .into_iter()
            .chain(self.attr("aria-label"))
            .chain(self.attr("name"))
            .find(|s| !s.trim().is_empty())
            .unwrap_or(self.selector.as_str())
    }

    pub fn is_textarea(&self) -> bool {
        self.tag.eq_ignore_ascii_case("textarea")
    }

    pub fn is_select(&self) -> bool {
        self.tag.eq_ignore_ascii_case("select")
    }

    /// Radios sharing a `name`, scanned as one field whose options are their labels.
    pub fn is_radio_group(&self) -> bool {
        self.input_type.eq_ignore_ascii_case("radio") && !self.options.is_empty()
    }

    /// Filled by picking one of `options` rather than typing.
    pub fn is_choice(&self) -> bool {
        self.is_select() || self.is_radio_group()
    }

    /// Key that survives a page reload, unlike the tagged selector.
    pub fn identity(&self) -> String {
        let tag = self.tag.to_ascii_lowercase();
        let input_type = self.input_type.to_ascii_lowercase();
        if let Some(id) = self.attr("id").filter(|v| !v.trim().is_empty()) {
            format!("id:{id}")
        } else if let Some(name) = self.attr("name").filter(|v| !v.trim().is_empty()) {
            format!("name:{tag}:{input_type}:{name}")
        } else {
            format!(
                "shape:{tag}:{input_type}:{}:{}",
                self.label.trim(),
                self.placeholder.trim()
            )
        }
    }

    pub fn max_length_attr(&self) -> Option<usize> {
        self.attr("maxlength").and_then(|v| v.trim().parse().ok())
    }
}

/// Read-only page facts accompanying a descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageContext {
    pub url: String,
    pub title: String,
    pub form_count: usize,
    pub user_profile_available: bool,
    pub rag_available: bool,
    /// Labels of fields already filled this session. Prompt-only, never fingerprinted.
    pub completed_fields: Vec<String>,
}

/// What the DOM extractor returns for one scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageSnapshot {
    pub context: PageContext,
    pub fields: Vec<FieldDescriptor>,
    pub submit_selector: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStrategy {
    SimpleMapping,
    RagGeneration,
    OptionSelection,
    SkipField,
}

impl FillStrategy {
    /// Parses the oracle's wire names. Anything unrecognised is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "simple_mapping" => Some(Self::SimpleMapping),
            "rag_generation" => Some(Self::RagGeneration),
            "option_selection" => Some(Self::OptionSelection),
            "skip_field" | "skip" => Some(Self::SkipField),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Simple,
    Medium,
    Complex,
    Expert,
}

impl Complexity {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trivial" => Some(Self::Trivial),
            "simple" => Some(Self::Simple),
            "medium" => Some(Self::Medium),
            "complex" => Some(Self::Complex),
            "expert" => Some(Self::Expert),
            _ => None,
        }
    }
}

/// The classification engine's decision about how to fill one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldVerdict {
    pub strategy: FillStrategy,
    pub complexity: Complexity,
    pub confidence: f64,
    pub mapped_to: Option<String>,
    pub requires_rag: bool,
    pub max_length: Option<usize>,
    pub extracted_question: Option<String>,
    pub reasoning: String,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Select,
    Upload,
    Wait,
}

/// A single atomic browser step. For `Wait`, `value` holds the duration in ms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub selector: String,
    pub value: Option<String>,
    pub reasoning: Option<String>,
}

impl Action {
    pub fn new(kind: ActionKind, selector: impl Into<String>, value: Option<String>) -> Self {
        Self {
            kind,
            selector: selector.into(),
            value,
            reasoning: None,
        }
    }

    pub fn wait(ms: u64) -> Self {
        Self::new(ActionKind::Wait, "", Some(ms.to_string()))
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn wait_ms(&self) -> Option<u64> {
        match self.kind {
            ActionKind::Wait => self.value.as_deref().and_then(|v| v.parse().ok()),
            _ => None,
        }
    }

    /// Text and select actions leave a value behind that can be read back.
    pub fn is_verifiable(&self) -> bool {
        matches!(self.kind, ActionKind::Type | ActionKind::Select)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ElementNotFound,
    Timeout,
    ValueRejected,
    AccessDenied,
    OracleUnavailable,
    /// No value could be produced for the field (profile gap, failed draft, no option).
    MissingValue,
    Unknown,
}

impl FailureKind {
    /// Maps raw driver error text onto the failure taxonomy.
    pub fn from_error_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        let has = |keys: &[&str]| keys.iter().any(|k| lower.contains(k));
        if has(&["not found", "no such element", "no element", "no node"]) {
            Self::ElementNotFound
        } else if has(&["timeout", "timed out", "wait"]) {
            Self::Timeout
        } else if has(&["invalid", "rejected", "format"]) {
            Self::ValueRejected
        } else if has(&["access", "permission", "denied"]) {
            Self::AccessDenied
        } else {
            Self::Unknown
        }
    }

    /// Whether a repair can plausibly change the result.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::MissingValue | Self::OracleUnavailable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub success: bool,
    pub verified_value: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn succeeded(verified_value: Option<String>) -> Self {
        Self {
            success: true,
            verified_value,
            ..Default::default()
        }
    }

    pub fn failed(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            verified_value: None,
            error_kind: Some(kind),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    AlternativeSelectors,
    WaitAndRetry,
    SkipField,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairPlan {
    pub kind: RepairKind,
    pub confidence: f64,
    pub actions: Vec<Action>,
}

/// Repair confidence below which a plan is not applied.
pub const MIN_REPAIR_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalState {
    Running,
    ReadyForSubmit,
    Submitted,
    FormFilled,
    PausedForHuman,
    Error,
}

impl FinalState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running | Self::ReadyForSubmit)
    }
}
