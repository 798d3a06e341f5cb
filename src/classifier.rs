//! Field classification: descriptor + page context → `FieldVerdict`.
//!
//! The oracle is consulted once per distinct field fingerprint. When it is
//! missing, failing, or talking nonsense, a fixed ladder of pattern rules
//! produces a conservative verdict instead. `classify` never fails.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::brain::{Oracle, strip_fences};
use crate::types::{Complexity, FieldDescriptor, FieldVerdict, FillStrategy, PageContext};

/// Every fallback verdict stays strictly below this confidence.
pub const FALLBACK_CONFIDENCE_CEILING: f64 = 0.8;

const DEFAULT_ESSAY_LENGTH: usize = 2000;

static FIRST_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(first[\s_-]?name|fname|given[\s_-]?name|forename)\b").expect("valid regex")
});
static LAST_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(last[\s_-]?name|lname|surname|family[\s_-]?name)\b").expect("valid regex")
});
static FULL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(full[\s_-]?name|your name|legal name)\b").expect("valid regex")
});
static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\be-?mail\b").expect("valid regex"));
static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(phone|telephone|mobile|cell)\b").expect("valid regex")
});
static JOB_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(job[\s_-]?title|current[\s_-]?title|position)\b").expect("valid regex")
});
static EXPERIENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(experience|years)\b").expect("valid regex"));
static GPA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(gpa|grade point)\b").expect("valid regex"));
static SCHOOL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(school|university|college|institution)\b").expect("valid regex")
});
static ESSAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(cover letter|why|motivation|motivated|interested|interest|describe|tell us|explain)\b")
        .expect("valid regex")
});
static ASSESSMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(assessment|quiz|coding|test)\b").expect("valid regex")
});

const ASSESSMENT_ATTRIBUTES: [&str; 3] = ["data-assessment", "data-test", "data-quiz"];

/// Structural cache key. Two descriptors with equal fingerprints get the same verdict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FieldFingerprint {
    selector: String,
    tag: String,
    input_type: String,
    placeholder: String,
    label: String,
    required: bool,
    attributes: BTreeMap<String, String>,
    nearby_text: Vec<String>,
    page_title: String,
}

impl FieldFingerprint {
    pub fn of(descriptor: &FieldDescriptor, context: &PageContext) -> Self {
        Self {
            selector: descriptor.selector.clone(),
            tag: descriptor.tag.clone(),
            input_type: descriptor.input_type.clone(),
            placeholder: descriptor.placeholder.clone(),
            label: descriptor.label.clone(),
            required: descriptor.required,
            attributes: descriptor.attributes.clone(),
            nearby_text: descriptor.nearby_text.clone(),
            page_title: context.title.clone(),
        }
    }

    /// Short hex digest for logs.
    pub fn digest(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let hash = format!("{:x}", Sha256::digest(&encoded));
        hash[..12].to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassificationStats {
    pub total_classified: u64,
    pub oracle_calls: u64,
    pub cache_hits: u64,
    pub fallbacks: u64,
    pub strategies: BTreeMap<FillStrategy, u64>,
    pub complexities: BTreeMap<Complexity, u64>,
}

impl ClassificationStats {
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.total_classified + self.cache_hits;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

/// Session-scoped classifier. The memo table is unbounded and lives as long as the session.
pub struct ClassificationEngine {
    oracle: Option<Arc<dyn Oracle>>,
    cache: HashMap<FieldFingerprint, FieldVerdict>,
    stats: ClassificationStats,
}

impl ClassificationEngine {
    pub fn new(oracle: Option<Arc<dyn Oracle>>) -> Self {
        Self {
            oracle,
            cache: HashMap::new(),
            stats: ClassificationStats::default(),
        }
    }

    pub async fn classify(
        &mut self,
        descriptor: &FieldDescriptor,
        context: &PageContext,
    ) -> FieldVerdict {
        let fingerprint = FieldFingerprint::of(descriptor, context);
        if let Some(cached) = self.cache.get(&fingerprint) {
            debug!(selector = %descriptor.selector, fingerprint = %fingerprint.digest(), "classification cache hit");
            self.stats.cache_hits += 1;
            return cached.clone();
        }

        let verdict = match self.consult_oracle(descriptor, context).await {
            Some(verdict) => verdict,
            None => {
                self.stats.fallbacks += 1;
                fallback_verdict(descriptor)
            }
        };
        let verdict = apply_assessment_guard(descriptor, verdict);

        info!(
            selector = %descriptor.selector,
            strategy = ?verdict.strategy,
            confidence = verdict.confidence,
            "classified field"
        );
        self.stats.total_classified += 1;
        *self.stats.strategies.entry(verdict.strategy).or_default() += 1;
        *self.stats.complexities.entry(verdict.complexity).or_default() += 1;
        self.cache.insert(fingerprint, verdict.clone());
        verdict
    }

    async fn consult_oracle(
        &mut self,
        descriptor: &FieldDescriptor,
        context: &PageContext,
    ) -> Option<FieldVerdict> {
        let oracle = self.oracle.as_ref()?;
        let prompt = build_prompt(descriptor, context);
        self.stats.oracle_calls += 1;
        match oracle.complete(&prompt).await {
            Ok(raw) => {
                let parsed = parse_verdict(&raw, descriptor);
                if parsed.is_none() {
                    warn!(selector = %descriptor.selector, reply = %raw, "unusable oracle reply, falling back");
                }
                parsed
            }
            Err(e) => {
                warn!(selector = %descriptor.selector, error = %e, "oracle unavailable, falling back");
                None
            }
        }
    }

    pub fn stats(&self) -> &ClassificationStats {
        &self.stats
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
        info!("classification cache cleared");
    }

    /// Forgets verdicts and counters; called when a new session starts.
    pub fn reset(&mut self) {
        self.cache.clear();
        self.stats = ClassificationStats::default();
    }
}

pub fn build_prompt(descriptor: &FieldDescriptor, context: &PageContext) -> String {
    let attributes =
        serde_json::to_string_pretty(&descriptor.attributes).unwrap_or_else(|_| "{}".into());
    let nearby = if descriptor.nearby_text.is_empty() {
        "No nearby text".to_string()
    } else {
        descriptor.nearby_text.join(" | ")
    };
    let options = if descriptor.options.is_empty() {
        "none".to_string()
    } else {
        descriptor.options.join(" | ")
    };
    let completed = if context.completed_fields.is_empty() {
        "none yet".to_string()
    } else {
        context.completed_fields.join(", ")
    };

    format!(
        r#"Classify this job application form field and choose how to fill it.

FIELD:
- Tag: {tag}
- Type: {input_type}
- Selector: {selector}
- Label: "{label}"
- Placeholder: "{placeholder}"
- Required: {required}
- Options: {options}
- Attributes: {attributes}

PAGE:
- Title: "{title}"
- URL: {url}
- Forms on page: {form_count}
- Nearby text: {nearby}
- Already filled: {completed}
- Applicant profile available: {profile}
- Answer drafting available: {rag}

STRATEGIES:
- "simple_mapping": value comes straight from the applicant profile (name, email, phone, address)
- "rag_generation": value must be written (essays, cover letters, motivation questions)
- "option_selection": value must be one of the field's options (dropdowns, radio groups)
- "skip_field": do not fill (assessments, coding challenges, personality tests, out of scope)

COMPLEXITY: "trivial" | "simple" | "medium" | "complex" | "expert"

PROFILE KEYS:
- personal.first_name, personal.last_name, personal.full_name, personal.email, personal.phone
- personal.linkedin, personal.address, personal.work_authorization, personal.relocation
- education.school, education.degree, education.gpa
- experience.current_title, experience.current_company, experience.years_programming
- preferences.salary_expectation, preferences.start_date, preferences.remote_work

Respond with JSON only, in exactly this shape:
{{
  "fill_strategy": "simple_mapping|rag_generation|option_selection|skip_field",
  "complexity": "trivial|simple|medium|complex|expert",
  "confidence": 0.95,
  "reasoning": "why this strategy fits",
  "mapped_to": "personal.first_name or null",
  "requires_rag": false,
  "max_length": 500,
  "question_extracted": "the question being asked, for written answers",
  "priority": 75
}}"#,
        tag = descriptor.tag,
        input_type = if descriptor.input_type.is_empty() {
            "none"
        } else {
            descriptor.input_type.as_str()
        },
        selector = descriptor.selector,
        label = descriptor.label,
        placeholder = descriptor.placeholder,
        required = descriptor.required,
        title = context.title,
        url = context.url,
        form_count = context.form_count,
        profile = context.user_profile_available,
        rag = context.rag_available,
    )
}

/// Parses an oracle reply, trying the whole text first and then any embedded JSON object.
pub fn parse_verdict(raw: &str, descriptor: &FieldDescriptor) -> Option<FieldVerdict> {
    let cleaned = strip_fences(raw);
    if let Ok(value) = serde_json::from_str::<Value>(cleaned)
        && let Some(verdict) = verdict_from_json(&value, descriptor)
    {
        return Some(verdict);
    }
    json_fragments(raw)
        .into_iter()
        .find_map(|value| verdict_from_json(&value, descriptor))
}

fn verdict_from_json(value: &Value, descriptor: &FieldDescriptor) -> Option<FieldVerdict> {
    let obj = value.as_object()?;
    let text = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
    };

    let strategy = FillStrategy::parse(text("fill_strategy").or_else(|| text("strategy"))?)?;
    let complexity = match text("complexity") {
        Some(raw) => Complexity::parse(raw)?,
        None => default_complexity(strategy),
    };
    let confidence = number(obj.get("confidence")?)?;
    if !confidence.is_finite() {
        return None;
    }
    let max_length = obj
        .get("max_length")
        .and_then(number)
        .filter(|n| *n > 0.0)
        .map(|n| n as usize)
        .or_else(|| descriptor.max_length_attr());

    Some(FieldVerdict {
        strategy,
        complexity,
        confidence: confidence.clamp(0.0, 1.0),
        mapped_to: text("mapped_to").map(str::to_string),
        requires_rag: obj
            .get("requires_rag")
            .and_then(Value::as_bool)
            .unwrap_or(strategy == FillStrategy::RagGeneration),
        max_length,
        extracted_question: text("question_extracted").map(str::to_string),
        reasoning: text("reasoning").unwrap_or_default().to_string(),
        priority: obj
            .get("priority")
            .and_then(number)
            .map(|n| n as i32)
            .unwrap_or(50),
    })
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn default_complexity(strategy: FillStrategy) -> Complexity {
    match strategy {
        FillStrategy::SimpleMapping => Complexity::Simple,
        FillStrategy::OptionSelection => Complexity::Medium,
        FillStrategy::RagGeneration => Complexity::Complex,
        FillStrategy::SkipField => Complexity::Expert,
    }
}

/// Every balanced `{...}` object embedded in free text, in order of appearance.
fn json_fragments(text: &str) -> Vec<Value> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut start = 0;
    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut close = None;
        for (i, &b) in bytes.iter().enumerate().skip(open) {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        match close {
            Some(end) => {
                if let Ok(value @ Value::Object(_)) = serde_json::from_str(&text[open..=end]) {
                    found.push(value);
                    start = end + 1;
                } else {
                    start = open + 1;
                }
            }
            None => start = open + 1,
        }
    }
    found
}

fn flag_set(descriptor: &FieldDescriptor, name: &str) -> bool {
    descriptor
        .attr(name)
        .is_some_and(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "false" | "0"))
}

fn has_assessment_marker(descriptor: &FieldDescriptor) -> bool {
    ASSESSMENT_ATTRIBUTES
        .iter()
        .any(|name| flag_set(descriptor, name))
}

/// Fields explicitly marked as assessments are never filled, whoever classified them.
fn apply_assessment_guard(descriptor: &FieldDescriptor, verdict: FieldVerdict) -> FieldVerdict {
    if verdict.strategy == FillStrategy::SkipField || !flag_set(descriptor, "data-assessment") {
        return verdict;
    }
    FieldVerdict {
        strategy: FillStrategy::SkipField,
        complexity: Complexity::Expert,
        mapped_to: None,
        requires_rag: false,
        reasoning: format!("field carries data-assessment; overrode {:?}", verdict.strategy),
        priority: 5,
        ..verdict
    }
}

fn haystack(descriptor: &FieldDescriptor) -> String {
    [
        descriptor.label.as_str(),
        descriptor.placeholder.as_str(),
        descriptor.attr("name").unwrap_or_default(),
        descriptor.attr("id").unwrap_or_default(),
        descriptor.attr("aria-label").unwrap_or_default(),
    ]
    .into_iter()
    .chain(descriptor.nearby_text.iter().map(String::as_str))
    .filter(|s| !s.is_empty())
    .collect::<Vec<_>>()
    .join(" | ")
    .to_lowercase()
}

fn is_bare_name(descriptor: &FieldDescriptor) -> bool {
    [
        descriptor.label.as_str(),
        descriptor.placeholder.as_str(),
        descriptor.attr("name").unwrap_or_default(),
    ]
    .iter()
    .any(|s| s.trim().trim_end_matches(['*', ':']).trim().eq_ignore_ascii_case("name"))
}

fn rule(
    strategy: FillStrategy,
    complexity: Complexity,
    confidence: f64,
    mapped_to: Option<&str>,
    priority: i32,
    reasoning: &str,
) -> FieldVerdict {
    FieldVerdict {
        strategy,
        complexity,
        confidence,
        mapped_to: mapped_to.map(str::to_string),
        requires_rag: strategy == FillStrategy::RagGeneration,
        max_length: None,
        extracted_question: None,
        reasoning: format!("fallback: {reasoning}"),
        priority,
    }
}

/// Deterministic pattern ladder used whenever the oracle cannot answer.
///
/// Order: name, email, phone, job title, experience choice, GPA/school, essay
/// textarea, assessment, default.
pub fn fallback_verdict(descriptor: &FieldDescriptor) -> FieldVerdict {
    use FillStrategy::*;

    let text = haystack(descriptor);
    let input_type = descriptor.input_type.to_ascii_lowercase();
    let short_field = !descriptor.is_textarea();

    if short_field && FIRST_NAME.is_match(&text) {
        return rule(SimpleMapping, Complexity::Trivial, 0.75, Some("personal.first_name"), 80, "first name field");
    }
    if short_field && LAST_NAME.is_match(&text) {
        return rule(SimpleMapping, Complexity::Trivial, 0.75, Some("personal.last_name"), 80, "last name field");
    }
    if short_field && (FULL_NAME.is_match(&text) || is_bare_name(descriptor)) {
        return rule(SimpleMapping, Complexity::Trivial, 0.7, Some("personal.full_name"), 80, "full name field");
    }
    if short_field && (input_type == "email" || EMAIL.is_match(&text)) {
        return rule(SimpleMapping, Complexity::Trivial, 0.75, Some("personal.email"), 85, "email field");
    }
    if short_field && (input_type == "tel" || PHONE.is_match(&text)) {
        return rule(SimpleMapping, Complexity::Simple, 0.72, Some("personal.phone"), 75, "phone field");
    }
    if short_field && !descriptor.is_choice() && JOB_TITLE.is_match(&text) {
        return rule(SimpleMapping, Complexity::Simple, 0.7, Some("experience.current_title"), 70, "job title field");
    }
    if descriptor.is_choice() && EXPERIENCE.is_match(&text) {
        return rule(OptionSelection, Complexity::Medium, 0.7, Some("experience.years_programming"), 65, "experience choice");
    }
    if short_field && GPA.is_match(&text) {
        return rule(SimpleMapping, Complexity::Simple, 0.65, Some("education.gpa"), 60, "GPA field");
    }
    if short_field && SCHOOL.is_match(&text) {
        return rule(SimpleMapping, Complexity::Simple, 0.65, Some("education.school"), 60, "school field");
    }
    if descriptor.is_textarea() && ESSAY.is_match(&text) {
        let question = [descriptor.label.trim(), descriptor.placeholder.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(str::to_string);
        return FieldVerdict {
            max_length: Some(descriptor.max_length_attr().unwrap_or(DEFAULT_ESSAY_LENGTH)),
            extracted_question: question,
            ..rule(RagGeneration, Complexity::Complex, 0.65, None, 60, "essay-style textarea")
        };
    }
    if ASSESSMENT.is_match(&text) || has_assessment_marker(descriptor) {
        return rule(SkipField, Complexity::Expert, 0.78, None, 5, "assessment field");
    }
    rule(SimpleMapping, Complexity::Medium, 0.45, None, 50, "unrecognised field pattern")
}
