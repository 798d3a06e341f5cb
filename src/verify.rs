//! Read-back tolerance: when does the value in the field count as the value we typed?

use serde::Serialize;

use crate::types::FieldDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    Text,
    Email,
    Phone,
}

impl ValueFormat {
    pub fn of(descriptor: &FieldDescriptor, mapped_to: Option<&str>) -> Self {
        let input_type = descriptor.input_type.to_ascii_lowercase();
        let key = mapped_to.unwrap_or_default().to_ascii_lowercase();
        if input_type == "email" || key.ends_with("email") {
            Self::Email
        } else if input_type == "tel" || key.ends_with("phone") {
            Self::Phone
        } else {
            Self::Text
        }
    }
}

/// Which tolerance rule accepted the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    Exact,
    CaseInsensitive,
    Containment,
    NormalizedPhone,
    NormalizedEmail,
}

/// Applies the rules in order: exact, case-insensitive, containment either way,
/// then format-normalised comparison for phone and email fields.
///
/// Containment accepts truncated fields and short values inside longer option
/// text ("US" in "US Citizen"), but also overlapping wrong values ("Tim" for
/// "Timothy"). An empty side never matches.
pub fn check(expected: &str, actual: &str, format: ValueFormat) -> Option<MatchRule> {
    let expected = expected.trim();
    let actual = actual.trim();

    if expected == actual {
        return Some(MatchRule::Exact);
    }
    let (exp_lower, act_lower) = (expected.to_lowercase(), actual.to_lowercase());
    if exp_lower == act_lower {
        return Some(MatchRule::CaseInsensitive);
    }
    if !expected.is_empty()
        && !actual.is_empty()
        && (exp_lower.contains(&act_lower) || act_lower.contains(&exp_lower))
    {
        return Some(MatchRule::Containment);
    }
    match format {
        ValueFormat::Phone => {
            let (e, a) = (phone_digits(expected), phone_digits(actual));
            (!e.is_empty() && e == a).then_some(MatchRule::NormalizedPhone)
        }
        ValueFormat::Email => {
            let strip = |s: &str| s.replace(['.', '_'], "");
            (!exp_lower.is_empty() && strip(&exp_lower) == strip(&act_lower))
                .then_some(MatchRule::NormalizedEmail)
        }
        ValueFormat::Text => None,
    }
}

/// Digits only, with a leading US country code dropped.
fn phone_digits(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    match digits.strip_prefix('1') {
        Some(rest) if digits.len() == 11 => rest.to_string(),
        _ => digits,
    }
}
