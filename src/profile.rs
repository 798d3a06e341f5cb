use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use crate::error::ConfigError;

/// Flat key → value view of the applicant's questionnaire (`personal.first_name`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileStore {
    entries: BTreeMap<String, String>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a questionnaire file. `.json` is parsed as JSON, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let value: Value = if is_json {
            serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            let table: toml::Table = toml::from_str(&raw).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::to_value(table).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?
        };
        Ok(Self::from_value(&value))
    }

    pub fn from_value(value: &Value) -> Self {
        let mut entries = BTreeMap::new();
        flatten("", value, &mut entries);
        Self { entries }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Empty values count as missing.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Compact `key: value` listing for prompts.
    pub fn render(&self) -> String {
        self.iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ProfileStore {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    let key = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        }
    };
    match value {
        Value::Object(map) => {
            for (name, child) in map {
                flatten(&key(name), child, out);
            }
        }
        Value::Array(items) => {
            let joined = items
                .iter()
                .map(scalar_text)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", ");
            out.insert(prefix.to_string(), joined);
        }
        Value::Null => {}
        other => {
            out.insert(prefix.to_string(), scalar_text(other));
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn nested_questionnaire_flattens_to_dotted_keys() {
        let store = ProfileStore::from_value(&json!({
            "personal": {"first_name": "Timothy", "phone": "555-123-4567"},
            "experience": {"years_programming": 6, "preferred_technologies": ["Rust", "Go"]},
            "preferences": {"start_date": ""}
        }));

        assert_eq!(store.get("personal.first_name"), Some("Timothy"));
        assert_eq!(store.get("experience.years_programming"), Some("6"));
        assert_eq!(
            store.get("experience.preferred_technologies"),
            Some("Rust, Go")
        );
        assert_eq!(store.get("preferences.start_date"), None);
        assert_eq!(store.get("personal.last_name"), None);
    }

    #[test]
    fn toml_questionnaire_loads() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[personal]\nfirst_name = \"Ada\"\nemail = \"ada@example.com\""
        )
        .unwrap();
        let store = ProfileStore::load(file.path()).unwrap();
        assert_eq!(store.get("personal.email"), Some("ada@example.com"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn json_questionnaire_loads() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"education": {{"gpa": 3.8}}}}"#).unwrap();
        let store = ProfileStore::load(file.path()).unwrap();
        assert_eq!(store.get("education.gpa"), Some("3.8"));
    }
}
