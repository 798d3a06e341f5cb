use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Everything the engine needs, passed in at construction. No globals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: SessionConfig,
    pub gate: GateThresholds,
    pub oracle: OracleConfig,
    pub browser: BrowserConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub auto_submit: bool,
    pub max_retries: u32,
    pub max_cycles: u32,
    pub session_timeout_secs: u64,
    /// Pause between browser actions; jittered by up to 50%.
    pub action_delay_ms: u64,
    pub artifacts_dir: PathBuf,
    pub write_journal: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_submit: false,
            max_retries: 2,
            max_cycles: 10,
            session_timeout_secs: 900,
            action_delay_ms: 350,
            artifacts_dir: default_artifacts_dir(),
            write_journal: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GateThresholds {
    pub min_completion: f64,
    pub min_success_rate: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            min_completion: 0.90,
            min_success_rate: 0.95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            max_tokens: 500,
            max_attempts: 3,
            retry_delay_ms: 1000,
            timeout_secs: 30,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

impl OracleConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    /// DevTools endpoint of an already running Chrome to attach to.
    pub attach_url: Option<String>,
    pub user_data_dir: Option<PathBuf>,
    pub stability_timeout_ms: u64,
    pub navigation_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            attach_url: Some("http://127.0.0.1:9222".to_string()),
            user_data_dir: None,
            stability_timeout_ms: 3000,
            navigation_timeout_ms: 30_000,
        }
    }
}

fn default_artifacts_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("job-form-agent")
}

impl AgentConfig {
    /// Loads a TOML file if given, otherwise returns defaults. Always validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Toml {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.gate.min_completion) || !in_unit(self.gate.min_success_rate) {
            return Err(ConfigError::Validation(
                "gate thresholds must lie in [0, 1]".to_string(),
            ));
        }
        if self.agent.max_cycles == 0 {
            return Err(ConfigError::Validation(
                "max_cycles must be at least 1".to_string(),
            ));
        }
        if self.oracle.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "oracle.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
