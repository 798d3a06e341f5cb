//! Error types for the collaborator seams.
//!
//! Expected failures (a field that will not take a value, an oracle that is
//! down) travel as values in `ActionOutcome` / `FieldVerdict`. These enums are
//! for the cases that genuinely break a call.

use std::path::PathBuf;

use thiserror::Error;

use crate::machine::{Phase, RouteKey};

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("oracle request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("oracle response had no content: {0}")]
    EmptyContent(String),

    #[error("oracle not configured")]
    NotConfigured,

    #[error("oracle gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

#[derive(Debug, Error)]
pub enum DriverError {
    /// The action did not take effect; the text is classified into a `FailureKind`.
    #[error("action failed: {0}")]
    Action(String),

    /// The browser itself is gone or unusable.
    #[error("browser unavailable: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("browser fault: {0}")]
    Driver(#[from] DriverError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("no transition from {phase:?} on {key:?}")]
    InvalidTransition { phase: Phase, key: RouteKey },

    #[error("failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}
