pub mod brain;
pub mod classifier;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod gate;
pub mod journal;
pub mod machine;
pub mod orchestrator;
pub mod profile;
pub mod repair;
pub mod review;
pub mod session;
pub mod types;
pub mod verify;

pub use brain::{Brain, Drafter, Oracle};
pub use classifier::ClassificationEngine;
pub use config::AgentConfig;
pub use driver::BrowserDriver;
pub use error::{AgentError, ConfigError, DriverError, OracleError};
pub use orchestrator::{Orchestrator, SessionReport};
pub use profile::ProfileStore;
pub use review::HumanDecision;
pub use session::SessionState;
pub use types::{FieldDescriptor, FieldVerdict, FillStrategy, FinalState, PageContext};
