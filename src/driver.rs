use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::types::{Action, PageSnapshot};

/// The browser page the session owns exclusively for its lifetime.
///
/// Recoverable problems come back as `DriverError::Action` with the raw error
/// text; `DriverError::Fatal` ends the session.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn snapshot(&self) -> Result<PageSnapshot, DriverError>;

    /// `Ok(false)` means the step ran but had no effect.
    async fn execute(&self, action: &Action) -> Result<bool, DriverError>;

    /// Reads the field back. Returns whether it equals `expected` and the actual value.
    async fn verify(&self, selector: &str, expected: &str) -> Result<(bool, String), DriverError>;

    async fn wait_for_stability(&self, timeout: Duration) -> Result<(), DriverError>;

    async fn screenshot(&self, path: &Path) -> Result<(), DriverError>;
}
