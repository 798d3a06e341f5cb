use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{debug, info, warn};

use job_form_agent::config::BrowserConfig;
use job_form_agent::driver::BrowserDriver;
use job_form_agent::error::DriverError;
use job_form_agent::types::{Action, ActionKind, PageSnapshot};

use crate::dom;

const SETTLE_POLL: Duration = Duration::from_millis(200);

/// Plain Chrome; the browser identifies itself as automated.
const LAUNCH_ARGS: &[&str] = &[
    "--no-first-run",
    "--no-default-browser-check",
    "--password-store=basic",
];

/// Browser page driven through the DevTools protocol. One per session.
pub struct ChromeDriver {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeDriver {
    /// Attaches to a running Chrome when possible, otherwise launches one. Blocking.
    pub fn launch(config: &BrowserConfig) -> Result<Self> {
        if let Some(url) = &config.attach_url {
            info!(url = %url, "attempting to attach to existing Chrome");
            match Browser::connect(url.clone()) {
                Ok(browser) => {
                    let existing = {
                        let tabs = browser.get_tabs();
                        let tabs = tabs.lock().map_err(|_| anyhow!("tab list poisoned"))?;
                        tabs.first().cloned()
                    };
                    let tab = match existing {
                        Some(tab) => tab,
                        None => browser.new_tab()?,
                    };
                    info!("attached to existing Chrome");
                    return Ok(Self::ready(browser, tab, config));
                }
                Err(e) => warn!(error = %e, "could not attach, launching a new browser"),
            }
        }

        let options = LaunchOptions {
            headless: config.headless,
            user_data_dir: config.user_data_dir.clone(),
            args: LAUNCH_ARGS.iter().map(OsStr::new).collect(),
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };
        let browser = Browser::new(options).map_err(|e| anyhow!("browser launch failed: {e}"))?;
        let tab = browser.new_tab()?;
        info!(headless = config.headless, "Chrome launched");
        Ok(Self::ready(browser, tab, config))
    }

    fn ready(browser: Browser, tab: Arc<Tab>, config: &BrowserConfig) -> Self {
        tab.set_default_timeout(Duration::from_millis(config.navigation_timeout_ms));
        Self {
            _browser: browser,
            tab,
        }
    }

    pub async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            tab.wait_for_element("body")?;
            Ok(())
        })
        .await
    }

    pub async fn current_url(&self) -> Result<String, DriverError> {
        self.blocking(|tab| Ok(tab.get_url())).await
    }

    /// Runs a blocking CDP call off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Tab>) -> Result<T> + Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(tab))
            .await
            .map_err(|e| DriverError::Fatal(format!("browser task panicked: {e}")))?
            .map_err(classify)
    }
}

/// A closed DevTools connection cannot be retried; everything else is the page's problem.
fn classify(err: anyhow::Error) -> DriverError {
    let text = format!("{err:#}");
    let lower = text.to_lowercase();
    if ["connection is closed", "connection closed", "browser closed", "target closed"]
        .iter()
        .any(|k| lower.contains(k))
    {
        DriverError::Fatal(text)
    } else {
        DriverError::Action(text)
    }
}

fn required_value(action: &Action) -> Result<String> {
    action
        .value
        .clone()
        .ok_or_else(|| anyhow!("{:?} on {} has no value", action.kind, action.selector))
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn snapshot(&self) -> Result<PageSnapshot, DriverError> {
        self.blocking(|tab| dom::capture_snapshot(&tab)).await
    }

    async fn execute(&self, action: &Action) -> Result<bool, DriverError> {
        if let Some(ms) = action.wait_ms() {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(true);
        }
        debug!(kind = ?action.kind, selector = %action.selector, "executing");
        let action = action.clone();
        self.blocking(move |tab| match action.kind {
            ActionKind::Click => {
                tab.find_element(&action.selector)?.click()?;
                Ok(true)
            }
            ActionKind::Type => {
                let text = required_value(&action)?;
                let el = tab.find_element(&action.selector)?;
                el.click()?;
                tab.evaluate(
                    &format!(
                        "document.querySelector('{}').value = ''",
                        dom::js_string(&action.selector)
                    ),
                    false,
                )?;
                tab.type_str(&text)?;
                Ok(true)
            }
            ActionKind::Select => {
                let wanted = required_value(&action)?;
                dom::select_option(&tab, &action.selector, &wanted)
            }
            ActionKind::Upload => {
                let file = required_value(&action)?;
                if !Path::new(&file).exists() {
                    anyhow::bail!("invalid upload: {file} does not exist");
                }
                tab.find_element(&action.selector)?
                    .set_input_files(&[file.as_str()])?;
                Ok(true)
            }
            ActionKind::Wait => Ok(true),
        })
        .await
    }

    async fn verify(&self, selector: &str, expected: &str) -> Result<(bool, String), DriverError> {
        let selector = selector.to_string();
        let expected = expected.to_string();
        self.blocking(move |tab| {
            let actual = dom::read_value(&tab, &selector)?;
            Ok((actual == expected, actual))
        })
        .await
    }

    async fn wait_for_stability(&self, timeout: Duration) -> Result<(), DriverError> {
        self.blocking(move |tab| {
            let started = Instant::now();
            loop {
                let state = tab
                    .evaluate("document.readyState", false)?
                    .value
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default();
                if state == "complete" {
                    return Ok(());
                }
                if started.elapsed() >= timeout {
                    anyhow::bail!("timed out waiting for the page to settle (readyState {state})");
                }
                std::thread::sleep(SETTLE_POLL);
            }
        })
        .await
    }

    async fn screenshot(&self, path: &Path) -> Result<(), DriverError> {
        let path = path.to_path_buf();
        self.blocking(move |tab| {
            let png = tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, png)?;
            Ok(())
        })
        .await
    }
}
