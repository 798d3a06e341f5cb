mod dom;
mod hands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use dotenvy::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use job_form_agent::review::{self, HumanDecision};
use job_form_agent::session::SessionState;
use job_form_agent::types::FinalState;
use job_form_agent::{AgentConfig, Brain, Drafter, Oracle, Orchestrator, ProfileStore};

/// Fill a job application form in the browser.
#[derive(Debug, Parser)]
#[command(name = "agent", version)]
struct Args {
    /// Application page to open. Omit when resuming.
    url: Option<String>,

    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Applicant questionnaire (TOML or JSON).
    #[arg(short, long)]
    profile: Option<PathBuf>,

    /// Submit the form once the completion gate passes.
    #[arg(long)]
    auto_submit: bool,

    #[arg(long)]
    headless: bool,

    /// Session snapshot written when the previous run paused for review.
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Reviewer decision for a resumed session: `skip`, `retry` or `fill:<value>`.
    #[arg(long, default_value = "retry")]
    decision: String,
}

fn parse_decision(raw: &str) -> Result<HumanDecision> {
    match raw.split_once(':') {
        Some(("fill", value)) => Ok(HumanDecision::Fill(value.to_string())),
        None if raw == "skip" => Ok(HumanDecision::Skip),
        None if raw == "retry" => Ok(HumanDecision::Retry),
        _ => bail!("unknown decision {raw:?}; expected skip, retry or fill:<value>"),
    }
}

/// Where the paused session last was; the form may sit behind a redirect from the start URL.
fn resume_page(state: &SessionState) -> &str {
    if state.context.url.is_empty() {
        &state.url
    } else {
        &state.context.url
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,job_form_agent=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = AgentConfig::load(args.config.as_deref())?;
    if args.auto_submit {
        config.agent.auto_submit = true;
    }
    if args.headless {
        config.browser.headless = true;
    }

    let profile = match &args.profile {
        Some(path) => ProfileStore::load(path)?,
        None => ProfileStore::new(),
    };
    if profile.is_empty() {
        warn!("applicant profile is empty; only drafted answers can be filled");
    } else {
        info!(entries = profile.len(), "profile loaded");
    }

    // Launching Chrome blocks for a while
    let browser_config = config.browser.clone();
    let driver = tokio::task::spawn_blocking(move || hands::ChromeDriver::launch(&browser_config))
        .await
        .map_err(|e| anyhow!("browser launch panicked: {e}"))??;
    let driver = Arc::new(driver);

    let brain = match Brain::new(config.oracle.clone()) {
        Ok(brain) => Some(Arc::new(brain)),
        Err(e) => {
            warn!(error = %e, "no language model; classifying with keyword rules only");
            None
        }
    };
    let oracle = brain.clone().map(|b| b as Arc<dyn Oracle>);
    let drafter = brain.map(|b| b as Arc<dyn Drafter>);

    let mut orchestrator = Orchestrator::new(config, driver.clone(), profile, oracle, drafter);

    let report = match (&args.resume, &args.url) {
        (Some(snapshot), _) => {
            let state = review::load_snapshot(snapshot)?;
            let decision = parse_decision(&args.decision)?;
            let page = resume_page(&state);
            if driver.current_url().await? != page {
                info!(url = %page, "reopening the paused page");
                driver.navigate(page).await?;
            }
            info!(url = %state.url, "resuming paused session");
            orchestrator.resume(state, decision).await
        }
        (None, Some(url)) => {
            driver.navigate(url).await?;
            orchestrator.run(url).await
        }
        (None, None) => bail!("give an application URL or --resume <snapshot>"),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Some(request) = &report.review
        && let Some(path) = &request.snapshot
    {
        info!(snapshot = %path.display(), "resume with --resume once the form is reviewed");
    }
    if report.final_state == FinalState::Error {
        bail!(
            "session failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
