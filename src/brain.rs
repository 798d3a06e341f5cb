use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::OracleConfig;
use crate::error::OracleError;
use crate::profile::ProfileStore;

const CLASSIFIER_SYSTEM_PROMPT: &str = "You are an expert system for analyzing web form fields in job applications. \
You must respond with valid JSON only, no additional text or explanation. \
Your task is to classify fields and determine the best filling strategy.";

const DRAFTER_SYSTEM_PROMPT: &str = r#"You write answers to job application questions on behalf of the applicant.

Rules:
1. Write in the first person, as the applicant.
2. Use ONLY facts present in the applicant profile. Never invent employers, dates, or degrees.
3. Plain text only. No markdown, no headings, no bullet points.
4. Stay under the character limit you are given."#;

/// The language-model service consulted for field classification.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Returns the raw reply text. It may or may not be valid JSON.
    async fn complete(&self, prompt: &str) -> Result<String, OracleError>;
}

/// Produces free-text answers for essay-style fields.
#[async_trait]
pub trait Drafter: Send + Sync {
    async fn draft_answer(
        &self,
        question: &str,
        profile: &ProfileStore,
        max_length: usize,
    ) -> Result<String, OracleError>;
}

/// OpenAI-compatible chat-completions client.
pub struct Brain {
    client: Client,
    api_key: String,
    config: OracleConfig,
}

impl Brain {
    pub fn new(config: OracleConfig) -> Result<Self, OracleError> {
        let api_key = config.api_key().ok_or(OracleError::NotConfigured)?;
        Self::with_key(config, api_key)
    }

    pub fn with_key(config: OracleConfig, api_key: String) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    /// One chat round-trip with the retry budget applied.
    ///
    /// 429 backs off linearly, 5xx and transport errors wait a fixed delay,
    /// any other status gives up immediately.
    async fn chat(&self, system: &str, user: &str) -> Result<String, OracleError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut last = String::from("no attempt made");

        for attempt in 0..self.config.max_attempts {
            debug!(attempt = attempt + 1, model = %self.config.model, "oracle request");
            let response = match self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "oracle transport error");
                    last = e.to_string();
                    if attempt + 1 < self.config.max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                    continue;
                }
            };

            let status = response.status();
            let text = response.text().await?;
            let json_resp: serde_json::Value =
                serde_json::from_str(&text).unwrap_or(serde_json::Value::Null);

            if !status.is_success() {
                let err_msg = json_resp["error"]["message"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| truncate_chars(&text, 200));
                warn!(status = status.as_u16(), error = %err_msg, "oracle API error");
                last = format!("HTTP {}: {}", status.as_u16(), err_msg);
                if status.as_u16() == 429 {
                    tokio::time::sleep(delay * (attempt + 1)).await;
                    continue;
                }
                if status.is_server_error() {
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(OracleError::Status {
                    status: status.as_u16(),
                    message: err_msg,
                });
            }

            return extract_content(&json_resp);
        }

        Err(OracleError::Exhausted {
            attempts: self.config.max_attempts,
            last,
        })
    }
}

#[async_trait]
impl Oracle for Brain {
    async fn complete(&self, prompt: &str) -> Result<String, OracleError> {
        let content = self.chat(CLASSIFIER_SYSTEM_PROMPT, prompt).await?;
        debug!(reply = %content, "oracle replied");
        Ok(strip_fences(&content).to_string())
    }
}

#[async_trait]
impl Drafter for Brain {
    async fn draft_answer(
        &self,
        question: &str,
        profile: &ProfileStore,
        max_length: usize,
    ) -> Result<String, OracleError> {
        let prompt = format!(
            "Applicant profile:\n{}\n\nQuestion: {}\n\nAnswer in at most {} characters.",
            profile.render(),
            question,
            max_length
        );
        let draft = self.chat(DRAFTER_SYSTEM_PROMPT, &prompt).await?;
        let draft = truncate_chars(draft.trim(), max_length);
        info!(chars = draft.chars().count(), "drafted answer");
        Ok(draft)
    }
}

fn extract_content(json_resp: &serde_json::Value) -> Result<String, OracleError> {
    json_resp["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| OracleError::EmptyContent(json_resp.to_string()))
}

/// Strips the markdown fences models like to wrap JSON in.
pub fn strip_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
