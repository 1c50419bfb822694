//! Default model transport: OpenRouter chat completions.
//!
//! The engine only ever talks to the `ModelClient` trait; this is the
//! bundled implementation. Includes automatic retry with exponential
//! backoff for rate limits.

use crate::protocol::{ModelClient, PromptRole};
use crate::util::ellipsize;
use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;

/// OpenRouter direct API URL (BYOK mode)
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000; // 2 seconds
const BACKOFF_MULTIPLIER: u64 = 2; // Exponential backoff

/// Maximum tokens for all model tiers
const MODEL_MAX_TOKENS: u32 = 16384;

/// Model tiers by task difficulty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Best reasoning - first-pass test generation.
    Smart,
    /// Good reasoning at medium cost - targeted corrections.
    Balanced,
}

impl ModelTier {
    pub fn id(&self) -> &'static str {
        match self {
            ModelTier::Smart => "anthropic/claude-opus-4.5",
            ModelTier::Balanced => "anthropic/claude-sonnet-4.5",
        }
    }

    fn for_role(role: PromptRole) -> Self {
        match role {
            PromptRole::Generation => ModelTier::Smart,
            PromptRole::Correction => ModelTier::Balanced,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

fn retry_after_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)retry\D{0,24}?(\d+)").unwrap())
}

/// Retry-after hint in an OpenRouter error body, when one is present.
/// Implausibly long waits are ignored in favor of our own backoff.
fn parse_retry_after(text: &str) -> Option<u64> {
    let secs: u64 = retry_after_regex()
        .captures(text)?
        .get(1)?
        .as_str()
        .parse()
        .ok()?;
    (secs > 0 && secs < 300).then_some(secs)
}

/// OpenRouter-backed `ModelClient`. The API key is injected explicitly;
/// there is no ambient credential lookup.
pub struct OpenRouterClient {
    api_key: String,
    client: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn call(&self, system: &str, user: &str, tier: ModelTier) -> Result<String> {
        let request = ChatRequest {
            model: tier.id().to_string(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens: MODEL_MAX_TOKENS,
            stream: false,
        };

        let mut last_error = String::new();
        let mut retry_count = 0;

        while retry_count <= MAX_RETRIES {
            let response = self
                .client
                .post(OPENROUTER_URL)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            let text = response.text().await?;

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text)
                    .map_err(|e| anyhow!("Failed to parse OpenRouter response: {}\n{}", e, text))?;

                return parsed
                    .choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .ok_or_else(|| anyhow!("OpenRouter response contained no choices"));
            }

            last_error = text.clone();

            // Rate limits are the only retryable failure.
            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let retry_after = parse_retry_after(&text).unwrap_or_else(|| {
                    (INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count - 1)) / 1000
                });
                tokio::time::sleep(tokio::time::Duration::from_secs(retry_after)).await;
                continue;
            }

            return Err(anyhow!(
                "OpenRouter request failed with status {}: {}",
                status,
                ellipsize(&last_error, 500)
            ));
        }

        Err(anyhow!(
            "OpenRouter rate limited after {} retries: {}",
            MAX_RETRIES,
            ellipsize(&last_error, 500)
        ))
    }
}

impl ModelClient for OpenRouterClient {
    fn complete<'a>(
        &'a self,
        system: &'a str,
        user: &'a str,
        role: PromptRole,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move { self.call(system, user, ModelTier::for_role(role)).await })
    }
}
