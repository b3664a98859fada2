//! The cascade's floor: an immutable, non-self-modifiable call path
//! hardwired to one fixed provider. No store-held code is involved, so no
//! amount of self-modification can break this tier.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::errors::{EngineError, EngineResult};
use crate::llm::{LlmCompletion, LlmProvider, LlmRequest, LlmUsage};

const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct BuiltinProvider {
    client: reqwest::Client,
    base_url: String,
}

impl BuiltinProvider {
    pub fn new() -> EngineResult<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| EngineError::Provider(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiContent>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiContent {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[async_trait]
impl LlmProvider for BuiltinProvider {
    async fn complete(&self, request: &LlmRequest) -> EngineResult<LlmCompletion> {
        let api_key = std::env::var(API_KEY_ENV)
            .map_err(|_| EngineError::Provider(format!("{API_KEY_ENV} not set")))?;

        // System turns move to the dedicated field; the rest pass through.
        let mut system = String::new();
        let mut messages = Vec::new();
        for msg in &request.messages {
            if msg.role == "system" {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&msg.content);
            } else {
                messages.push(json!({"role": msg.role, "content": msg.content}));
            }
        }

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }

        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Provider(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .unwrap_or_else(|_| "unreadable response body".to_string());
        if !status.is_success() {
            return Err(EngineError::Provider(format!(
                "API request failed ({status}): {raw}"
            )));
        }

        let parsed: ApiResponse = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Provider(format!("failed to parse response: {e}")))?;
        let content = parsed
            .content
            .first()
            .map(|c| c.text.clone())
            .ok_or_else(|| EngineError::Provider("response missing content".to_string()))?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(LlmCompletion {
            content,
            usage: LlmUsage {
                prompt_tokens: usage.input_tokens,
                completion_tokens: usage.output_tokens,
            },
            cost_usd: None,
        })
    }
}
