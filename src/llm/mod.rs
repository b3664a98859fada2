//! Generative-call path: normalized request/response types, the provider
//! seam, and the three-tier resilience cascade built on it.

pub mod builtin;
pub mod cascade;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::EngineResult;
use crate::types::Effort;

pub use builtin::BuiltinProvider;
pub use cascade::ProviderCascade;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thinking {
    pub effort: Effort,
}

/// Normalized generative-call request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<LlmMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Thinking>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCompletion {
    pub content: String,
    #[serde(default)]
    pub usage: LlmUsage,
    /// Estimated from the model registry; `None` for unrecognized models.
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

/// One concrete way of completing a request. The cascade's immutable floor
/// implements this; tests substitute scripted impls.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> EngineResult<LlmCompletion>;
}

/// Pull a structured object out of model text, tolerating surrounding prose
/// or markdown fencing: everything from the first `{` to the last `}`.
pub fn extract_json<T: serde::de::DeserializeOwned>(text: &str) -> EngineResult<T> {
    let start = text
        .find('{')
        .ok_or_else(|| crate::errors::EngineError::PlanMalformed("no JSON object in output".to_string()))?;
    let end = text
        .rfind('}')
        .map(|i| i + 1)
        .filter(|&end| end > start)
        .ok_or_else(|| crate::errors::EngineError::PlanMalformed("unterminated JSON object".to_string()))?;
    serde_json::from_str(&text[start..end])
        .map_err(|e| crate::errors::EngineError::PlanMalformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_tolerates_prose_and_fences() {
        let text = "Here is the plan:\n```json\n{\"steps\": []}\n```\nGood luck!";
        let plan: crate::types::Plan = extract_json(text).unwrap();
        assert!(plan.steps.is_empty());
    }

    #[test]
    fn extract_json_rejects_non_objects() {
        assert!(extract_json::<crate::types::Plan>("no json here").is_err());
        assert!(extract_json::<crate::types::Plan>("{\"steps\": oops}").is_err());
    }
}
