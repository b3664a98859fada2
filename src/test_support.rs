//! Shared mocks for unit and integration tests (behind the `test-support`
//! feature; never compiled into release builds).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{EngineError, EngineResult};
use crate::llm::{LlmCompletion, LlmProvider, LlmRequest, LlmUsage};
use crate::sandbox::{CapabilityMeta, SandboxRuntime, ScopedKv};

/// Sandbox runtime that treats capability code as a JSON literal and returns
/// it as the result. The literal string `FAIL` fails. Every invocation is
/// recorded.
pub struct ToolRuntime {
    calls: Mutex<Vec<(String, Value)>>,
}

impl ToolRuntime {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls_to(&self, capability: &str) -> Vec<Value> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|(name, _)| name == capability)
            .map(|(_, input)| input.clone())
            .collect()
    }
}

#[async_trait]
impl SandboxRuntime for ToolRuntime {
    fn name(&self) -> &str {
        "tool-test"
    }

    async fn run(
        &self,
        capability: &str,
        code: &str,
        _meta: &CapabilityMeta,
        input: Value,
        _secrets: serde_json::Map<String, Value>,
        _kv: Option<ScopedKv>,
    ) -> EngineResult<Value> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((capability.to_string(), input));
        if code == "FAIL" {
            return Err(EngineError::Sandbox {
                capability: capability.to_string(),
                reason: "told to fail".to_string(),
            });
        }
        serde_json::from_str(code).map_err(EngineError::from)
    }
}

/// Scripted completions with a fixed 20/10 token usage per call. Captures
/// every request it receives.
pub struct ScriptedLlm {
    replies: Mutex<Vec<Result<String, String>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(replies: Vec<Result<String, String>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete(&self, request: &LlmRequest) -> EngineResult<LlmCompletion> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let mut replies = self.replies.lock().expect("replies lock");
        if replies.is_empty() {
            return Err(EngineError::Provider("script exhausted".to_string()));
        }
        match replies.remove(0) {
            Ok(content) => Ok(LlmCompletion {
                content,
                usage: LlmUsage {
                    prompt_tokens: 20,
                    completion_tokens: 10,
                },
                cost_usd: None,
            }),
            Err(e) => Err(EngineError::Provider(e)),
        }
    }
}
