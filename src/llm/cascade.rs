//! Three-tier provider cascade.
//!
//! Tier 1 is the self-modifiable adapter held in the store; tier 2 is a
//! last-known-good snapshot of it, refreshed at most once per session on
//! tier 1's first success (a freshly broken tier 1 can never also corrupt
//! tier 2); tier 3 is the immutable built-in call path. If every tier fails
//! and the requested model is not already the configured fallback model, the
//! whole cascade runs once more against the fallback model at minimum
//! effort. Every tier transition is recorded to the flight recorder with the
//! failing tier's error.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::capability::CapabilityHost;
use crate::config::ModelRegistry;
use crate::errors::{EngineError, EngineResult};
use crate::karma::{KarmaEventKind, KarmaLedger};
use crate::llm::{LlmCompletion, LlmProvider, LlmRequest, LlmUsage, Thinking};
use crate::sandbox::{CapabilityMeta, SandboxRuntime};
use crate::store::{keys, Store};
use crate::types::Effort;

/// Identifier the adapter runs under; scopes its private store namespace.
const ADAPTER_IDENT: &str = "provider:llm";

pub struct ProviderCascade {
    store: Store,
    host: CapabilityHost,
    builtin: Arc<dyn LlmProvider>,
    models: ModelRegistry,
    fallback_model: String,
    snapshot_taken: bool,
}

/// What adapter code must return.
#[derive(Debug, Deserialize)]
struct AdapterReply {
    content: String,
    #[serde(default)]
    usage: Option<LlmUsage>,
}

impl ProviderCascade {
    pub fn new(
        store: Store,
        runtime: Arc<dyn SandboxRuntime>,
        builtin: Arc<dyn LlmProvider>,
        models: ModelRegistry,
        fallback_model: String,
    ) -> Self {
        let host = CapabilityHost::new(store.clone(), runtime);
        Self {
            store,
            host,
            builtin,
            models,
            fallback_model,
            snapshot_taken: false,
        }
    }

    /// Complete a request, masking transient tier failure. Only a full
    /// cascade failure on the fallback model surfaces as an error.
    pub async fn complete(
        &mut self,
        ledger: &mut KarmaLedger,
        request: &LlmRequest,
    ) -> EngineResult<LlmCompletion> {
        match self.cascade_once(ledger, request).await {
            Ok(completion) => Ok(completion),
            Err(err) if request.model != self.fallback_model => {
                ledger
                    .record(
                        KarmaEventKind::LlmModelFallback,
                        json!({
                            "from": request.model,
                            "to": self.fallback_model,
                            "error": err.to_string(),
                        }),
                    )
                    .await?;
                let mut demoted = request.clone();
                demoted.model = self.fallback_model.clone();
                demoted.thinking = Some(Thinking {
                    effort: Effort::Low,
                });
                self.cascade_once(ledger, &demoted).await
            }
            Err(err) => Err(err),
        }
    }

    async fn cascade_once(
        &mut self,
        ledger: &mut KarmaLedger,
        request: &LlmRequest,
    ) -> EngineResult<LlmCompletion> {
        // Tier 1: the live adapter.
        match self.load_adapter(keys::PROVIDER_CODE, keys::PROVIDER_META).await? {
            Some((code, meta)) => match self.run_adapter(&code, &meta, request).await {
                Ok(completion) => {
                    self.maybe_snapshot(&code, &meta).await;
                    return self.finish(ledger, request, completion, "adapter").await;
                }
                Err(err) => {
                    self.record_tier_fallback(ledger, "adapter", &err.to_string())
                        .await?;
                }
            },
            None => {
                self.record_tier_fallback(ledger, "adapter", "not configured")
                    .await?;
            }
        }

        // Tier 2: last-known-good snapshot of the adapter.
        match self
            .load_adapter(keys::PROVIDER_SNAPSHOT_CODE, keys::PROVIDER_SNAPSHOT_META)
            .await?
        {
            Some((code, meta)) => match self.run_adapter(&code, &meta, request).await {
                Ok(completion) => {
                    return self.finish(ledger, request, completion, "snapshot").await;
                }
                Err(err) => {
                    self.record_tier_fallback(ledger, "snapshot", &err.to_string())
                        .await?;
                }
            },
            None => {
                self.record_tier_fallback(ledger, "snapshot", "no snapshot")
                    .await?;
            }
        }

        // Tier 3: the floor.
        match self.builtin.complete(request).await {
            Ok(completion) => self.finish(ledger, request, completion, "builtin").await,
            Err(err) => {
                self.record_tier_fallback(ledger, "builtin", &err.to_string())
                    .await?;
                Err(EngineError::Provider(format!(
                    "all tiers failed for model '{}': {err}",
                    request.model
                )))
            }
        }
    }

    async fn load_adapter(
        &self,
        code_key: &str,
        meta_key: &str,
    ) -> EngineResult<Option<(String, CapabilityMeta)>> {
        let Some(code) = self.store.get_text(code_key).await? else {
            return Ok(None);
        };
        let meta = self
            .store
            .get_json::<CapabilityMeta>(meta_key)
            .await?
            .unwrap_or_default();
        Ok(Some((code, meta)))
    }

    async fn run_adapter(
        &self,
        code: &str,
        meta: &CapabilityMeta,
        request: &LlmRequest,
    ) -> EngineResult<LlmCompletion> {
        let raw = self
            .host
            .invoke_dynamic(ADAPTER_IDENT, code, meta, json!({ "request": request }))
            .await?;
        let reply: AdapterReply = serde_json::from_value(raw).map_err(|e| {
            EngineError::Provider(format!("adapter returned malformed completion: {e}"))
        })?;
        Ok(LlmCompletion {
            content: reply.content,
            usage: reply.usage.unwrap_or_default(),
            cost_usd: None,
        })
    }

    /// Snapshot the adapter that just succeeded, once per session.
    async fn maybe_snapshot(&mut self, code: &str, meta: &CapabilityMeta) {
        if self.snapshot_taken {
            return;
        }
        self.snapshot_taken = true;
        let code_write = self
            .store
            .put(keys::PROVIDER_SNAPSHOT_CODE, &json!(code))
            .await;
        let meta_write = self.store.put_json(keys::PROVIDER_SNAPSHOT_META, meta).await;
        if let Err(e) = code_write.and(meta_write) {
            // A failed snapshot must not fail the call that just succeeded.
            tracing::warn!(error = %e, "failed to refresh provider snapshot");
        }
    }

    async fn record_tier_fallback(
        &self,
        ledger: &mut KarmaLedger,
        tier: &str,
        error: &str,
    ) -> EngineResult<()> {
        tracing::warn!(tier, error, "provider tier failed");
        ledger
            .record(
                KarmaEventKind::LlmTierFallback,
                json!({ "tier": tier, "error": error }),
            )
            .await
    }

    async fn finish(
        &self,
        ledger: &mut KarmaLedger,
        request: &LlmRequest,
        mut completion: LlmCompletion,
        tier: &str,
    ) -> EngineResult<LlmCompletion> {
        completion.cost_usd = self.models.estimate(
            &request.model,
            completion.usage.prompt_tokens,
            completion.usage.completion_tokens,
        );
        ledger
            .record(
                KarmaEventKind::LlmCall,
                json!({
                    "model": request.model,
                    "tier": tier,
                    "prompt_tokens": completion.usage.prompt_tokens,
                    "completion_tokens": completion.usage.completion_tokens,
                    "cost_usd": completion.cost_usd,
                }),
            )
            .await?;
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ScopedKv, SandboxRuntime};
    use crate::store::FileKvStore;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    /// Interprets the "code" string as a directive: `ok:<text>` succeeds,
    /// anything else fails with the code as the reason.
    struct DirectiveRuntime;

    #[async_trait]
    impl SandboxRuntime for DirectiveRuntime {
        fn name(&self) -> &str {
            "directive"
        }

        async fn run(
            &self,
            capability: &str,
            code: &str,
            _meta: &CapabilityMeta,
            _input: Value,
            _secrets: serde_json::Map<String, Value>,
            _kv: Option<ScopedKv>,
        ) -> EngineResult<Value> {
            match code.strip_prefix("ok:") {
                Some(text) => Ok(json!({
                    "content": text,
                    "usage": {"prompt_tokens": 10, "completion_tokens": 5}
                })),
                None => Err(EngineError::Sandbox {
                    capability: capability.to_string(),
                    reason: code.to_string(),
                }),
            }
        }
    }

    struct ScriptedProvider {
        replies: Mutex<Vec<Result<String, String>>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<Result<String, String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(&self, _request: &LlmRequest) -> EngineResult<LlmCompletion> {
            let mut replies = self.replies.lock().unwrap();
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

    fn request(model: &str) -> LlmRequest {
        LlmRequest {
            model: model.to_string(),
            max_tokens: 256,
            messages: vec![crate::llm::LlmMessage::user("hi")],
            thinking: None,
        }
    }

    async fn setup(
        builtin: Arc<dyn LlmProvider>,
    ) -> (tempfile::TempDir, Store, ProviderCascade, KarmaLedger) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(Arc::new(FileKvStore::new(dir.path()).unwrap()));
        let cascade = ProviderCascade::new(
            store.clone(),
            Arc::new(DirectiveRuntime),
            builtin,
            ModelRegistry::default(),
            "small".to_string(),
        );
        let ledger = KarmaLedger::new("s", store.clone());
        (dir, store, cascade, ledger)
    }

    fn tier_fallbacks(ledger: &KarmaLedger) -> Vec<String> {
        ledger
            .entries()
            .iter()
            .filter(|e| e.kind == KarmaEventKind::LlmTierFallback)
            .map(|e| e.payload["tier"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn tier1_success_takes_snapshot_once() {
        let builtin = ScriptedProvider::new(vec![]);
        let (_dir, store, mut cascade, mut ledger) = setup(builtin).await;
        store
            .put(keys::PROVIDER_CODE, &json!("ok:from-adapter"))
            .await
            .unwrap();

        let out = cascade.complete(&mut ledger, &request("small")).await.unwrap();
        assert_eq!(out.content, "from-adapter");
        assert_eq!(
            store.get(keys::PROVIDER_SNAPSHOT_CODE).await.unwrap().unwrap(),
            json!("ok:from-adapter")
        );

        // A second success in the same session does not refresh the snapshot.
        store
            .put(keys::PROVIDER_CODE, &json!("ok:rewritten"))
            .await
            .unwrap();
        cascade.complete(&mut ledger, &request("small")).await.unwrap();
        assert_eq!(
            store.get(keys::PROVIDER_SNAPSHOT_CODE).await.unwrap().unwrap(),
            json!("ok:from-adapter")
        );
    }

    #[tokio::test]
    async fn broken_tier1_falls_back_to_snapshot() {
        let builtin = ScriptedProvider::new(vec![]);
        let (_dir, store, mut cascade, mut ledger) = setup(builtin).await;
        store
            .put(keys::PROVIDER_CODE, &json!("adapter exploded"))
            .await
            .unwrap();
        store
            .put(keys::PROVIDER_SNAPSHOT_CODE, &json!("ok:from-snapshot"))
            .await
            .unwrap();

        let out = cascade.complete(&mut ledger, &request("small")).await.unwrap();
        assert_eq!(out.content, "from-snapshot");
        assert_eq!(tier_fallbacks(&ledger), vec!["adapter".to_string()]);
        // The broken adapter must not be snapshotted over the good one.
        assert_eq!(
            store.get(keys::PROVIDER_SNAPSHOT_CODE).await.unwrap().unwrap(),
            json!("ok:from-snapshot")
        );
    }

    #[tokio::test]
    async fn tier3_is_tried_before_failing() {
        let builtin = ScriptedProvider::new(vec![Ok("from-builtin".to_string())]);
        let (_dir, store, mut cascade, mut ledger) = setup(builtin).await;
        store
            .put(keys::PROVIDER_CODE, &json!("bad"))
            .await
            .unwrap();
        store
            .put(keys::PROVIDER_SNAPSHOT_CODE, &json!("also bad"))
            .await
            .unwrap();

        let out = cascade.complete(&mut ledger, &request("small")).await.unwrap();
        assert_eq!(out.content, "from-builtin");
        assert_eq!(
            tier_fallbacks(&ledger),
            vec!["adapter".to_string(), "snapshot".to_string()]
        );
    }

    #[tokio::test]
    async fn full_failure_retries_fallback_model_exactly_once() {
        // Builtin fails for the big model, succeeds for the demoted retry.
        let builtin = ScriptedProvider::new(vec![
            Err("big model down".to_string()),
            Ok("demoted answer".to_string()),
        ]);
        let (_dir, _store, mut cascade, mut ledger) = setup(builtin).await;

        let out = cascade.complete(&mut ledger, &request("big")).await.unwrap();
        assert_eq!(out.content, "demoted answer");

        let model_fallbacks: Vec<_> = ledger
            .entries()
            .iter()
            .filter(|e| e.kind == KarmaEventKind::LlmModelFallback)
            .collect();
        assert_eq!(model_fallbacks.len(), 1);
        assert_eq!(model_fallbacks[0].payload["to"], "small");
        // Two full cascades: (adapter, snapshot, builtin) then (adapter, snapshot).
        assert_eq!(tier_fallbacks(&ledger).len(), 5);
    }

    #[tokio::test]
    async fn fallback_model_failure_is_hard_and_not_retried() {
        let builtin = ScriptedProvider::new(vec![Err("down".to_string())]);
        let (_dir, _store, mut cascade, mut ledger) = setup(builtin).await;

        let err = cascade
            .complete(&mut ledger, &request("small"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Provider(_)));
        assert!(ledger
            .entries()
            .iter()
            .all(|e| e.kind != KarmaEventKind::LlmModelFallback));
    }

    #[tokio::test]
    async fn cost_is_estimated_from_the_registry() {
        let builtin = ScriptedProvider::new(vec![Ok("x".to_string()), Ok("y".to_string())]);
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(Arc::new(FileKvStore::new(dir.path()).unwrap()));
        let models: ModelRegistry = serde_json::from_value(json!({
            "small": {"input_per_1k": 1.0, "output_per_1k": 2.0}
        }))
        .unwrap();
        let mut cascade = ProviderCascade::new(
            store.clone(),
            Arc::new(DirectiveRuntime),
            builtin,
            models,
            "small".to_string(),
        );
        let mut ledger = KarmaLedger::new("s", store);

        let out = cascade.complete(&mut ledger, &request("small")).await.unwrap();
        // 20 prompt + 10 completion tokens at the registered rates.
        assert!((out.cost_usd.unwrap() - 0.04).abs() < 1e-9);

        // An unrecognized model yields no estimate rather than failing.
        let mut unknown = request("small");
        unknown.model = "mystery".to_string();
        let out = cascade.complete(&mut ledger, &unknown).await.unwrap();
        assert!(out.cost_usd.is_none());
    }
}
