//! Loading and invoking store-held capabilities.
//!
//! A capability is a code string plus declared permission metadata
//! (`tool:{name}:code` / `tool:{name}:meta`). The host assembles exactly the
//! declared secrets, builds the scoped store handle, and hands everything to
//! the sandbox runtime. Code and metadata are cached for the lifetime of one
//! session.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::{EngineError, EngineResult};
use crate::sandbox::{CapabilityMeta, KvAccess, SandboxRuntime, ScopedKv};
use crate::secrets::SecretVault;
use crate::store::{keys, Store};

pub struct CapabilityHost {
    store: Store,
    runtime: Arc<dyn SandboxRuntime>,
    vault: SecretVault,
    cache: HashMap<String, (String, CapabilityMeta)>,
}

impl CapabilityHost {
    pub fn new(store: Store, runtime: Arc<dyn SandboxRuntime>) -> Self {
        let vault = SecretVault::new(store.clone());
        Self {
            store,
            runtime,
            vault,
            cache: HashMap::new(),
        }
    }

    /// Load a named capability's code and metadata, caching per session.
    /// Missing metadata degrades to the closed default (no secrets, no
    /// store); missing code is a failure.
    pub async fn load(&mut self, name: &str) -> EngineResult<(String, CapabilityMeta)> {
        if let Some(found) = self.cache.get(name) {
            return Ok(found.clone());
        }
        let code = self
            .store
            .get_text(&keys::tool_code(name))
            .await?
            .ok_or_else(|| EngineError::Sandbox {
                capability: name.to_string(),
                reason: "no code registered".to_string(),
            })?;
        let meta = self
            .store
            .get_json::<CapabilityMeta>(&keys::tool_meta(name))
            .await?
            .unwrap_or_default();
        self.cache
            .insert(name.to_string(), (code.clone(), meta.clone()));
        Ok((code, meta))
    }

    /// Invoke a named capability with an input payload.
    pub async fn invoke(&mut self, name: &str, input: Value) -> EngineResult<Value> {
        let (code, meta) = self.load(name).await?;
        self.invoke_dynamic(name, &code, &meta, input).await
    }

    /// Invoke an already-loaded piece of dynamic code (used for the provider
    /// adapter, whose code lives outside the `tool:` namespace).
    pub async fn invoke_dynamic(
        &self,
        ident: &str,
        code: &str,
        meta: &CapabilityMeta,
        input: Value,
    ) -> EngineResult<Value> {
        let secrets = self.vault.assemble(&meta.secrets, &meta.kv_secrets).await?;
        let kv = match meta.kv_access {
            KvAccess::None => None,
            access => Some(ScopedKv::new(self.store.clone(), ident, access)),
        };
        tracing::debug!(capability = ident, runtime = self.runtime.name(), "sandbox run");
        self.runtime
            .run(ident, code, meta, input, secrets, kv)
            .await
    }
}
