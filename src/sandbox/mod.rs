//! Capability-scoped execution of dynamically loaded code.
//!
//! The engine never depends on a concrete isolation mechanism, only on the
//! [`SandboxRuntime`] seam: one call runs one piece of store-held code with
//! an input payload, the secrets its metadata declares, an optional
//! namespaced store handle, and nothing else. Every invocation is a fresh,
//! disposable context bounded by the declared timeout.

pub mod process;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{EngineError, EngineResult};
use crate::store::{keys, Store};

pub use process::ProcessSandbox;

fn default_timeout_ms() -> u64 {
    30_000
}

/// Declared permissions for one unit of dynamic code. Allow-list, not
/// discovery: nothing outside the declared set is ever visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityMeta {
    /// Tier-1 secrets, resolved from the protected environment.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// Tier-2 secrets, resolved from the store's secret namespace.
    #[serde(default)]
    pub kv_secrets: Vec<String>,
    #[serde(default)]
    pub kv_access: KvAccess,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Interpreter argv override; the code string is appended as the last
    /// argument.
    #[serde(default)]
    pub runtime: Option<Vec<String>>,
}

impl Default for CapabilityMeta {
    fn default() -> Self {
        Self {
            secrets: Vec::new(),
            kv_secrets: Vec::new(),
            kv_access: KvAccess::None,
            timeout_ms: default_timeout_ms(),
            runtime: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvAccess {
    #[default]
    None,
    /// Read and write only keys under `tooldata:{name}:`.
    Own,
    /// Read any key except provisioned secrets; write only the own prefix.
    ReadAll,
}

/// Namespaced store handle handed to a running capability. All writes go
/// through [`Store`], so the identity-key block applies here too.
#[derive(Clone)]
pub struct ScopedKv {
    store: Store,
    capability: String,
    prefix: String,
    access: KvAccess,
}

impl ScopedKv {
    pub fn new(store: Store, capability: &str, access: KvAccess) -> Self {
        Self {
            store,
            prefix: keys::tooldata_prefix(capability),
            capability: capability.to_string(),
            access,
        }
    }

    fn deny(&self, reason: impl Into<String>) -> EngineError {
        EngineError::Sandbox {
            capability: self.capability.clone(),
            reason: reason.into(),
        }
    }

    pub async fn get(&self, key: &str) -> EngineResult<Option<Value>> {
        match self.access {
            KvAccess::None => Err(self.deny("no store access declared")),
            KvAccess::Own if !key.starts_with(&self.prefix) => {
                Err(self.deny(format!("read outside own namespace: {key}")))
            }
            KvAccess::ReadAll if key.starts_with(keys::SECRET_PREFIX) => {
                Err(self.deny(format!("secret read not declared: {key}")))
            }
            _ => self.store.get(key).await,
        }
    }

    pub async fn put(&self, key: &str, value: &Value) -> EngineResult<()> {
        if self.access == KvAccess::None {
            return Err(self.deny("no store access declared"));
        }
        if !key.starts_with(&self.prefix) {
            return Err(self.deny(format!("write outside own namespace: {key}")));
        }
        self.store.put(key, value).await
    }
}

/// Pluggable isolated-execution mechanism.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Run one piece of code to completion (or failure) within
    /// `meta.timeout_ms`. `secrets` is already assembled from the declared
    /// names; `kv` is present only when the metadata grants store access.
    async fn run(
        &self,
        capability: &str,
        code: &str,
        meta: &CapabilityMeta,
        input: Value,
        secrets: Map<String, Value>,
        kv: Option<ScopedKv>,
    ) -> EngineResult<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileKvStore;
    use std::sync::Arc;

    fn store(dir: &std::path::Path) -> Store {
        Store::new(Arc::new(FileKvStore::new(dir).unwrap()))
    }

    #[tokio::test]
    async fn none_access_has_no_store() {
        let dir = tempfile::tempdir().unwrap();
        let kv = ScopedKv::new(store(dir.path()), "t", KvAccess::None);
        assert!(kv.get("tooldata:t:x").await.is_err());
        assert!(kv.put("tooldata:t:x", &serde_json::json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn own_access_is_prefix_bound() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.put("wisdom", &serde_json::json!("w")).await.unwrap();

        let kv = ScopedKv::new(store.clone(), "t", KvAccess::Own);
        kv.put("tooldata:t:counter", &serde_json::json!(3))
            .await
            .unwrap();
        assert_eq!(
            kv.get("tooldata:t:counter").await.unwrap().unwrap(),
            serde_json::json!(3)
        );

        assert!(kv.get("wisdom").await.is_err());
        assert!(kv.get("tooldata:other:x").await.is_err());
        assert!(kv.put("tooldata:other:x", &serde_json::json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn read_all_reads_everything_but_secrets_and_writes_own() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.put("wisdom", &serde_json::json!("w")).await.unwrap();
        store
            .put(&keys::secret("TOKEN"), &serde_json::json!("s"))
            .await
            .unwrap();

        let kv = ScopedKv::new(store.clone(), "t", KvAccess::ReadAll);
        assert_eq!(
            kv.get("wisdom").await.unwrap().unwrap(),
            serde_json::json!("w")
        );
        assert!(kv.get("secret:TOKEN").await.is_err());
        assert!(kv.put("wisdom", &serde_json::json!("nope")).await.is_err());
        kv.put("tooldata:t:x", &serde_json::json!(1)).await.unwrap();
    }

    #[tokio::test]
    async fn scoped_writes_cannot_reach_the_identity_key() {
        // Defense in depth: even a capability named so its prefix collides
        // conceptually cannot write `soul`, because Store guards it below.
        let dir = tempfile::tempdir().unwrap();
        let kv = ScopedKv::new(store(dir.path()), "t", KvAccess::Own);
        assert!(kv.put("soul", &serde_json::json!("x")).await.is_err());
    }

    #[test]
    fn meta_defaults_are_closed() {
        let meta: CapabilityMeta = serde_json::from_str("{}").unwrap();
        assert!(meta.secrets.is_empty());
        assert_eq!(meta.kv_access, KvAccess::None);
        assert_eq!(meta.timeout_ms, 30_000);
    }
}
