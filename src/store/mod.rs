//! Durable key namespace: the single source of truth surviving across
//! sessions.
//!
//! `KvBackend` is the pluggable persistence seam; [`Store`] wraps a backend
//! and enforces the one invariant no caller may bypass: the identity
//! document is write-protected against every path, including the
//! capability-scoped one.

pub mod file;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::errors::{EngineError, EngineResult};

pub use file::FileKvStore;

/// Well-known keys.
pub mod keys {
    /// Identity document. Hard write block.
    pub const SOUL: &str = "soul";
    /// Accumulated long-term knowledge.
    pub const WISDOM: &str = "wisdom";
    pub const PROMPT_PLANNING: &str = "prompt:planning";
    pub const PROMPT_REFLECT: &str = "prompt:reflect";
    pub const PROMPT_SUBPLAN: &str = "prompt:subplan";
    pub const PROMPT_DEEP_REFLECT: &str = "prompt:deep_reflect";
    pub const CONFIG_DEFAULTS: &str = "config:defaults";
    pub const CONFIG_MODELS: &str = "config:models";
    pub const CONFIG_RESOURCES: &str = "config:resources";
    pub const WAKE_CONFIG: &str = "wake_config";
    pub const LAST_REFLECT: &str = "last_reflect";
    pub const SESSION_COUNTER: &str = "session_counter";
    pub const SESSION_LAST_COMPLETED: &str = "session:last_completed";
    pub const SESSION_RECENT: &str = "session:recent";
    pub const BREADCRUMB: &str = "breadcrumb";
    pub const DEEP_REFLECT_SCHEDULE: &str = "deep_reflect_schedule";
    pub const PROVIDER_CODE: &str = "provider:llm:code";
    pub const PROVIDER_META: &str = "provider:llm:meta";
    pub const PROVIDER_SNAPSHOT_CODE: &str = "provider:llm:last_working:code";
    pub const PROVIDER_SNAPSHOT_META: &str = "provider:llm:last_working:meta";

    pub fn karma(session_id: &str) -> String {
        format!("karma:{session_id}")
    }

    pub fn tool_code(name: &str) -> String {
        format!("tool:{name}:code")
    }

    pub fn tool_meta(name: &str) -> String {
        format!("tool:{name}:meta")
    }

    /// Private namespace prefix for one capability.
    pub fn tooldata_prefix(name: &str) -> String {
        format!("tooldata:{name}:")
    }

    pub fn secret(name: &str) -> String {
        format!("secret:{name}")
    }

    pub const SECRET_PREFIX: &str = "secret:";
}

/// Persistence seam. Read-after-write consistent, last-write-wins.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> EngineResult<Option<Value>>;
    async fn put(&self, key: &str, value: &Value) -> EngineResult<()>;
    async fn delete(&self, key: &str) -> EngineResult<bool>;
    async fn keys(&self, prefix: &str) -> EngineResult<Vec<String>>;
}

/// Guarded handle to the durable namespace. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KvBackend>,
}

impl Store {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    fn guard_write(key: &str) -> EngineResult<()> {
        if key == keys::SOUL {
            return Err(EngineError::ProtectedKey(key.to_string()));
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> EngineResult<Option<Value>> {
        self.backend.get(key).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> EngineResult<Option<T>> {
        match self.backend.get(key).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    /// Convenience for keys holding a bare string (identity, wisdom, prompts).
    pub async fn get_text(&self, key: &str) -> EngineResult<Option<String>> {
        Ok(self.backend.get(key).await?.map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        }))
    }

    pub async fn put(&self, key: &str, value: &Value) -> EngineResult<()> {
        Self::guard_write(key)?;
        self.backend.put(key, value).await
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> EngineResult<()> {
        self.put(key, &serde_json::to_value(value)?).await
    }

    pub async fn delete(&self, key: &str) -> EngineResult<bool> {
        Self::guard_write(key)?;
        self.backend.delete(key).await
    }

    /// Read `key`, write it at `to`, delete the original. Both ends guarded.
    pub async fn rename(&self, key: &str, to: &str) -> EngineResult<bool> {
        Self::guard_write(key)?;
        Self::guard_write(to)?;
        match self.backend.get(key).await? {
            Some(v) => {
                self.backend.put(to, &v).await?;
                self.backend.delete(key).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn keys(&self, prefix: &str) -> EngineResult<Vec<String>> {
        self.backend.keys(prefix).await
    }
}
