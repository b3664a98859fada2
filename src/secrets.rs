//! Secret assembly for capability invocations.
//!
//! Two tiers: tier-1 names resolve from the protected process environment,
//! tier-2 names from the store's `secret:{name}` namespace. Lookup is
//! strictly allow-list driven: a capability sees exactly the names its
//! metadata declares, merged into one object it cannot tell apart by origin.

use serde_json::{Map, Value};

use crate::errors::EngineResult;
use crate::store::{keys, Store};

#[derive(Clone)]
pub struct SecretVault {
    store: Store,
}

impl SecretVault {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Resolve the declared names. Missing names are omitted rather than
    /// failing the whole assembly; the capability observes an absent key.
    pub async fn assemble(
        &self,
        env_names: &[String],
        kv_names: &[String],
    ) -> EngineResult<Map<String, Value>> {
        let mut secrets = Map::new();
        for name in env_names {
            if let Ok(value) = std::env::var(name) {
                secrets.insert(name.clone(), Value::String(value));
            } else {
                tracing::debug!(secret = %name, "tier-1 secret not present in environment");
            }
        }
        for name in kv_names {
            if let Some(value) = self.store.get(&keys::secret(name)).await? {
                secrets.insert(name.clone(), value);
            } else {
                tracing::debug!(secret = %name, "tier-2 secret not provisioned");
            }
        }
        Ok(secrets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileKvStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn assembles_only_declared_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(Arc::new(FileKvStore::new(dir.path()).unwrap()));
        store
            .put(&keys::secret("API_TOKEN"), &serde_json::json!("kv-held"))
            .await
            .unwrap();
        store
            .put(&keys::secret("UNDECLARED"), &serde_json::json!("hidden"))
            .await
            .unwrap();
        std::env::set_var("SWAYAMBHU_TEST_ENV_SECRET", "env-held");

        let vault = SecretVault::new(store);
        let secrets = vault
            .assemble(
                &["SWAYAMBHU_TEST_ENV_SECRET".into(), "MISSING_ENV".into()],
                &["API_TOKEN".into()],
            )
            .await
            .unwrap();

        assert_eq!(secrets["SWAYAMBHU_TEST_ENV_SECRET"], "env-held");
        assert_eq!(secrets["API_TOKEN"], "kv-held");
        // Missing names are omitted; undeclared names never appear.
        assert!(!secrets.contains_key("MISSING_ENV"));
        assert!(!secrets.contains_key("UNDECLARED"));

        std::env::remove_var("SWAYAMBHU_TEST_ENV_SECRET");
    }
}
