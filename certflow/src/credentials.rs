use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Source of decrypted provider credentials.
#[async_trait]
pub trait CredentialsStore: Send + Sync {
    /// Decrypted key/value pairs stored under `storage_key`. Decryption failures are errors,
    /// never an empty map.
    async fn get_unlocked_credentials(&self, storage_key: &str) -> Result<HashMap<String, String>>;
}

/// Credentials held in memory, for hosts that manage secrets themselves.
#[derive(Default)]
pub struct InMemoryCredentials {
    entries: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, storage_key: impl Into<String>, values: HashMap<String, String>) {
        self.entries.write().await.insert(storage_key.into(), values);
    }
}

#[async_trait]
impl CredentialsStore for InMemoryCredentials {
    async fn get_unlocked_credentials(&self, storage_key: &str) -> Result<HashMap<String, String>> {
        self.entries
            .read()
            .await
            .get(storage_key)
            .cloned()
            .with_context(|| format!("no stored credentials for {storage_key}"))
    }
}
