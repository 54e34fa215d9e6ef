//! Read-through cache in front of the secret store.

use super::SecretStore;
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Process-wide secret cache.
///
/// Secrets are immutable once created, so a cached value never goes stale.
/// A miss always goes back to the store; the cache never produces a value
/// the store has not confirmed.
pub struct SecretCache {
    store: SecretStore,
    secrets: RwLock<HashMap<String, Arc<[u8]>>>,
}

impl SecretCache {
    pub fn new(store: SecretStore) -> Self {
        Self {
            store,
            secrets: RwLock::new(HashMap::new()),
        }
    }

    /// Secret by name, creating it in the store on first use.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<[u8]>> {
        if let Some(secret) = self.secrets.read().get(name) {
            return Ok(Arc::clone(secret));
        }

        let secret: Arc<[u8]> = self.store.get_or_create(name)?.into();
        let mut secrets = self.secrets.write();
        let cached = secrets
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&secret));
        Ok(Arc::clone(cached))
    }

    /// Secret by name, only if it already exists.
    pub fn get(&self, name: &str) -> Result<Option<Arc<[u8]>>> {
        if let Some(secret) = self.secrets.read().get(name) {
            return Ok(Some(Arc::clone(secret)));
        }

        let Some(secret) = self.store.get(name)? else {
            return Ok(None);
        };
        let secret: Arc<[u8]> = secret.into();
        self.secrets
            .write()
            .insert(name.to_string(), Arc::clone(&secret));
        Ok(Some(secret))
    }

    /// Drop every cached value. Subsequent reads go to the store.
    pub fn refresh(&self) {
        self.secrets.write().clear();
    }

    pub fn store(&self) -> &SecretStore {
        &self.store
    }
}
