//! Catalog of configured virtualizers.
//!
//! The catalog maps a virtualizer name to a backend identity and an opaque
//! configuration blob that only the backend interprets. Persistence is the
//! embedder's business: implement [`Catalog`] over any keyed store.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// One configured virtualizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Unique virtualizer name.
    pub name: String,
    /// Backend identity.
    pub backend: String,
    /// Backend-specific configuration.
    pub config: Vec<u8>,
}

/// Keyed store of [`CatalogEntry`] values.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Entry named `name`, if any.
    async fn get(&self, name: &str) -> Result<Option<CatalogEntry>>;

    /// Store a new entry.
    ///
    /// # Errors
    /// [`CoreError::DuplicateVirtualizer`] if the name is taken.
    async fn insert(&self, entry: CatalogEntry) -> Result<()>;

    /// Remove the entry named `name`.
    ///
    /// # Errors
    /// [`CoreError::VirtualizerNotFound`] if there is none.
    async fn remove(&self, name: &str) -> Result<CatalogEntry>;

    /// Every entry, ordered by name.
    async fn list(&self) -> Result<Vec<CatalogEntry>>;
}

/// Catalog held in memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: RwLock<BTreeMap<String, CatalogEntry>>,
}

impl MemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn get(&self, name: &str) -> Result<Option<CatalogEntry>> {
        Ok(self.entries.read().await.get(name).cloned())
    }

    async fn insert(&self, entry: CatalogEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.name) {
            return Err(CoreError::DuplicateVirtualizer(entry.name));
        }
        entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<CatalogEntry> {
        self.entries
            .write()
            .await
            .remove(name)
            .ok_or_else(|| CoreError::VirtualizerNotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self.entries.read().await.values().cloned().collect())
    }
}
