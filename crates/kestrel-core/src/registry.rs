//! Registry of active VM handles, keyed by VM name.

use crate::error::{CoreError, Result};
use crate::handle::Handle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Active handles of one [`Manager`](crate::Manager).
///
/// A name maps to at most one handle. Handles hold a weak reference back to
/// the registry and remove themselves when closed.
#[derive(Debug, Default)]
pub struct ActiveRegistry {
    handles: Mutex<HashMap<String, Arc<Handle>>>,
}

impl ActiveRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Handle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handle` under its name.
    ///
    /// # Errors
    /// Returns [`CoreError::DuplicateVm`] if the name is taken.
    pub fn insert(&self, handle: Arc<Handle>) -> Result<()> {
        let mut handles = self.lock();
        if handles.contains_key(handle.name()) {
            return Err(CoreError::DuplicateVm(handle.name().to_string()));
        }
        tracing::debug!(vm = %handle.name(), id = %handle.id(), "Handle registered");
        handles.insert(handle.name().to_string(), handle);
        Ok(())
    }

    /// Remove the entry for `name` if it belongs to handle `id`.
    pub fn remove(&self, name: &str, id: Uuid) -> Option<Arc<Handle>> {
        let mut handles = self.lock();
        match handles.get(name) {
            Some(existing) if existing.id() == id => {
                tracing::debug!(vm = %name, id = %id, "Handle unregistered");
                handles.remove(name)
            }
            _ => None,
        }
    }

    /// Handle registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<Handle>> {
        self.lock().get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every registered handle.
    pub fn handles(&self) -> Vec<Arc<Handle>> {
        self.lock().values().cloned().collect()
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
