//! Manager tying backends, the catalog and active VMs together.

use crate::backend::Backend;
use crate::catalog::{Catalog, CatalogEntry, MemoryCatalog};
use crate::config::{ManagerConfig, PrepareArgs};
use crate::error::{CoreError, Result};
use crate::handle::Handle;
use crate::operation::Operation;
use crate::registry::ActiveRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Manages backends, configured virtualizers and active VMs.
///
/// Two independent key spaces live here: the catalog (virtualizer name to
/// backend and configuration) and the [`ActiveRegistry`] of live handles keyed
/// by VM name.
///
/// # Thread Safety
///
/// The manager is safe to share across tasks. The backend table sits behind
/// an async `RwLock`; the registry has its own lock and is handed to each
/// handle so a closing handle can remove itself.
pub struct Manager {
    backends: RwLock<BTreeMap<&'static str, Arc<dyn Backend>>>,
    catalog: Arc<dyn Catalog>,
    registry: Arc<ActiveRegistry>,
    config: ManagerConfig,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("active", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Manager {
    /// Create a manager with an in-memory catalog.
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_catalog(config, Arc::new(MemoryCatalog::new()))
    }

    /// Create a manager backed by `catalog`.
    pub fn with_catalog(config: ManagerConfig, catalog: Arc<dyn Catalog>) -> Self {
        tracing::info!("Creating VM manager");
        Self {
            backends: RwLock::new(BTreeMap::new()),
            catalog,
            registry: Arc::new(ActiveRegistry::new()),
            config,
        }
    }

    /// Get the manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Registry of active handles.
    pub fn registry(&self) -> &Arc<ActiveRegistry> {
        &self.registry
    }

    // =========================================================================
    // Backends
    // =========================================================================

    /// Register a backend under its identity, replacing any previous one.
    pub async fn register_backend(&self, backend: Arc<dyn Backend>) {
        let identity = backend.identity();
        tracing::info!(backend = identity, "Backend registered");
        self.backends.write().await.insert(identity, backend);
    }

    /// Registered backend identities.
    pub async fn backends(&self) -> Vec<&'static str> {
        self.backends.read().await.keys().copied().collect()
    }

    /// Identities of backends that can run on this host.
    pub async fn available_backends(&self) -> Vec<&'static str> {
        let backends: Vec<Arc<dyn Backend>> =
            self.backends.read().await.values().cloned().collect();
        let mut available = Vec::new();
        for backend in backends {
            if backend.is_available().await {
                available.push(backend.identity());
            } else {
                tracing::debug!(backend = backend.identity(), "Backend unavailable");
            }
        }
        available
    }

    async fn backend(&self, identity: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .read()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| CoreError::UnknownBackend(identity.to_string()))
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    /// Configure a virtualizer named `name` for `backend`.
    ///
    /// # Errors
    /// [`CoreError::UnknownBackend`] for an unregistered backend, the
    /// backend's validation error for a bad configuration, and
    /// [`CoreError::DuplicateVirtualizer`] if the name is taken.
    pub async fn create_virtualizer(&self, name: &str, backend: &str, config: &[u8]) -> Result<()> {
        let implementation = self.backend(backend).await?;
        implementation.validate_config(config)?;
        self.catalog
            .insert(CatalogEntry {
                name: name.to_string(),
                backend: backend.to_string(),
                config: config.to_vec(),
            })
            .await?;
        tracing::info!(virtualizer = %name, backend = %backend, "Virtualizer created");
        Ok(())
    }

    /// Remove a configured virtualizer. Active VMs using it are unaffected.
    pub async fn delete_virtualizer(&self, name: &str) -> Result<()> {
        self.catalog.remove(name).await?;
        tracing::info!(virtualizer = %name, "Virtualizer deleted");
        Ok(())
    }

    /// Catalog entry for `name`.
    pub async fn virtualizer(&self, name: &str) -> Result<CatalogEntry> {
        self.catalog
            .get(name)
            .await?
            .ok_or_else(|| CoreError::VirtualizerNotFound(name.to_string()))
    }

    /// Every configured virtualizer.
    pub async fn virtualizers(&self) -> Result<Vec<CatalogEntry>> {
        self.catalog.list().await
    }

    // =========================================================================
    // VMs
    // =========================================================================

    /// Prepare a VM with the virtualizer named `virtualizer`.
    ///
    /// Returns as soon as the VM name is reserved; preparation continues in
    /// the background and reports through the [`Operation`].
    ///
    /// # Errors
    /// [`CoreError::DuplicateVm`] if a VM with this name is active, plus
    /// catalog, backend and configuration errors.
    pub async fn prepare(&self, virtualizer: &str, args: PrepareArgs) -> Result<Operation> {
        if self.registry.contains(&args.name) {
            return Err(CoreError::DuplicateVm(args.name));
        }
        let entry = self.virtualizer(virtualizer).await?;
        let backend = self.backend(&entry.backend).await?;

        let handle = Handle::with_registry(
            &args.name,
            backend.identity(),
            backend.allocate(&args.name),
            &self.config,
            Arc::downgrade(&self.registry),
        );
        handle.initialize(&entry.config).await?;

        tracing::info!(vm = %args.name, virtualizer = %virtualizer, backend = backend.identity(), "Preparing VM");
        handle.prepare(args)
    }

    /// Active handle named `name`.
    pub fn get(&self, name: &str) -> Result<Arc<Handle>> {
        self.registry
            .get(name)
            .ok_or_else(|| CoreError::VmNotFound(name.to_string()))
    }

    /// Names of active VMs.
    pub fn list(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Get the number of active VMs.
    pub fn count(&self) -> usize {
        self.registry.len()
    }

    /// Close the VM named `name`.
    pub async fn close(&self, name: &str, force: bool) -> Result<()> {
        let handle = self.get(name)?;
        handle.close(force).await
    }

    /// Force-close every active VM.
    ///
    /// This is useful for cleanup during shutdown. Errors closing individual
    /// VMs are logged and do not stop the sweep.
    pub async fn close_all(&self) -> Result<()> {
        let handles = self.registry.handles();
        tracing::info!(count = handles.len(), "Closing all VMs");

        for handle in handles {
            if let Err(e) = handle.close(true).await {
                tracing::error!(vm = %handle.name(), error = %e, "Failed to close VM");
            }
        }
        Ok(())
    }
}
