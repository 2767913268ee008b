//! VM handle - the backend-independent lifecycle of one VM.

use crate::backend::{PrepareContext, Virtualizer};
use crate::broadcaster::Broadcaster;
use crate::config::{LifecycleTimings, ManagerConfig, PrepareArgs};
use crate::error::{CoreError, Result};
use crate::network::{self, NetworkRoutes, NicRoute};
use crate::operation::{Operation, Progress};
use crate::registry::ActiveRegistry;
use crate::state::{StateCell, VmState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::watch;
use uuid::Uuid;

/// Serializable summary of a handle.
#[derive(Debug, Clone, Serialize)]
pub struct HandleDetails {
    /// Handle id.
    pub id: Uuid,
    /// VM name.
    pub name: String,
    /// Backend identity.
    pub backend: String,
    /// When the handle was created.
    pub created: DateTime<Utc>,
    /// Current state.
    pub state: VmState,
    /// Disk image, once prepared.
    pub disk: Option<PathBuf>,
    /// Network routes.
    pub routes: Vec<NicRoute>,
}

/// One VM, driven through its backend's [`Virtualizer`].
///
/// The lifecycle is:
/// 1. [`initialize`](Self::initialize) with the virtualizer configuration
/// 2. [`prepare`](Self::prepare), which returns an [`Operation`] immediately
/// 3. [`start`](Self::start) / [`stop`](Self::stop) any number of times
/// 4. [`close`](Self::close), after which the handle is `Deleted`
///
/// Transitions are not serialized by a lock; every state update is a
/// compare-and-set, so conflicting calls fail with
/// [`CoreError::InvalidState`] instead of interleaving.
pub struct Handle {
    id: Uuid,
    name: String,
    backend: String,
    created: DateTime<Utc>,
    state: StateCell,
    console: Broadcaster,
    routes: NetworkRoutes,
    virtualizer: Box<dyn Virtualizer>,
    timings: LifecycleTimings,
    registry: Weak<ActiveRegistry>,
    run: AtomicU64,
    closing: AtomicBool,
    preparing: watch::Sender<bool>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("backend", &self.backend)
            .field("state", &self.state.get())
            .finish()
    }
}

impl Handle {
    /// Create a handle that is not tracked by any registry.
    pub fn new(
        name: impl Into<String>,
        backend: impl Into<String>,
        virtualizer: Box<dyn Virtualizer>,
        config: &ManagerConfig,
    ) -> Arc<Self> {
        Self::with_registry(name, backend, virtualizer, config, Weak::new())
    }

    pub(crate) fn with_registry(
        name: impl Into<String>,
        backend: impl Into<String>,
        virtualizer: Box<dyn Virtualizer>,
        config: &ManagerConfig,
        registry: Weak<ActiveRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            backend: backend.into(),
            created: Utc::now(),
            state: StateCell::new(VmState::Initializing),
            console: Broadcaster::new(config.console_buffer, config.subscriber_queue),
            routes: NetworkRoutes::default(),
            virtualizer,
            timings: config.timings,
            registry,
            run: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            preparing: watch::Sender::new(false),
        })
    }

    /// Unique id of this handle.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// VM name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity of the backend driving this VM.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// When the handle was created.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Current state.
    pub fn state(&self) -> VmState {
        self.state.get()
    }

    /// Observe state changes.
    pub fn watch_state(&self) -> watch::Receiver<VmState> {
        self.state.subscribe()
    }

    /// Wait until the handle reaches `target`.
    pub async fn wait_for_state(&self, target: VmState) -> VmState {
        let mut rx = self.state.subscribe();
        let result = match rx.wait_for(|state| *state == target).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        result
    }

    /// Console broadcaster for this VM.
    pub fn console(&self) -> Broadcaster {
        self.console.clone()
    }

    /// Current network routes.
    pub fn routes(&self) -> Vec<NicRoute> {
        self.routes.snapshot()
    }

    /// Summary of the handle.
    pub fn details(&self) -> HandleDetails {
        HandleDetails {
            id: self.id,
            name: self.name.clone(),
            backend: self.backend.clone(),
            created: self.created,
            state: self.state(),
            disk: self.virtualizer.disk_path(),
            routes: self.routes(),
        }
    }

    /// Open the VM's disk image for reading.
    pub async fn download_disk(&self) -> Result<tokio::fs::File> {
        let path = self
            .virtualizer
            .disk_path()
            .ok_or_else(|| CoreError::invalid_state("prepared", self.state()))?;
        tracing::debug!(vm = %self.name, disk = %path.display(), "Opening disk for download");
        Ok(tokio::fs::File::open(&path).await?)
    }

    /// Apply the virtualizer configuration. Only valid before preparation.
    pub async fn initialize(&self, config: &[u8]) -> Result<()> {
        let state = self.state();
        if state != VmState::Initializing {
            return Err(CoreError::invalid_state("initializing", state));
        }
        self.virtualizer.initialize(config).await
    }

    /// Start preparing the VM in the background.
    ///
    /// The name is reserved in the active registry before this returns, so a
    /// duplicate fails synchronously. Preparation itself runs in a spawned
    /// task reporting through the returned [`Operation`]; on failure the
    /// handle releases what it acquired and ends up `Deleted`.
    pub fn prepare(self: &Arc<Self>, args: PrepareArgs) -> Result<Operation> {
        let state = self.state();
        if state != VmState::Initializing {
            return Err(CoreError::invalid_state("initializing", state));
        }
        if args.name != self.name {
            return Err(CoreError::InvalidConfig(format!(
                "prepare arguments name {} but handle is {}",
                args.name, self.name
            )));
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.insert(Arc::clone(self))?;
        }

        self.routes.configure(&args.vm.nics);
        self.preparing.send_replace(true);
        let (operation, progress) = Operation::new(Arc::clone(self));
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            let result = handle.run_prepare(&args, &progress).await;
            handle.preparing.send_replace(false);
            if let Err(e) = &result {
                tracing::warn!(vm = %handle.name, error = %e, "Preparation failed, releasing resources");
                progress.log("releasing partially allocated resources");
                if let Err(close_err) = handle.close(true).await {
                    tracing::warn!(vm = %handle.name, error = %close_err, "Cleanup after failed preparation failed");
                }
            }
            progress.finish(result);
        });
        Ok(operation)
    }

    async fn run_prepare(self: &Arc<Self>, args: &PrepareArgs, progress: &Progress) -> Result<()> {
        let start = Instant::now();
        tracing::info!(vm = %self.name, backend = %self.backend, disk = %args.disk, "Preparing VM");
        progress.status("preparing");

        self.virtualizer
            .prepare(PrepareContext {
                id: self.id,
                name: &self.name,
                args,
                routes: &self.routes,
                progress,
            })
            .await?;

        if self.closing.load(Ordering::SeqCst) {
            return Err(CoreError::Provisioning(format!(
                "{} was closed during preparation",
                self.name
            )));
        }

        self.state
            .transition(&[VmState::Initializing], VmState::Ready)
            .map_err(|actual| CoreError::invalid_state("initializing", actual))?;

        if self.routes.awaiting_lease() {
            self.spawn_lease_watcher();
        }

        tracing::info!(
            vm = %self.name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "VM prepared"
        );
        progress.status("ready");

        if args.start {
            progress.status("starting");
            self.start().await?;
            progress.status("alive");
        }
        Ok(())
    }

    fn spawn_lease_watcher(&self) {
        let name = self.name.clone();
        let subscription = self.console.subscribe();
        let routes = self.routes.clone();
        let direct = self.virtualizer.direct_routes();
        tokio::spawn(async move {
            if let Err(e) = network::watch_leases(name.clone(), subscription, routes, direct).await {
                tracing::warn!(vm = %name, error = %e, "Lease watcher failed");
            }
        });
    }

    /// Boot the VM and wait until it is alive.
    ///
    /// # Errors
    /// [`CoreError::InvalidState`] unless the VM is `Ready`. If the backend
    /// fails to start or the guest does not come up within the retry budget
    /// the machine is killed and the VM is left `Broken`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.state
            .transition(&[VmState::Ready], VmState::Changing)
            .map_err(|actual| CoreError::invalid_state("ready", actual))?;

        let start = Instant::now();
        let run = self.run.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(vm = %self.name, backend = %self.backend, run, "Starting VM");

        if let Err(e) = self.virtualizer.start(&self.console).await {
            tracing::error!(vm = %self.name, error = %e, "Backend failed to start VM");
            self.kill_quietly().await;
            let _ = self.state.transition(&[VmState::Changing], VmState::Broken);
            return Err(e);
        }

        if !self.poll_alive(true, self.timings.start_attempts).await {
            tracing::warn!(
                vm = %self.name,
                budget_ms = self.timings.start_budget().as_millis() as u64,
                "VM did not come up in time"
            );
            self.kill_quietly().await;
            let _ = self.state.transition(&[VmState::Changing], VmState::Broken);
            return Err(CoreError::Broken(
                self.name.clone(),
                format!("not alive after {:?}", self.timings.start_budget()),
            ));
        }

        self.state
            .transition(&[VmState::Changing], VmState::Alive)
            .map_err(|actual| CoreError::invalid_state("changing", actual))?;
        tracing::info!(
            vm = %self.name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "VM alive"
        );

        self.spawn_exit_watcher(run);
        Ok(())
    }

    /// Reconcile `Alive -> Ready` when the machine exits on its own.
    fn spawn_exit_watcher(self: &Arc<Self>, run: u64) {
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            let exit = loop {
                match handle.virtualizer.wait().await {
                    Ok(exit) => break exit,
                    Err(e) => {
                        tracing::warn!(vm = %handle.name, error = %e, "Lost track of machine, retrying");
                        tokio::time::sleep(handle.timings.poll_interval).await;
                        if handle.run.load(Ordering::SeqCst) != run
                            || handle.state() != VmState::Alive
                        {
                            return;
                        }
                    }
                }
            };
            if handle.run.load(Ordering::SeqCst) != run {
                return;
            }
            match handle.state.transition(&[VmState::Alive], VmState::Ready) {
                Ok(_) if exit.success() => {
                    tracing::info!(vm = %handle.name, "Guest powered off");
                }
                Ok(_) => {
                    tracing::warn!(vm = %handle.name, %exit, "Guest crashed");
                }
                Err(state) => {
                    tracing::debug!(vm = %handle.name, %state, "Machine exit handled by lifecycle");
                }
            }
        });
    }

    /// Shut the VM down gracefully, escalating to a kill if it does not stop in time.
    ///
    /// # Errors
    /// [`CoreError::AlreadyStopped`] if the VM is `Ready`,
    /// [`CoreError::InvalidState`] if it is initializing, changing or deleted.
    /// A `Broken` VM is force-stopped.
    pub async fn stop(&self) -> Result<()> {
        match self.state.transition(&[VmState::Alive], VmState::Changing) {
            Ok(_) => {}
            Err(VmState::Ready) => return Err(CoreError::AlreadyStopped(self.name.clone())),
            Err(VmState::Broken) => return self.force_stop().await,
            Err(actual) => return Err(CoreError::invalid_state("alive", actual)),
        }

        let start = Instant::now();
        tracing::info!(vm = %self.name, "Stopping VM");

        let stopped = match self.virtualizer.shutdown().await {
            Ok(()) => self.poll_alive(false, self.timings.stop_attempts).await,
            Err(e) => {
                tracing::warn!(vm = %self.name, error = %e, "Graceful shutdown failed");
                false
            }
        };

        if !stopped {
            tracing::warn!(
                vm = %self.name,
                budget_ms = self.timings.stop_budget().as_millis() as u64,
                "VM did not stop in time, forcing"
            );
            let _ = self.state.transition(&[VmState::Changing], VmState::Broken);
            return self.force_stop().await;
        }

        self.state
            .transition(&[VmState::Changing], VmState::Ready)
            .map_err(|actual| CoreError::invalid_state("changing", actual))?;
        tracing::info!(
            vm = %self.name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "VM stopped"
        );
        Ok(())
    }

    async fn force_stop(&self) -> Result<()> {
        self.state
            .transition(&[VmState::Broken], VmState::Changing)
            .map_err(|actual| CoreError::invalid_state("broken", actual))?;
        tracing::warn!(vm = %self.name, "Force stopping VM");

        if let Err(e) = self.virtualizer.kill().await {
            let _ = self.state.transition(&[VmState::Changing], VmState::Broken);
            return Err(e);
        }
        if !self.poll_alive(false, self.timings.stop_attempts).await {
            let _ = self.state.transition(&[VmState::Changing], VmState::Broken);
            return Err(CoreError::Broken(
                self.name.clone(),
                "still running after kill".to_string(),
            ));
        }

        self.state
            .transition(&[VmState::Changing], VmState::Ready)
            .map_err(|actual| CoreError::invalid_state("changing", actual))?;
        tracing::info!(vm = %self.name, "VM force-stopped");
        Ok(())
    }

    /// Tear the VM down.
    ///
    /// Without `force` a running VM is stopped first; with `force` it is
    /// killed. Backend resources are then released, the console is closed and
    /// the handle leaves the active registry. Teardown failures are logged and
    /// never prevent the handle from reaching `Deleted`. Closing twice is a no-op.
    ///
    /// A close issued while preparation is still running waits for it, so
    /// whatever the backend acquired is released.
    pub async fn close(&self, force: bool) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut preparing = self.preparing.subscribe();
        if *preparing.borrow_and_update() {
            tracing::debug!(vm = %self.name, "Waiting for preparation before closing");
            let _ = preparing.wait_for(|busy| !*busy).await;
        }
        let state = self.state();
        tracing::info!(vm = %self.name, %state, force, "Closing VM");

        match state {
            VmState::Alive | VmState::Broken if !force => {
                if let Err(e) = self.stop().await {
                    tracing::warn!(vm = %self.name, error = %e, "Stop during close failed, killing");
                    self.kill_quietly().await;
                }
            }
            VmState::Alive | VmState::Broken | VmState::Changing => {
                self.kill_quietly().await;
            }
            VmState::Initializing | VmState::Ready | VmState::Deleted => {}
        }

        if let Err(e) = self.virtualizer.release().await {
            tracing::warn!(vm = %self.name, error = %e, "Failed to release VM resources");
        }

        self.state.force(VmState::Deleted);
        self.console.close();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.name, self.id);
        }
        tracing::info!(vm = %self.name, "VM closed");
        Ok(())
    }

    async fn kill_quietly(&self) {
        if let Err(e) = self.virtualizer.kill().await {
            tracing::warn!(vm = %self.name, error = %e, "Failed to kill VM");
        }
    }

    /// Poll liveness until it equals `want` or the attempts run out.
    async fn poll_alive(&self, want: bool, attempts: u32) -> bool {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match self.virtualizer.is_alive().await {
                Ok(alive) if alive == want => return true,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(vm = %self.name, attempt, error = %e, "Liveness check failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.timings.poll_interval).await;
            }
        }
        false
    }
}

#[cfg(test)]
impl Handle {
    pub(crate) fn standalone(
        name: &str,
        virtualizer: Box<dyn Virtualizer>,
        timings: LifecycleTimings,
    ) -> Arc<Self> {
        let config = ManagerConfig {
            timings,
            ..Default::default()
        };
        Self::new(name, "fake", virtualizer, &config)
    }
}
