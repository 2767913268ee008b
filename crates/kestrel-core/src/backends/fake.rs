//! In-memory backend driving the lifecycle in tests.

use crate::backend::{Backend, DiskFormat, PrepareContext, Virtualizer};
use crate::broadcaster::Broadcaster;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use kestrel_vm::{MachineExit, VmError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Knobs and observations shared between a test and its fake virtualizer.
pub(crate) struct FakeState {
    pub fail_prepare: AtomicBool,
    pub fail_start: AtomicBool,
    pub never_alive: AtomicBool,
    pub ignore_shutdown: AtomicBool,
    pub released: AtomicUsize,
    /// Number of upcoming `wait` calls that fail before one succeeds.
    pub wait_errors: AtomicUsize,
    running: watch::Sender<bool>,
    calls: Mutex<Vec<&'static str>>,
    disk: Mutex<Option<PathBuf>>,
    config: Mutex<Option<Vec<u8>>>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            fail_prepare: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            never_alive: AtomicBool::new(false),
            ignore_shutdown: AtomicBool::new(false),
            released: AtomicUsize::new(0),
            wait_errors: AtomicUsize::new(0),
            running: watch::channel(false).0,
            calls: Mutex::new(Vec::new()),
            disk: Mutex::new(None),
            config: Mutex::new(None),
        }
    }
}

impl FakeState {
    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn config(&self) -> Option<Vec<u8>> {
        self.config.lock().unwrap().clone()
    }

    /// Simulate the guest shutting itself down.
    pub fn power_off(&self) {
        self.running.send_replace(false);
    }
}

#[derive(Default)]
pub(crate) struct FakeVirtualizer {
    state: Arc<FakeState>,
}

impl FakeVirtualizer {
    pub fn new() -> (Self, Arc<FakeState>) {
        let state = Arc::new(FakeState::default());
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

#[async_trait]
impl Virtualizer for FakeVirtualizer {
    async fn initialize(&self, config: &[u8]) -> Result<()> {
        self.state.record("initialize");
        *self.state.config.lock().unwrap() = Some(config.to_vec());
        Ok(())
    }

    async fn prepare(&self, ctx: PrepareContext<'_>) -> Result<()> {
        self.state.record("prepare");
        if self.state.fail_prepare.load(Ordering::SeqCst) {
            return Err(CoreError::Provisioning("fake prepare failure".into()));
        }
        *self.state.disk.lock().unwrap() = Some(PathBuf::from(&ctx.args.disk));
        for index in 0..ctx.routes.len() {
            ctx.routes.set_device(index, format!("{}-{index}", ctx.name));
        }
        ctx.progress.log("fake resources allocated");
        Ok(())
    }

    async fn start(&self, console: &Broadcaster) -> Result<()> {
        self.state.record("start");
        if self.state.fail_start.load(Ordering::SeqCst) {
            return Err(VmError::Start("fake start failure".into()).into());
        }
        if !self.state.never_alive.load(Ordering::SeqCst) {
            self.state.running.send_replace(true);
        }
        let _ = console.publish(b"fake console up\n");
        Ok(())
    }

    async fn is_alive(&self) -> Result<bool> {
        Ok(*self.state.running.borrow())
    }

    async fn shutdown(&self) -> Result<()> {
        self.state.record("shutdown");
        if !self.state.ignore_shutdown.load(Ordering::SeqCst) {
            self.state.running.send_replace(false);
        }
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.state.record("kill");
        self.state.running.send_replace(false);
        Ok(())
    }

    async fn wait(&self) -> Result<MachineExit> {
        let failing = self
            .state
            .wait_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            self.state.record("wait failed");
            return Err(CoreError::Provisioning("fake wait failure".into()));
        }
        let mut rx = self.state.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
        Ok(MachineExit::with_code(0))
    }

    async fn release(&self) -> Result<()> {
        self.state.record("release");
        self.state.released.fetch_add(1, Ordering::SeqCst);
        self.state.running.send_replace(false);
        Ok(())
    }

    fn disk_path(&self) -> Option<PathBuf> {
        self.state.disk.lock().unwrap().clone()
    }
}

/// Backend handing out [`FakeVirtualizer`]s and remembering their state.
#[derive(Default)]
pub(crate) struct FakeBackend {
    pub unavailable: bool,
    pub fail_prepare: bool,
    pub(crate) allocated: Mutex<Vec<(String, Arc<FakeState>)>>,
}

impl FakeBackend {
    pub fn state_of(&self, name: &str) -> Option<Arc<FakeState>> {
        self.allocated
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, state)| Arc::clone(state))
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn identity(&self) -> &'static str {
        "fake"
    }

    fn validate_config(&self, config: &[u8]) -> Result<()> {
        serde_json::from_slice::<serde_json::Value>(config)
            .map(|_| ())
            .map_err(|e| CoreError::InvalidConfig(e.to_string()))
    }

    fn disk_alignment(&self) -> u64 {
        512
    }

    fn disk_format(&self) -> DiskFormat {
        DiskFormat::Raw
    }

    async fn is_available(&self) -> bool {
        !self.unavailable
    }

    fn allocate(&self, name: &str) -> Box<dyn Virtualizer> {
        let (virtualizer, state) = FakeVirtualizer::new();
        state
            .fail_prepare
            .store(self.fail_prepare, Ordering::SeqCst);
        self.allocated
            .lock()
            .unwrap()
            .push((name.to_string(), state));
        Box::new(virtualizer)
    }
}
