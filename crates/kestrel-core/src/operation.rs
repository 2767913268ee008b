//! Asynchronous preparation protocol.
//!
//! Every prepare hands the caller an [`Operation`] right away while the
//! backend works in a background task. The task reports through a
//! [`Progress`] and ends by calling [`Progress::finish`], which runs at most
//! once no matter how many failure paths race to call it. Closure of the
//! streams is the completion signal.

use crate::error::{CoreError, Result};
use crate::handle::Handle;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

struct Channels {
    log: mpsc::UnboundedSender<String>,
    status: mpsc::UnboundedSender<String>,
    error: mpsc::Sender<CoreError>,
}

/// Reporting side of an [`Operation`], held by the worker task.
#[derive(Clone)]
pub struct Progress {
    vm: Arc<str>,
    channels: Arc<Mutex<Option<Channels>>>,
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("vm", &self.vm)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Progress {
    fn with_channels<F>(&self, f: F)
    where
        F: FnOnce(&Channels),
    {
        let guard = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(channels) = guard.as_ref() {
            f(channels);
        }
    }

    /// Verbose progress line.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(vm = %self.vm, "{}", message);
        self.with_channels(|c| {
            let _ = c.log.send(message);
        });
    }

    /// Coarse status update.
    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(vm = %self.vm, status = %message, "Preparation status");
        self.with_channels(|c| {
            let _ = c.status.send(message);
        });
    }

    /// Whether [`finish`](Self::finish) has already run.
    pub fn is_finished(&self) -> bool {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Complete the operation and close every stream.
    ///
    /// On failure a final message goes to the log, status and error streams
    /// first. Returns `false` if the operation had already finished.
    pub fn finish(&self, result: Result<()>) -> bool {
        let taken = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(channels) = taken else {
            return false;
        };

        match result {
            Ok(()) => {
                tracing::debug!(vm = %self.vm, "Operation finished");
            }
            Err(e) => {
                tracing::warn!(vm = %self.vm, error = %e, "Operation failed");
                let _ = channels.log.send(format!("error: {e}"));
                let _ = channels.status.send("failed".to_string());
                let _ = channels.error.try_send(e);
            }
        }
        true
    }
}

/// A preparation in flight.
///
/// Drain it with [`wait`](Self::wait), or read the individual streams.
pub struct Operation {
    handle: Arc<Handle>,
    log: mpsc::UnboundedReceiver<String>,
    status: mpsc::UnboundedReceiver<String>,
    error: mpsc::Receiver<CoreError>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("vm", &self.handle.name())
            .finish()
    }
}

impl Operation {
    /// Create an operation for `handle` and the progress reporter that completes it.
    pub fn new(handle: Arc<Handle>) -> (Self, Progress) {
        let (log_tx, log) = mpsc::unbounded_channel();
        let (status_tx, status) = mpsc::unbounded_channel();
        let (error_tx, error) = mpsc::channel(1);

        let progress = Progress {
            vm: Arc::from(handle.name()),
            channels: Arc::new(Mutex::new(Some(Channels {
                log: log_tx,
                status: status_tx,
                error: error_tx,
            }))),
        };
        (
            Self {
                handle,
                log,
                status,
                error,
            },
            progress,
        )
    }

    /// The handle being prepared.
    pub fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }

    /// Next verbose log line, `None` once the operation has finished.
    pub async fn next_log(&mut self) -> Option<String> {
        self.log.recv().await
    }

    /// Next status update, `None` once the operation has finished.
    pub async fn next_status(&mut self) -> Option<String> {
        self.status.recv().await
    }

    /// The operation's error, `None` if it finished successfully.
    ///
    /// Waits for the operation to finish.
    pub async fn error(&mut self) -> Option<CoreError> {
        self.error.recv().await
    }

    /// Drain every stream and return the handle, or the error the operation
    /// failed with.
    pub async fn wait(mut self) -> Result<Arc<Handle>> {
        let name = self.handle.name().to_string();
        loop {
            tokio::select! {
                Some(line) = self.log.recv() => {
                    tracing::trace!(vm = %name, "{}", line);
                }
                Some(status) = self.status.recv() => {
                    tracing::trace!(vm = %name, status = %status, "Status");
                }
                else => break,
            }
        }
        match self.error.recv().await {
            Some(e) => Err(e),
            None => Ok(self.handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::fake::FakeVirtualizer;
    use crate::config::LifecycleTimings;

    fn handle() -> Arc<Handle> {
        Handle::standalone("op-test", Box::new(FakeVirtualizer::default()), LifecycleTimings::fast())
    }

    #[tokio::test]
    async fn test_success_closes_streams_without_error() {
        let (op, progress) = Operation::new(handle());
        progress.log("step one");
        progress.status("preparing");
        assert!(progress.finish(Ok(())));

        let handle = op.wait().await.unwrap();
        assert_eq!(handle.name(), "op-test");
    }

    #[tokio::test]
    async fn test_failure_reaches_all_streams() {
        let (mut op, progress) = Operation::new(handle());
        progress.finish(Err(CoreError::Provisioning("no disk".into())));

        assert_eq!(op.next_log().await.unwrap(), "error: provisioning failed: no disk");
        assert!(op.next_log().await.is_none());
        assert_eq!(op.next_status().await.unwrap(), "failed");
        assert!(op.next_status().await.is_none());
        assert!(matches!(op.error().await, Some(CoreError::Provisioning(_))));
        assert!(op.error().await.is_none());
    }

    #[tokio::test]
    async fn test_messages_after_finish_are_dropped() {
        let (mut op, progress) = Operation::new(handle());
        progress.finish(Ok(()));
        progress.log("too late");
        assert!(progress.is_finished());
        assert!(op.next_log().await.is_none());
    }

    #[tokio::test]
    async fn test_finish_runs_exactly_once_under_contention() {
        let (op, progress) = Operation::new(handle());

        let mut tasks = Vec::new();
        for i in 0..16 {
            let progress = progress.clone();
            tasks.push(tokio::spawn(async move {
                progress.finish(Err(CoreError::Provisioning(format!("failure {i}"))))
            }));
        }

        let mut finished = 0;
        for task in tasks {
            if task.await.unwrap() {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);

        let err = op.wait().await.unwrap_err();
        assert!(matches!(err, CoreError::Provisioning(_)));
    }
}
