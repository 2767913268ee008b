//! DHCP responder supervision.
//!
//! Guests on the bridge get their addresses from a `dnsmasq` child bound to
//! the bridge. The supervisor restarts it when it dies and gives up after
//! repeated quick failures.

use crate::config::TapdConfig;
use crate::error::{Result, TapdError};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;

/// Quick failures tolerated before the supervisor gives up.
const MAX_QUICK_FAILURES: u32 = 5;
/// A run shorter than this counts as a quick failure.
const QUICK_FAILURE: Duration = Duration::from_secs(10);
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// How to run the DHCP responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpConfig {
    /// `dnsmasq` binary.
    pub program: PathBuf,
    /// Interface to serve.
    pub interface: String,
    /// `--dhcp-range` value.
    pub range: String,
}

impl DhcpConfig {
    /// DHCP settings from the helper configuration, if DHCP is enabled.
    pub fn from_tapd(config: &TapdConfig) -> Option<Self> {
        config.dhcp_enabled.then(|| Self {
            program: config.dnsmasq_path.clone(),
            interface: config.bridge.clone(),
            range: config.dhcp_range.clone(),
        })
    }

    /// Command-line arguments: DHCP only, no DNS, in the foreground.
    pub fn args(&self) -> Vec<String> {
        vec![
            "--keep-in-foreground".into(),
            "--log-facility=-".into(),
            "--port=0".into(),
            "--no-resolv".into(),
            "--no-hosts".into(),
            "--bind-interfaces".into(),
            format!("--interface={}", self.interface),
            "--except-interface=lo".into(),
            format!("--dhcp-range={}", self.range),
            "--dhcp-authoritative".into(),
            "--leasefile-ro".into(),
        ]
    }

    fn spawn(&self) -> Result<Child> {
        let mut child = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TapdError::Dhcp(format!("spawn {}: {e}", self.program.display())))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("dnsmasq: {}", line);
                }
            });
        }
        tracing::info!(pid = ?child.id(), interface = %self.interface, range = %self.range, "DHCP responder started");
        Ok(child)
    }
}

/// Keep `dnsmasq` running until `shutdown` fires.
///
/// # Errors
/// Returns [`TapdError::Dhcp`] once the responder has failed quickly
/// [`MAX_QUICK_FAILURES`] times in a row.
pub async fn supervise(config: DhcpConfig, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let mut quick_failures = 0;
    loop {
        let started = Instant::now();
        let outcome = match config.spawn() {
            Ok(mut child) => {
                tokio::select! {
                    status = child.wait() => Some(status.map(|s| s.to_string())),
                    _ = shutdown.recv() => {
                        tracing::info!("Stopping DHCP responder");
                        if let Err(e) = child.kill().await {
                            tracing::warn!(error = %e, "Failed to stop DHCP responder");
                        }
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "DHCP responder failed to start");
                None
            }
        };

        match outcome {
            Some(Ok(status)) => tracing::warn!(%status, "DHCP responder exited"),
            Some(Err(e)) => tracing::warn!(error = %e, "Lost track of DHCP responder"),
            None => {}
        }

        if started.elapsed() < QUICK_FAILURE {
            quick_failures += 1;
        } else {
            quick_failures = 1;
        }
        if quick_failures >= MAX_QUICK_FAILURES {
            return Err(TapdError::Dhcp(format!(
                "giving up after {quick_failures} quick failures"
            )));
        }

        tokio::select! {
            _ = tokio::time::sleep(RESTART_DELAY) => {}
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DhcpConfig {
        DhcpConfig {
            program: PathBuf::from("/nonexistent/dnsmasq"),
            interface: "kestrel0".into(),
            range: "10.77.0.10,10.77.0.250,12h".into(),
        }
    }

    #[test]
    fn test_args_bind_to_bridge() {
        let args = config().args();
        assert!(args.contains(&"--interface=kestrel0".to_string()));
        assert!(args.contains(&"--dhcp-range=10.77.0.10,10.77.0.250,12h".to_string()));
        assert!(args.contains(&"--port=0".to_string()));
    }

    #[test]
    fn test_disabled_dhcp_has_no_config() {
        let tapd = TapdConfig {
            dhcp_enabled: false,
            ..Default::default()
        };
        assert!(DhcpConfig::from_tapd(&tapd).is_none());

        let enabled = DhcpConfig::from_tapd(&TapdConfig::default()).unwrap();
        assert_eq!(enabled.interface, "kestrel0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_gives_up_on_missing_binary() {
        let (_tx, rx) = broadcast::channel(1);
        let err = supervise(config(), rx).await.unwrap_err();
        assert!(matches!(err, TapdError::Dhcp(_)));
    }

    #[tokio::test]
    async fn test_supervisor_stops_on_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(supervise(config(), rx));
        tx.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }
}
