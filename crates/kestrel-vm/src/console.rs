//! Console transport dialing.
//!
//! Hypervisors that expose the guest serial port as a local server endpoint
//! (VirtualBox `--uartmode1 server`) are reached through [`dial_console`]: a
//! Unix-domain socket on Unix hosts, a named pipe on Windows.

use std::path::Path;
use std::time::Duration;

#[cfg(unix)]
pub type ConsoleStream = tokio::net::UnixStream;

#[cfg(windows)]
pub type ConsoleStream = tokio::net::windows::named_pipe::NamedPipeClient;

/// Connect to a console endpoint once.
#[cfg(unix)]
pub async fn dial_console(path: &Path) -> std::io::Result<ConsoleStream> {
    tokio::net::UnixStream::connect(path).await
}

/// Connect to a console endpoint once.
#[cfg(windows)]
pub async fn dial_console(path: &Path) -> std::io::Result<ConsoleStream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(path)
}

/// Connect to a console endpoint, retrying while the hypervisor creates it.
pub async fn dial_console_retry(
    path: &Path,
    attempts: u32,
    interval: Duration,
) -> std::io::Result<ConsoleStream> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match dial_console(path).await {
            Ok(stream) => {
                tracing::debug!(path = %path.display(), attempt, "Console connected");
                return Ok(stream);
            }
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                tracing::trace!(path = %path.display(), attempt, error = %e, "Console not ready, retrying");
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Platform-appropriate console endpoint for a machine.
///
/// Unix sockets live in the machine's run directory; named pipes live in the
/// global pipe namespace and are keyed by machine name.
pub fn console_endpoint(run_dir: &Path, name: &str) -> std::path::PathBuf {
    #[cfg(windows)]
    {
        let _ = run_dir;
        std::path::PathBuf::from(format!(r"\\.\pipe\kestrel-{name}"))
    }
    #[cfg(not(windows))]
    {
        let _ = name;
        run_dir.join("console.sock")
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dial_retry_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        let result = dial_console_retry(&path, 2, Duration::from_millis(5)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dial_connects_to_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = console_endpoint(dir.path(), "vm1");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"login: ").await.unwrap();
        });

        let mut stream = dial_console_retry(&path, 10, Duration::from_millis(5))
            .await
            .unwrap();
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"login: ");
    }
}
