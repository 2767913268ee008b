//! Disk image sources: local files used in place or http(s) downloads.

use crate::error::{CoreError, Result};
use crate::operation::Progress;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Where a VM's disk image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    /// File on the host, used in place.
    Local(PathBuf),
    /// Image downloaded into the VM's run directory.
    Remote(String),
}

impl DiskSource {
    /// Classify a disk argument by scheme.
    pub fn parse(source: &str) -> Self {
        let lower = source.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Self::Remote(source.to_string())
        } else {
            Self::Local(PathBuf::from(source))
        }
    }

    /// File name the image is stored under once downloaded.
    fn file_name(&self) -> String {
        match self {
            Self::Local(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "disk.img".to_string()),
            Self::Remote(url) => {
                let path = url.split(&['?', '#'][..]).next().unwrap_or(url);
                path.rsplit('/')
                    .next()
                    .filter(|segment| !segment.is_empty() && !segment.contains(':'))
                    .unwrap_or("disk.img")
                    .to_string()
            }
        }
    }
}

/// Make the disk available on the host and return its path.
///
/// Remote images are downloaded into `dest_dir`, reporting percentage progress
/// on the operation's status stream. Disks whose size is not a multiple of
/// `alignment` are reported but still used.
pub async fn resolve_disk(
    source: &DiskSource,
    dest_dir: &Path,
    alignment: u64,
    progress: &Progress,
) -> Result<PathBuf> {
    let path = match source {
        DiskSource::Local(path) => {
            let metadata = tokio::fs::metadata(path).await.map_err(|e| {
                CoreError::Provisioning(format!("disk {}: {e}", path.display()))
            })?;
            if !metadata.is_file() {
                return Err(CoreError::Provisioning(format!(
                    "disk {} is not a regular file",
                    path.display()
                )));
            }
            progress.log(format!("using disk {}", path.display()));
            path.clone()
        }
        DiskSource::Remote(url) => {
            let dest = dest_dir.join(source.file_name());
            if let Err(e) = download(url, &dest, progress).await {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(e);
            }
            dest
        }
    };

    if alignment > 0 {
        let len = tokio::fs::metadata(&path).await?.len();
        if len % alignment != 0 {
            tracing::warn!(disk = %path.display(), len, alignment, "Disk size is not aligned");
            progress.log(format!(
                "warning: disk size {len} is not a multiple of {alignment} bytes"
            ));
        }
    }
    Ok(path)
}

async fn download(url: &str, dest: &Path, progress: &Progress) -> Result<u64> {
    let start = std::time::Instant::now();
    progress.status(format!("downloading {url}"));

    let mut response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| CoreError::Download(format!("{url}: {e}")))?;

    let total = response.content_length();
    let mut file = tokio::fs::File::create(dest).await?;
    let mut received = 0u64;
    let mut last_percent = None;

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| CoreError::Download(format!("{url}: {e}")))?
    {
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;

        if let Some(total) = total.filter(|t| *t > 0) {
            let percent = received * 100 / total;
            if last_percent.map_or(true, |last| percent >= last + 10) {
                last_percent = Some(percent);
                progress.status(format!("downloading disk: {percent}%"));
            }
        }
    }
    file.flush().await?;

    if let Some(total) = total {
        if received != total {
            return Err(CoreError::Download(format!(
                "{url}: expected {total} bytes, got {received}"
            )));
        }
    }

    tracing::info!(
        url = %url,
        bytes = received,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Disk downloaded"
    );
    progress.status("download complete");
    Ok(received)
}
