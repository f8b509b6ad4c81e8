//! Follow a growing log file line by line.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Pull-based source of log lines.
///
/// `Ok(None)` means the stream has ended (or shutdown was requested).
#[async_trait]
pub trait LineSource: Send {
    async fn next_line(&mut self) -> Result<Option<String>>;
}

/// Tails a file from its current end, never replaying history
pub struct LogTailer {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    file_id: Option<u64>,
    pending: Vec<u8>,
    poll_interval: Duration,
    follow_rotation: bool,
    shutdown: CancellationToken,
}

impl LogTailer {
    pub async fn open<P: AsRef<Path>>(
        path: P,
        poll_interval: Duration,
        follow_rotation: bool,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (mut file, file_id) = open_file(&path).await?;
        let offset = file
            .seek(SeekFrom::End(0))
            .await
            .map_err(|source| Error::LogRead {
                path: path.clone(),
                source,
            })?;

        info!("Tailing {} from offset {}", path.display(), offset);

        Ok(Self {
            path,
            reader: BufReader::new(file),
            offset,
            file_id,
            pending: Vec::new(),
            poll_interval,
            follow_rotation,
            shutdown,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the path now refers to a truncated or different file
    async fn rotated(&self) -> bool {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) => {
                debug!("Cannot stat {}: {}", self.path.display(), e);
                return false;
            }
        };

        if meta.len() < self.offset {
            return true;
        }
        matches!((self.file_id, inode(&meta)), (Some(old), Some(new)) if old != new)
    }

    async fn reopen(&mut self) -> Result<()> {
        let (file, file_id) = open_file(&self.path).await?;
        if !self.pending.is_empty() {
            debug!(
                "Discarding {} bytes of unterminated line after rotation",
                self.pending.len()
            );
            self.pending.clear();
        }

        self.reader = BufReader::new(file);
        self.offset = 0;
        self.file_id = file_id;
        info!(
            "Log file {} was rotated, reading from the beginning",
            self.path.display()
        );
        Ok(())
    }
}

#[async_trait]
impl LineSource for LogTailer {
    async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(None);
            }

            let read = self
                .reader
                .read_until(b'\n', &mut self.pending)
                .await
                .map_err(|source| Error::LogRead {
                    path: self.path.clone(),
                    source,
                })?;
            self.offset += read as u64;

            if read > 0 && self.pending.ends_with(b"\n") {
                let raw = std::mem::take(&mut self.pending);
                let line = String::from_utf8_lossy(&raw)
                    .trim_end_matches(&['\n', '\r'][..])
                    .to_string();
                return Ok(Some(line));
            }
            if read > 0 {
                // Partial line; keep it and look again
                continue;
            }

            if self.follow_rotation && self.rotated().await {
                self.reopen().await?;
                continue;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

async fn open_file(path: &Path) -> Result<(File, Option<u64>)> {
    let file = File::open(path).await.map_err(|source| Error::LogOpen {
        path: path.to_path_buf(),
        source,
    })?;
    let file_id = match file.metadata().await {
        Ok(meta) => inode(&meta),
        Err(_) => None,
    };
    Ok((file, file_id))
}

#[cfg(unix)]
fn inode(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn inode(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Fixed sequence of lines, ending once drained
#[derive(Debug, Default, Clone)]
pub struct VecLineSource {
    lines: VecDeque<String>,
}

impl VecLineSource {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl LineSource for VecLineSource {
    async fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.lines.pop_front())
    }
}
