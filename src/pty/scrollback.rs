//! Throttled append-only scrollback persistence.

use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

/// Minimum interval between flushes to disk.
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Buffers a session's output bytes and appends them to its scrollback
/// file at most once per [`FLUSH_INTERVAL`]. The file is append-only;
/// nothing ever truncates it while the session lives.
pub struct ScrollbackWriter {
    path: PathBuf,
    buffer: Vec<u8>,
    last_flush: Instant,
}

impl ScrollbackWriter {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            buffer: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    /// Buffer output bytes, flushing when the throttle window has passed.
    pub async fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        if self.last_flush.elapsed() >= FLUSH_INTERVAL {
            self.flush().await;
        }
    }

    /// Write any buffered bytes out now. Called on exit and shutdown, and
    /// by the throttle. Errors are logged; scrollback loss never takes the
    /// session down.
    pub async fn flush(&mut self) {
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return;
        }

        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(path = %self.path.display(), error = %e, "Cannot create scrollback dir");
                return;
            }
        }

        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(&self.buffer).await?;
            file.flush().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.buffer.clear();
                self.last_flush = Instant::now();
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Scrollback flush failed");
            }
        }
    }
}
