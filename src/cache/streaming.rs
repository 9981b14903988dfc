use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;

/// Terminal error observed by readers of an aborted download.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    #[error("download aborted")]
    Aborted,
}

#[derive(Debug, Default)]
struct StreamState {
    size: u64,
    done: bool,
    err: Option<StreamError>,
}

/// A write-once, multi-reader cache file. One writer appends; any number of
/// readers tail the file, blocking when they catch up to the writer until
/// more bytes land or the writer completes or aborts.
///
/// The state mutex orders a writer's size publication against reader checks;
/// bytes are flushed to the file before the new size becomes visible, so a
/// reader never reads past the flushed length.
pub struct StreamingFile {
    path: PathBuf,
    state: Mutex<StreamState>,
    notify: Notify,
    writer: tokio::sync::Mutex<Option<fs::File>>,
}

impl StreamingFile {
    pub async fn create(path: PathBuf) -> Result<Self> {
        let mut options = fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o644);
        }
        let file = options
            .open(&path)
            .await
            .with_context(|| format!("failed to create cache file {}", path.display()))?;
        Ok(Self {
            path,
            state: Mutex::new(StreamState::default()),
            notify: Notify::new(),
            writer: tokio::sync::Mutex::new(Some(file)),
        })
    }

    /// Appends bytes and wakes every waiting reader. Fails once the file is
    /// completed or aborted.
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(file) = guard.as_mut() else {
            bail!("streaming file closed");
        };
        file.write_all(buf)
            .await
            .with_context(|| format!("failed to append to {}", self.path.display()))?;

        {
            let mut state = self.state.lock();
            state.size += buf.len() as u64;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Freezes the size, closes the writer handle, and wakes readers so they
    /// can drain the remainder and observe EOF.
    pub async fn complete(&self) {
        let file = self.writer.lock().await.take();
        if let Some(mut file) = file {
            if let Err(err) = file.flush().await {
                tracing::warn!(path = %self.path.display(), error = %err, "flush on complete failed");
            }
        }
        self.state.lock().done = true;
        self.notify.notify_waiters();
    }

    /// Marks the download failed, unlinks the backing file, and wakes readers;
    /// they observe [`StreamError::Aborted`].
    pub async fn abort(&self) {
        drop(self.writer.lock().await.take());
        {
            let mut state = self.state.lock();
            state.done = true;
            state.err = Some(StreamError::Aborted);
        }
        if let Err(err) = fs::remove_file(&self.path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to unlink aborted cache file");
            }
        }
        self.notify.notify_waiters();
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn reader(self: &Arc<Self>) -> StreamingReader {
        StreamingReader {
            sf: self.clone(),
            offset: 0,
            file: None,
        }
    }
}

/// A tailing reader over a [`StreamingFile`]. Each reader owns an independent
/// file handle, opened lazily on first read and advanced strictly forward.
pub struct StreamingReader {
    sf: Arc<StreamingFile>,
    offset: u64,
    file: Option<fs::File>,
}

impl StreamingReader {
    /// Reads the next run of bytes. Returns `Ok(0)` once the writer completed
    /// and all bytes were consumed; blocks while caught up to a live writer.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            // Register for a wakeup while holding the state lock, then await
            // after releasing it, so a broadcast between check and await is
            // never missed.
            let wait = {
                let state = self.sf.state.lock();
                if let Some(err) = state.err {
                    return Err(err.into());
                }
                if state.size > self.offset {
                    None
                } else if state.done {
                    return Ok(0);
                } else {
                    Some(self.sf.notify.notified())
                }
            };
            if let Some(notified) = wait {
                notified.await;
                continue;
            }

            let available = self.sf.state.lock().size - self.offset;
            if self.file.is_none() {
                let file = fs::File::open(&self.sf.path)
                    .await
                    .with_context(|| format!("failed to open {}", self.sf.path.display()))?;
                self.file = Some(file);
            }
            let Some(file) = self.file.as_mut() else {
                bail!("streaming reader lost its file handle");
            };

            let to_read = available.min(buf.len() as u64) as usize;
            let n = file
                .read(&mut buf[..to_read])
                .await
                .with_context(|| format!("failed to read {}", self.sf.path.display()))?;
            if n == 0 {
                // The size said bytes were available; a short filesystem read
                // here means the file was truncated underneath us.
                bail!("unexpected EOF in {}", self.sf.path.display());
            }
            self.offset += n as u64;
            return Ok(n);
        }
    }
}
