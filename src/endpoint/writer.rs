//! Consumer side: receives from the queue point and appends to the destination.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{spawn_connect, Endpoint, EndpointState, Link, Role, Timeouts};
use crate::error::{Error, Result};
use crate::stop::StopSignal;

/// Default size of a single receive.
pub const BUFFER_SIZE: usize = 512;

/// Result of one [`FileWriter::receive_line`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// `n` bytes arrived and were appended to the destination.
    Received(usize),
    /// Nothing arrived within the I/O timeout.
    TimedOut,
    /// The stop signal was already set; nothing was read.
    Stopped,
    /// The relay closed the connection.
    Closed,
}

pub struct FileWriter {
    link: Link,
    path: PathBuf,
    buffer_size: usize,
    stop: StopSignal,
    sink: Mutex<Option<File>>,
    bytes_received: AtomicU64,
}

impl FileWriter {
    /// Replace any file at `path` with an empty one opened for appending, and
    /// start connecting to `address` in the background.
    pub async fn open(
        address: SocketAddr,
        path: &Path,
        buffer_size: usize,
        timeouts: Timeouts,
        stop: StopSignal,
    ) -> Result<Arc<Self>> {
        if tokio::fs::metadata(path)
            .await
            .is_ok_and(|m| m.is_file())
        {
            tokio::fs::remove_file(path).await?;
            debug!("{} removed stale {}", Role::Writer, path.display());
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let writer = Arc::new(Self {
            link: Link::new(Role::Writer, address, timeouts),
            path: path.to_path_buf(),
            buffer_size: buffer_size.max(1),
            stop,
            sink: Mutex::new(Some(file)),
            bytes_received: AtomicU64::new(0),
        });
        spawn_connect(Arc::clone(&writer));
        Ok(writer)
    }

    pub fn state(&self) -> EndpointState {
        self.link.state()
    }

    pub async fn wait_settled(&self) -> EndpointState {
        self.link.wait_settled().await
    }

    /// Bytes received and persisted so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Acquire)
    }

    /// Perform one bounded read and append whatever arrived.
    pub async fn receive_line(&self) -> Result<RecvOutcome> {
        if self.stop.is_set() {
            return Ok(RecvOutcome::Stopped);
        }

        let mut buf = vec![0u8; self.buffer_size];
        let n = {
            let mut stream = self.link.stream().await;
            let stream = stream.as_mut().ok_or(Error::NotConnected(Role::Writer))?;
            match tokio::time::timeout(self.link.timeouts().io, stream.read(&mut buf)).await {
                Err(_) => return Ok(RecvOutcome::TimedOut),
                Ok(Ok(0)) => return Ok(RecvOutcome::Closed),
                Ok(Ok(n)) => n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
                    return Ok(RecvOutcome::TimedOut)
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        };
        let chunk = &buf[..n];

        {
            let mut sink = self.sink.lock().await;
            let file = sink.as_mut().ok_or(Error::NotConnected(Role::Writer))?;
            file.write_all(chunk).await?;
            file.flush().await?;
        }
        self.bytes_received.fetch_add(n as u64, Ordering::AcqRel);

        let text = String::from_utf8_lossy(chunk);
        info!(target: "qrelay::echo", "{}", text.strip_suffix('\n').unwrap_or(&*text));

        Ok(RecvOutcome::Received(n))
    }
}

impl Endpoint for FileWriter {
    fn link(&self) -> &Link {
        &self.link
    }

    async fn connect_or_bind(&self) -> io::Result<()> {
        self.link.connect_client().await
    }

    async fn release_dependencies(&self) {
        let Some(mut file) = self.sink.lock().await.take() else {
            return;
        };
        if let Err(e) = file.flush().await {
            debug!("{} flush on close: {e}", Role::Writer);
        }
        if let Err(e) = file.sync_all().await {
            debug!("{} sync on close: {e}", Role::Writer);
        }
        debug!("{} closed {}", Role::Writer, self.path.display());
    }
}
