//! Producer side: reads the source file and sends it to the queue point.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{spawn_connect, Endpoint, EndpointState, Link, Role, Timeouts};
use crate::error::{Error, Result};
use crate::stop::{StopReason, StopSignal};

/// How the reader cuts the source into transfer units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    /// One newline-terminated record per unit.
    #[default]
    Line,
    /// Everything left in the file as a single unit.
    Burst,
}

impl SendMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::Burst => "burst",
        }
    }
}

/// Result of one [`FileReader::send_next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// `n` bytes of the current unit went out. The unit may still be
    /// partly pending if the socket filled up.
    Sent(usize),
    /// A fresh unit could not start within the I/O timeout; it stays pending.
    TimedOut,
    /// The socket is still full from the pending unit; nothing was written.
    Blocked,
    /// The file is exhausted; the stop signal is now set.
    Exhausted,
    /// The stop signal was already set; nothing was done.
    Stopped,
}

/// The open source file plus the unit currently being sent.
struct Source {
    file: BufReader<File>,
    unit: Vec<u8>,
    written: usize,
}

pub struct FileReader {
    link: Link,
    path: PathBuf,
    mode: SendMode,
    stop: StopSignal,
    source: Mutex<Option<Source>>,
    bytes_read: AtomicU64,
    bytes_sent: AtomicU64,
}

impl FileReader {
    /// Open `path` and start connecting to `address` in the background.
    ///
    /// Fails with [`Error::NotAFile`] before any network action if `path` is
    /// not a regular file.
    pub async fn open(
        address: SocketAddr,
        path: &Path,
        mode: SendMode,
        timeouts: Timeouts,
        stop: StopSignal,
    ) -> Result<Arc<Self>> {
        let is_file = tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(Error::NotAFile(path.to_path_buf()));
        }

        let file = File::open(path).await?;
        let reader = Arc::new(Self {
            link: Link::new(Role::Reader, address, timeouts),
            path: path.to_path_buf(),
            mode,
            stop,
            source: Mutex::new(Some(Source {
                file: BufReader::new(file),
                unit: Vec::new(),
                written: 0,
            })),
            bytes_read: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        });
        spawn_connect(Arc::clone(&reader));
        Ok(reader)
    }

    pub fn state(&self) -> EndpointState {
        self.link.state()
    }

    pub async fn wait_settled(&self) -> EndpointState {
        self.link.wait_settled().await
    }

    /// Bytes written to the socket so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Acquire)
    }

    /// Whether a unit was read from the file but not fully written yet.
    pub fn has_pending(&self) -> bool {
        self.bytes_read.load(Ordering::Acquire) > self.bytes_sent()
    }

    /// Send the next unit in the configured mode.
    pub async fn send_next(&self) -> Result<SendOutcome> {
        match self.mode {
            SendMode::Line => self.send_line().await,
            SendMode::Burst => self.send_lines().await,
        }
    }

    /// Burst mode: send everything left in the file at once.
    pub async fn send_lines(&self) -> Result<SendOutcome> {
        self.send_unit(SendMode::Burst).await
    }

    /// Line mode: send one line, up to and including its `\n`.
    pub async fn send_line(&self) -> Result<SendOutcome> {
        self.send_unit(SendMode::Line).await
    }

    async fn send_unit(&self, mode: SendMode) -> Result<SendOutcome> {
        if self.stop.is_set() {
            return Ok(SendOutcome::Stopped);
        }

        let mut guard = self.source.lock().await;
        let source = guard.as_mut().ok_or(Error::NotConnected(Role::Reader))?;

        if source.written == source.unit.len() {
            source.unit.clear();
            source.written = 0;
            let n = match mode {
                SendMode::Line => source.file.read_until(b'\n', &mut source.unit).await?,
                SendMode::Burst => source.file.read_to_end(&mut source.unit).await?,
            };
            if n == 0 {
                if self.stop.set(StopReason::Exhausted) {
                    info!(
                        "{} reached end of {} after {} bytes",
                        Role::Reader,
                        self.path.display(),
                        self.bytes_sent()
                    );
                }
                return Ok(SendOutcome::Exhausted);
            }
            self.bytes_read.fetch_add(n as u64, Ordering::AcqRel);
        }

        let mut stream = self.link.stream().await;
        let stream = stream.as_mut().ok_or(Error::NotConnected(Role::Reader))?;
        let io_timeout = self.link.timeouts().io;

        // Only the first write of a fresh unit may wait. Everything after it,
        // and every write of a resumed unit, stops as soon as the socket is
        // full so the writer gets a turn to drain the relay.
        let fresh = source.written == 0;
        let mut sent = 0;
        while source.written < source.unit.len() {
            let remaining = &source.unit[source.written..];
            let written = if fresh && sent == 0 {
                match tokio::time::timeout(io_timeout, stream.write(remaining)).await {
                    Ok(written) => written,
                    Err(_) => {
                        debug!(pending = remaining.len(), "send timed out");
                        return Ok(SendOutcome::TimedOut);
                    }
                }
            } else {
                match stream.try_write(remaining) {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    written => written,
                }
            };
            match written {
                Ok(0) => return Err(Error::PeerClosed(Role::Reader)),
                Ok(n) => {
                    source.written += n;
                    sent += n;
                    self.bytes_sent.fetch_add(n as u64, Ordering::AcqRel);
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Ok(SendOutcome::TimedOut);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if sent == 0 {
            return Ok(SendOutcome::Blocked);
        }
        if source.written < source.unit.len() {
            debug!(sent, pending = source.unit.len() - source.written, "socket full");
        }
        Ok(SendOutcome::Sent(sent))
    }
}

impl Endpoint for FileReader {
    fn link(&self) -> &Link {
        &self.link
    }

    async fn connect_or_bind(&self) -> io::Result<()> {
        self.link.connect_client().await
    }

    async fn release_dependencies(&self) {
        if self.source.lock().await.take().is_some() {
            debug!("{} closed {}", Role::Reader, self.path.display());
        }
    }
}
