//! Queue point: accepts one producer and one consumer and forwards bytes.
//!
//! The relay does no framing and sends no end-of-file marker. Backpressure
//! comes only from the socket buffers. It runs until the shared
//! [`StopSignal`] is set or its wall-clock ceiling elapses, and it sets the
//! signal itself when it hits the ceiling or fails, so the driver always
//! winds down with it.
//!
//! ```text
//! Listening ──accept──▶ ProducerConnected ──accept──▶ Relaying ──▶ Stopped
//!     │                        │                         │
//!     └──────── accept timeout / error ──────────────────┴────▶ Failed
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{close_stream, connect_safely, Endpoint, EndpointState, Link, Role, Timeouts};
use crate::config::Config;
use crate::stop::{StopReason, StopSignal};

/// Progress of the relay's accept-and-forward task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Listening,
    ProducerConnected,
    Relaying,
    Stopped,
    Failed,
}

/// Relay tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Wall-clock ceiling of the forwarding loop.
    pub max_duration: Duration,
    /// Bound on waiting for each of the two peers.
    pub accept_timeout: Duration,
    /// Bound on binding the listener.
    pub bind_timeout: Duration,
    /// How long teardown waits for the forwarding task before aborting it.
    pub shutdown_grace: Duration,
    /// Bytes per producer read.
    pub buffer_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(20),
            accept_timeout: Duration::from_secs(1),
            bind_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
            buffer_size: super::writer::BUFFER_SIZE,
        }
    }
}

impl From<&Config> for RelaySettings {
    fn from(config: &Config) -> Self {
        Self {
            max_duration: config.relay.max_duration(),
            accept_timeout: config.relay.accept_timeout(),
            bind_timeout: config.transfer.connect_timeout(),
            shutdown_grace: config.transfer.io_timeout() + Duration::from_secs(1),
            buffer_size: config.relay.buffer_size,
        }
    }
}

/// Connections accepted by the forwarding task.
#[derive(Default)]
struct Peers {
    producer: Option<TcpStream>,
    consumer: Option<TcpStream>,
}

impl Peers {
    fn close(self) {
        for stream in [self.producer, self.consumer].into_iter().flatten() {
            close_stream(stream, Role::Relay);
        }
    }
}

/// How the forwarding task ended.
enum Halt {
    /// Someone else set the stop signal.
    Stopped(StopReason),
    /// The ceiling elapsed.
    Ceiling,
    /// Accepting or forwarding failed.
    Failed(String),
}

pub struct QueuePoint {
    link: Link,
    settings: RelaySettings,
    stop: StopSignal,
    bound: OnceLock<SocketAddr>,
    listener: Mutex<Option<TcpListener>>,
    task: Mutex<Option<JoinHandle<()>>>,
    phase: watch::Sender<RelayPhase>,
    forwarded: AtomicU64,
    rejected: AtomicU64,
}

impl QueuePoint {
    /// Bind `address`, then run the accept-and-forward loop on its own task.
    ///
    /// Returns once the listener is bound (or binding failed), so clients
    /// created afterwards cannot race the bind. A failed bind leaves the
    /// relay closed and sets the stop signal.
    pub async fn start(address: SocketAddr, settings: RelaySettings, stop: StopSignal) -> Arc<Self> {
        let (phase, _) = watch::channel(RelayPhase::Listening);
        let relay = Arc::new(Self {
            link: Link::new(
                Role::Relay,
                address,
                Timeouts {
                    connect: settings.bind_timeout,
                    ..Timeouts::default()
                },
            ),
            settings,
            stop,
            bound: OnceLock::new(),
            listener: Mutex::new(None),
            task: Mutex::new(None),
            phase,
            forwarded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        });

        if connect_safely(relay.as_ref()).await == EndpointState::Connected {
            let handle = tokio::spawn(Arc::clone(&relay).run());
            *relay.task.lock().await = Some(handle);
        } else {
            relay.phase.send_replace(RelayPhase::Failed);
            relay.stop.set(StopReason::RelayFailed);
        }
        relay
    }

    /// Address actually bound; differs from the requested one when port 0 was asked for.
    pub fn local_addr(&self) -> SocketAddr {
        self.bound.get().copied().unwrap_or(self.link.address())
    }

    pub fn state(&self) -> EndpointState {
        self.link.state()
    }

    pub fn phase(&self) -> RelayPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RelayPhase> {
        self.phase.subscribe()
    }

    /// Bytes forwarded from producer to consumer.
    pub fn forwarded_bytes(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Connections turned away after both peers were accepted.
    pub fn rejected_connections(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    async fn run(self: Arc<Self>) {
        let Some(listener) = self.listener.lock().await.take() else {
            return;
        };

        let mut peers = Peers::default();
        let halt = self.serve(&listener, &mut peers).await;
        // The stop signal is set before the peers see their sockets close.
        match halt {
            Halt::Stopped(reason) => {
                info!("{} stopping ({reason})", Role::Relay);
                self.phase.send_replace(RelayPhase::Stopped);
            }
            Halt::Ceiling => {
                info!(
                    "{} reached its {}s ceiling",
                    Role::Relay,
                    self.settings.max_duration.as_secs_f64()
                );
                self.stop.set(StopReason::Ceiling);
                self.phase.send_replace(RelayPhase::Stopped);
            }
            Halt::Failed(reason) => {
                warn!("{} failed: {reason}", Role::Relay);
                self.stop.set(StopReason::RelayFailed);
                self.phase.send_replace(RelayPhase::Failed);
            }
        }
        peers.close();
        info!(
            forwarded = self.forwarded_bytes(),
            rejected = self.rejected_connections(),
            "{} done",
            Role::Relay
        );
    }

    async fn serve(&self, listener: &TcpListener, peers: &mut Peers) -> Halt {
        let producer = match self.accept_peer(listener, "producer").await {
            Ok(stream) => peers.producer.insert(stream),
            Err(halt) => return halt,
        };
        self.phase.send_replace(RelayPhase::ProducerConnected);

        let consumer = match self.accept_peer(listener, "consumer").await {
            Ok(stream) => peers.consumer.insert(stream),
            Err(halt) => return halt,
        };
        self.phase.send_replace(RelayPhase::Relaying);

        self.forward(listener, producer, consumer).await
    }

    async fn accept_peer(&self, listener: &TcpListener, which: &str) -> Result<TcpStream, Halt> {
        tokio::select! {
            biased;
            reason = self.stop.stopped() => Err(Halt::Stopped(reason)),
            accepted = tokio::time::timeout(self.settings.accept_timeout, listener.accept()) => {
                match accepted {
                    Ok(Ok((stream, peer))) => {
                        info!("{} accepted {which} from {peer}", Role::Relay);
                        Ok(stream)
                    }
                    Ok(Err(e)) => Err(Halt::Failed(format!("accepting {which}: {e}"))),
                    Err(_) => Err(Halt::Failed(format!(
                        "no {which} within {}ms",
                        self.settings.accept_timeout.as_millis()
                    ))),
                }
            }
        }
    }

    async fn forward(
        &self,
        listener: &TcpListener,
        producer: &mut TcpStream,
        consumer: &mut TcpStream,
    ) -> Halt {
        let deadline = Instant::now() + self.settings.max_duration;
        let mut buf = vec![0u8; self.settings.buffer_size.max(1)];
        // Bytes read from the producer that the consumer has not taken yet.
        // The producer is not read again until they are all written.
        let mut pending: Vec<u8> = Vec::with_capacity(buf.len());
        let mut offset = 0;
        // Cleared after a zero-length read; the relay keeps running until
        // stopped, it just stops polling a producer with nothing left.
        let mut producer_open = true;

        loop {
            let draining = offset < pending.len();
            tokio::select! {
                biased;
                reason = self.stop.stopped() => break Halt::Stopped(reason),
                () = tokio::time::sleep_until(deadline) => break Halt::Ceiling,
                accepted = listener.accept() => match accepted {
                    Ok((extra, peer)) => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!("{} rejected extra connection from {peer}", Role::Relay);
                        close_stream(extra, Role::Relay);
                    }
                    Err(e) => debug!("{} accept while relaying: {e}", Role::Relay),
                },
                written = consumer.write(&pending[offset..]), if draining => match written {
                    Ok(0) => break Halt::Failed("consumer closed".to_string()),
                    Ok(n) => {
                        offset += n;
                        self.forwarded.fetch_add(n as u64, Ordering::Relaxed);
                        if offset == pending.len() {
                            pending.clear();
                            offset = 0;
                        }
                    }
                    Err(e) => break Halt::Failed(format!("forwarding to consumer: {e}")),
                },
                read = producer.read(&mut buf), if producer_open && !draining => match read {
                    Ok(0) => {
                        debug!("{} producer sent nothing; forwarding no-op", Role::Relay);
                        producer_open = false;
                    }
                    Ok(n) => pending.extend_from_slice(&buf[..n]),
                    Err(e) => break Halt::Failed(format!("reading from producer: {e}")),
                },
            }
        }
    }
}

impl Endpoint for QueuePoint {
    fn link(&self) -> &Link {
        &self.link
    }

    async fn connect_or_bind(&self) -> io::Result<()> {
        let listener = TcpListener::bind(self.link.address()).await?;
        let local = listener.local_addr()?;
        let _ = self.bound.set(local);
        *self.listener.lock().await = Some(listener);
        if self.link.mark_connected() {
            info!("{} listening on {local}", Role::Relay);
        }
        Ok(())
    }

    async fn release_dependencies(&self) {
        drop(self.listener.lock().await.take());

        let task = self.task.lock().await.take();
        if let Some(mut handle) = task {
            if self.stop.set(StopReason::Shutdown) {
                info!("{} asked to stop", Role::Relay);
            }
            match tokio::time::timeout(self.settings.shutdown_grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{} task ended abnormally: {e}", Role::Relay),
                Err(_) => {
                    warn!("{} task did not stop in time, aborting", Role::Relay);
                    handle.abort();
                }
            }
        }
    }
}
