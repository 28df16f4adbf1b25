//! Socket endpoints of a transfer.
//!
//! Three independent types play the three roles of a run:
//!
//! - [`FileReader`]: producer; connects to the relay and sends file units
//! - [`FileWriter`]: consumer; connects to the relay and persists what arrives
//! - [`QueuePoint`]: the relay; binds, accepts one of each, forwards bytes
//!
//! They share no base type. Each owns a [`Link`] (address, timeouts,
//! published lifecycle state, optional stream) and implements the
//! [`Endpoint`] capability trait, which provides the common connect and
//! teardown sequences on top of three role-specific hooks.
//!
//! ```text
//!   Connecting ──ok──▶ Connected ──shutdown──▶ ShuttingDown ──▶ Closed
//!        │                                         ▲
//!        └──timeout/refused──▶ Failed ─────────────┘
//! ```

pub mod reader;
pub mod relay;
pub mod writer;

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use reader::{FileReader, SendMode, SendOutcome};
pub use relay::{QueuePoint, RelayPhase, RelaySettings};
pub use writer::{FileWriter, RecvOutcome};

use crate::config::TransferConfig;

/// Which side of the transfer an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Reader,
    Writer,
    Relay,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reader => "FileReader",
            Self::Writer => "FileWriter",
            Self::Relay => "QueuePoint",
        })
    }
}

/// Lifecycle of an endpoint's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Connecting,
    Connected,
    Failed,
    ShuttingDown,
    Closed,
}

/// Bounds on client-side suspension points.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Bound on `connect_or_bind`.
    pub connect: Duration,
    /// Bound on every single send or receive.
    pub io: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(1),
            io: Duration::from_secs(1),
        }
    }
}

impl From<&TransferConfig> for Timeouts {
    fn from(config: &TransferConfig) -> Self {
        Self {
            connect: config.connect_timeout(),
            io: config.io_timeout(),
        }
    }
}

/// Socket state shared by every endpoint type.
pub struct Link {
    role: Role,
    address: SocketAddr,
    timeouts: Timeouts,
    state: watch::Sender<EndpointState>,
    stream: Mutex<Option<TcpStream>>,
}

impl Link {
    pub fn new(role: Role, address: SocketAddr, timeouts: Timeouts) -> Self {
        let (state, _) = watch::channel(EndpointState::Connecting);
        Self {
            role,
            address,
            timeouts,
            state,
            stream: Mutex::new(None),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn state(&self) -> EndpointState {
        *self.state.borrow()
    }

    /// Wait until the connect attempt is over and return the state it left.
    pub async fn wait_settled(&self) -> EndpointState {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(|s| *s != EndpointState::Connecting).await {
            Ok(state) => *state,
            Err(_) => EndpointState::Closed,
        };
        settled
    }

    /// Lock the connected stream. `None` before connect and after shutdown.
    pub async fn stream(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.stream.lock().await
    }

    /// Client-side `connect_or_bind`: connect to the address and keep the stream.
    pub(crate) async fn connect_client(&self) -> io::Result<()> {
        let stream = TcpStream::connect(self.address).await?;
        stream.set_nodelay(true)?;
        let mut slot = self.stream.lock().await;
        if self.transition(EndpointState::Connecting, EndpointState::Connected) {
            *slot = Some(stream);
        } else {
            // Shutdown won the race; the late stream is dropped here.
            debug!("{} connected after shutdown began, discarding stream", self.role);
        }
        Ok(())
    }

    /// Connecting → Connected, for endpoints without a client stream.
    pub(crate) fn mark_connected(&self) -> bool {
        self.transition(EndpointState::Connecting, EndpointState::Connected)
    }

    fn mark_failed(&self) {
        self.transition(EndpointState::Connecting, EndpointState::Failed);
    }

    /// Enter `ShuttingDown`. Returns `false` if shutdown already started.
    fn begin_shutdown(&self) -> bool {
        self.state.send_if_modified(|s| {
            if matches!(s, EndpointState::ShuttingDown | EndpointState::Closed) {
                false
            } else {
                *s = EndpointState::ShuttingDown;
                true
            }
        })
    }

    fn mark_closed(&self) {
        self.state.send_replace(EndpointState::Closed);
    }

    fn transition(&self, from: EndpointState, to: EndpointState) -> bool {
        self.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        })
    }
}

/// Capability contract shared by the reader, the writer and the relay.
pub trait Endpoint: Send + Sync + 'static {
    fn link(&self) -> &Link;

    /// Role-specific connection: clients connect, the relay binds and listens.
    fn connect_or_bind(&self) -> impl Future<Output = io::Result<()>> + Send;

    /// Release what the role owns besides the socket (file, listener, peers).
    /// Called at most once, from [`Endpoint::shutdown_safely`].
    fn release_dependencies(&self) -> impl Future<Output = ()> + Send;

    /// Idempotent, best-effort teardown. Safe to call from any task.
    fn shutdown_safely(&self) -> impl Future<Output = ()> + Send {
        async move {
            let link = self.link();
            if !link.begin_shutdown() {
                debug!("{} already shut down", link.role());
                return;
            }
            info!("{} shutting down safely", link.role());
            self.release_dependencies().await;
            let stream = link.stream.lock().await.take();
            if let Some(stream) = stream {
                close_stream(stream, link.role());
            }
            link.mark_closed();
        }
    }
}

/// Run one bounded connect attempt. A failed attempt is logged and the
/// endpoint is shut down; the state it ends in is returned.
pub async fn connect_safely<E: Endpoint>(endpoint: &E) -> EndpointState {
    let link = endpoint.link();
    let role = link.role();
    match tokio::time::timeout(link.timeouts.connect, endpoint.connect_or_bind()).await {
        Ok(Ok(())) => {
            if link.state() == EndpointState::Connected {
                info!("{role} is safely connected ({})", link.address);
            }
        }
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            warn!("{role} connection refused: {e}");
        }
        Ok(Err(e)) => warn!("{role} connection failed: {e}"),
        Err(_) => warn!(
            "{role} connection timed out after {}ms",
            link.timeouts.connect.as_millis()
        ),
    }

    if link.state() != EndpointState::Connected {
        link.mark_failed();
        endpoint.shutdown_safely().await;
    }
    link.state()
}

/// Spawn [`connect_safely`] so construction does not wait for the peer.
pub fn spawn_connect<E: Endpoint>(endpoint: Arc<E>) -> JoinHandle<EndpointState> {
    tokio::spawn(async move { connect_safely(endpoint.as_ref()).await })
}

/// Shut down both directions and release the socket, ignoring errors from
/// sockets the peer already closed.
pub(crate) fn close_stream(stream: TcpStream, role: Role) {
    match stream.into_std() {
        Ok(stream) => {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!("{role} socket shutdown: {e}");
            }
        }
        Err(e) => debug!("{role} socket release: {e}"),
    }
}
