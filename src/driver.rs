//! Transfer driver: wires relay, reader and writer together and runs the
//! send/receive alternation until the stop signal is set.
//!
//! A run goes:
//!
//! 1. resolve the relay address and start the [`QueuePoint`]
//! 2. open the [`FileReader`] and wait for it to connect (the relay takes the
//!    first connection as its producer)
//! 3. open the [`FileWriter`] and wait for it to connect (the consumer)
//! 4. spawn [`drive`] and join it
//! 5. shut down relay, reader and writer, in that order
//!
//! Integrity checking is left to the caller (see [`crate::integrity`]).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::endpoint::{
    Endpoint, EndpointState, FileReader, FileWriter, QueuePoint, RecvOutcome, RelaySettings,
    Role, SendOutcome, Timeouts,
};
use crate::error::{Error, Result};
use crate::stop::{StopReason, StopSignal};

/// Summary of one finished run.
#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub run_id: String,
    pub mode: &'static str,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bytes_forwarded: u64,
    pub rejected_connections: u64,
    #[serde(serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub stop_reason: Option<StopReason>,
}

impl TransferReport {
    /// Whether the run ended because the source was fully sent.
    pub fn completed(&self) -> bool {
        self.stop_reason == Some(StopReason::Exhausted) && self.bytes_sent == self.bytes_received
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Resolve `host:port`; the first address returned wins.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| {
            debug!("lookup of {host}:{port} failed: {e}");
            Error::Resolve(format!("{host}:{port}"))
        })?
        .next()
        .ok_or_else(|| Error::Resolve(format!("{host}:{port}")))
}

/// Alternate reader-send and writer-receive until the stop signal is set.
///
/// A new unit is only requested once the writer has everything the reader
/// sent so far; until then iterations are receive-only, except that a unit
/// left pending by a full socket keeps being pushed. Timeouts on either side
/// mean "nothing this cycle" and the loop goes on. Socket errors that show up
/// after the stop signal was set are the relay closing its peers and end the
/// loop quietly.
pub async fn drive(reader: &FileReader, writer: &FileWriter, stop: &StopSignal) -> Result<()> {
    info!("Message start ----");
    while !stop.is_set() {
        let caught_up = writer.bytes_received() >= reader.bytes_sent();
        if caught_up || reader.has_pending() {
            match reader.send_next().await {
                Ok(SendOutcome::Sent(n)) => debug!(n, "unit sent"),
                Ok(SendOutcome::TimedOut) => debug!("send timed out, retrying next cycle"),
                Ok(SendOutcome::Blocked) => debug!("socket full, draining first"),
                Ok(SendOutcome::Exhausted | SendOutcome::Stopped) => {}
                Err(e) if stop.is_set() => {
                    debug!("send after stop: {e}");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        match writer.receive_line().await {
            Ok(RecvOutcome::Received(n)) => debug!(n, "chunk received"),
            Ok(RecvOutcome::TimedOut) => debug!("nothing arrived this cycle"),
            Ok(RecvOutcome::Stopped) => {}
            Ok(RecvOutcome::Closed) if stop.is_set() => {}
            Ok(RecvOutcome::Closed) => return Err(Error::PeerClosed(Role::Writer)),
            Err(e) if stop.is_set() => {
                debug!("receive after stop: {e}");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    info!("Message end ----");
    Ok(())
}

/// Best-effort teardown in the fixed order relay, reader, writer.
async fn teardown(relay: &QueuePoint, reader: Option<&FileReader>, writer: Option<&FileWriter>) {
    relay.shutdown_safely().await;
    if let Some(reader) = reader {
        reader.shutdown_safely().await;
    }
    if let Some(writer) = writer {
        writer.shutdown_safely().await;
    }
}

/// Run a whole transfer as configured. `stop` may be set from outside (e.g.
/// on Ctrl-C) to end the run early.
pub async fn run_transfer(config: &Config, stop: StopSignal) -> Result<TransferReport> {
    let run_id = Uuid::new_v4().to_string();
    let span = info_span!("transfer", run = %run_id);
    run(config, stop, run_id).instrument(span).await
}

async fn run(config: &Config, stop: StopSignal, run_id: String) -> Result<TransferReport> {
    let started = Instant::now();
    let mode = config.transfer.mode;
    let timeouts = Timeouts::from(&config.transfer);

    let address = resolve(&config.relay.host, config.relay.port).await?;
    let relay = QueuePoint::start(address, RelaySettings::from(config), stop.clone()).await;
    if relay.state() != EndpointState::Connected {
        teardown(&relay, None, None).await;
        return Err(Error::ConnectFailed(Role::Relay));
    }
    let address = relay.local_addr();

    let reader = match FileReader::open(
        address,
        &config.transfer.source,
        mode,
        timeouts,
        stop.clone(),
    )
    .await
    {
        Ok(reader) => reader,
        Err(e) => {
            teardown(&relay, None, None).await;
            return Err(e);
        }
    };
    if reader.wait_settled().await != EndpointState::Connected {
        teardown(&relay, Some(&reader), None).await;
        return Err(Error::ConnectFailed(Role::Reader));
    }

    let writer = match FileWriter::open(
        address,
        &config.transfer.destination,
        config.relay.buffer_size,
        timeouts,
        stop.clone(),
    )
    .await
    {
        Ok(writer) => writer,
        Err(e) => {
            teardown(&relay, Some(&reader), None).await;
            return Err(e);
        }
    };
    if writer.wait_settled().await != EndpointState::Connected {
        teardown(&relay, Some(&reader), Some(&writer)).await;
        return Err(Error::ConnectFailed(Role::Writer));
    }

    info!(
        mode = mode.as_str(),
        source = %config.transfer.source.display(),
        destination = %config.transfer.destination.display(),
        "Transferring through {address}"
    );

    let loop_task = {
        let reader = Arc::clone(&reader);
        let writer = Arc::clone(&writer);
        let stop = stop.clone();
        tokio::spawn(
            async move { drive(&reader, &writer, &stop).await }.in_current_span(),
        )
    };
    let outcome = match loop_task.await {
        Ok(result) => result,
        Err(e) => Err(Error::Task(e.to_string())),
    };

    teardown(&relay, Some(&reader), Some(&writer)).await;
    outcome?;

    let report = TransferReport {
        run_id,
        mode: mode.as_str(),
        bytes_sent: reader.bytes_sent(),
        bytes_received: writer.bytes_received(),
        bytes_forwarded: relay.forwarded_bytes(),
        rejected_connections: relay.rejected_connections(),
        elapsed: started.elapsed(),
        stop_reason: stop.reason(),
    };
    info!(
        sent = report.bytes_sent,
        received = report.bytes_received,
        stop = ?report.stop_reason,
        "Transfer finished in {}ms",
        report.elapsed.as_millis()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::SendMode;

    fn report(stop_reason: Option<StopReason>, sent: u64, received: u64) -> TransferReport {
        TransferReport {
            run_id: "test".into(),
            mode: SendMode::Line.as_str(),
            bytes_sent: sent,
            bytes_received: received,
            bytes_forwarded: received,
            rejected_connections: 0,
            elapsed: Duration::from_millis(1500),
            stop_reason,
        }
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let addr = resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = resolve("localhost", 0).await.unwrap();
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_completed_requires_exhaustion_and_full_delivery() {
        assert!(report(Some(StopReason::Exhausted), 10, 10).completed());
        assert!(!report(Some(StopReason::Exhausted), 10, 7).completed());
        assert!(!report(Some(StopReason::Ceiling), 10, 10).completed());
        assert!(!report(None, 0, 0).completed());
    }

    #[test]
    fn test_report_serializes_elapsed_as_millis() {
        let json = serde_json::to_value(report(Some(StopReason::Exhausted), 3, 3)).unwrap();
        assert_eq!(json["elapsed"], 1500);
        assert_eq!(json["stop_reason"], "exhausted");
        assert_eq!(json["mode"], "line");
    }
}
