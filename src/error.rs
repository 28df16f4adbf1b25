//! Error types for the transfer choreography.
//!
//! Steady-state timeouts are not errors. They are reported as
//! outcome variants ([`crate::endpoint::SendOutcome::TimedOut`],
//! [`crate::endpoint::RecvOutcome::TimedOut`]).

use std::path::PathBuf;

use thiserror::Error;

use crate::endpoint::Role;

/// Errors raised while setting up or driving a transfer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{} is not a file", .0.display())]
    NotAFile(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not resolve relay address {0}")]
    Resolve(String),

    #[error("{0} never connected")]
    ConnectFailed(Role),

    #[error("{0} is not connected")]
    NotConnected(Role),

    #[error("{0} connection closed by peer")]
    PeerClosed(Role),

    #[error("transfer task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, Error>;
