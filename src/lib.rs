#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

//! qrelay: moves a file from a reader to a writer through a single-pair TCP
//! queue point, then checks the copy with SHA-256.
//!
//! ```text
//!  ┌────────────┐  units   ┌────────────┐  bytes   ┌────────────┐
//!  │ FileReader │─────────▶│ QueuePoint │─────────▶│ FileWriter │
//!  └─────┬──────┘          └─────┬──────┘          └─────┬──────┘
//!        │ send_next             │ ceiling / failure     │ receive_line
//!        └──────────── driver ◀──┴── StopSignal ────────▶┘
//! ```
//!
//! Modules:
//! - `stop`: shared set-once stop signal with a recorded reason
//! - `endpoint`: the `Endpoint` trait and the reader, writer and relay
//! - `driver`: the send/receive loop and the full run choreography
//! - `integrity`: streamed SHA-256 comparison and throughput
//! - `config`: configuration loading
//! - `error`: error types

pub mod config;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod integrity;
pub mod stop;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use driver::{run_transfer, TransferReport};
pub use endpoint::{Endpoint, FileReader, FileWriter, QueuePoint, SendMode};
pub use error::{Error, Result};
pub use integrity::{verify, IntegrityError, Throughput, Verdict};
pub use stop::{StopReason, StopSignal};
