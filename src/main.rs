#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # qrelay
//!
//! Sends a file from a reader to a writer through a local queue point and
//! checks that both files hash the same.
//!
//! ## Subcommands
//!
//! - `qrelay run` (default): start relay, reader and writer; transfer; verify
//! - `qrelay verify SOURCE RECEIVED`: only compare two files
//!
//! Exit code is 0 when the received file matches the source, 1 otherwise.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, warn};

use qrelay::{
    run_transfer, verify, Config, IntegrityError, SendMode, StopReason, StopSignal, Throughput,
    TransferReport, Verdict,
};

/// Loopback file transfer through a single-pair TCP queue point.
#[derive(Parser)]
#[command(name = "qrelay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer a file through the queue point (default when no subcommand given).
    Run(RunArgs),
    /// Compare two files by SHA-256.
    Verify {
        /// The original file.
        source: PathBuf,
        /// The copy to check.
        received: PathBuf,
        /// Print the verdict as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Default)]
struct RunArgs {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Relay host name or IP.
    #[arg(long)]
    host: Option<String>,
    /// Relay port (0 picks a free one).
    #[arg(long)]
    port: Option<u16>,
    /// File to send.
    #[arg(long)]
    source: Option<PathBuf>,
    /// File to write; replaced if it exists.
    #[arg(long)]
    dest: Option<PathBuf>,
    /// How the reader cuts the file into units.
    #[arg(long, value_enum)]
    mode: Option<SendMode>,
    /// Skip the digest comparison.
    #[arg(long)]
    no_verify: bool,
    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.relay.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.relay.port = port;
        }
        if let Some(source) = &self.source {
            config.transfer.source.clone_from(source);
        }
        if let Some(dest) = &self.dest {
            config.transfer.destination.clone_from(dest);
        }
        if let Some(mode) = self.mode {
            config.transfer.mode = mode;
        }
        if self.no_verify {
            config.transfer.verify = false;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run(args)) => run(&args).await,
        Some(Commands::Verify {
            source,
            received,
            json,
        }) => {
            init_tracing(&Config::default().logging.level);
            let verdict = verify(&source, &received).await;
            report_verdict(&verdict, json);
            exit_code(&verdict)
        }
        None => run(&RunArgs::default()).await,
    }
}

fn init_tracing(level: &str) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run(args: &RunArgs) -> ExitCode {
    let mut config = match Config::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("qrelay: configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    args.apply(&mut config);

    init_tracing(&config.logging.level);
    info!("qrelay v{} starting", env!("CARGO_PKG_VERSION"));

    let stop = StopSignal::new();
    let ctrl_c_task = {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT");
                stop.set(StopReason::Shutdown);
            }
        })
    };

    let result = run_transfer(&config, stop).await;
    ctrl_c_task.abort();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!("Transfer failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    if report.stop_reason != Some(StopReason::Exhausted) {
        warn!(
            "Transfer ended before the source was exhausted ({})",
            report.stop_reason.map_or("unknown", StopReason::as_str)
        );
    }
    let throughput = Throughput::new(report.bytes_received, report.elapsed);
    info!("Throughput: {throughput}");

    if !config.transfer.verify {
        print_report(&report, &throughput, None, args.json);
        return ExitCode::SUCCESS;
    }

    let verdict = verify(&config.transfer.source, &config.transfer.destination).await;
    print_report(&report, &throughput, Some(&verdict), args.json);
    if !args.json {
        report_verdict(&verdict, false);
    }
    exit_code(&verdict)
}

fn report_verdict(verdict: &Result<Verdict, IntegrityError>, as_json: bool) {
    if as_json {
        println!("{}", verdict_json(verdict));
        return;
    }
    match verdict {
        Ok(v) => info!("Messages are the same! ({} bytes, sha256 {})", v.size, v.digest),
        Err(e) => error!("Messages are not the same: {e}"),
    }
}

fn print_report(
    report: &TransferReport,
    throughput: &Throughput,
    verdict: Option<&Result<Verdict, IntegrityError>>,
    as_json: bool,
) {
    if !as_json {
        return;
    }
    let doc = json!({
        "report": report,
        "throughput": throughput,
        "verdict": verdict.map(verdict_json),
    });
    println!("{doc}");
}

fn verdict_json(verdict: &Result<Verdict, IntegrityError>) -> serde_json::Value {
    match verdict {
        Ok(v) => json!({ "same": true, "digest": v.digest, "size": v.size }),
        Err(e) => json!({ "same": false, "kind": mismatch_kind(e), "error": e.to_string() }),
    }
}

fn mismatch_kind(e: &IntegrityError) -> &'static str {
    match e {
        IntegrityError::MissingFile(_) => "missing_file",
        IntegrityError::SizeMismatch { .. } => "size_mismatch",
        IntegrityError::ContentMismatch { .. } => "content_mismatch",
        IntegrityError::Io(_) => "io",
    }
}

fn exit_code(verdict: &Result<Verdict, IntegrityError>) -> ExitCode {
    if verdict.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
