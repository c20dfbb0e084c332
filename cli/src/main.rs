//! offload - Command-line front end for the media offload engine.
//!
//! Copies a camera card to one or more destinations with rclone, verifies
//! every copy against the card, and optionally seals each destination with
//! an ASC MHL manifest. Settings persist in a JSON file between runs.

mod config;
mod logging;
mod progress;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use engine::{
    ChecksumAlgorithm, EngineConfig, Phase, TransferMachine, TransferReport, TransferRequest,
    VerificationOptions,
};

use crate::config::{OffloadConfig, DEFAULT_CONFIG_FILE};
use crate::progress::CliProgress;

const EXIT_COMPLETED: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_CANCELLED: i32 = 130;

/// offload - Copy camera media to several destinations and prove every copy
#[derive(Parser, Debug)]
#[command(name = "offload")]
#[command(version)]
#[command(about = "Copy a card to one or more destinations, then verify every copy")]
struct Args {
    /// Source directory (the card)
    #[arg(long, value_name = "PATH")]
    src: Option<PathBuf>,

    /// Destination directory; repeat for several destinations
    #[arg(long = "dst", value_name = "PATH")]
    dst: Vec<PathBuf>,

    /// Parallel file transfers inside the copy tool
    #[arg(long, value_name = "N")]
    transfers: Option<usize>,

    /// Copy tool buffer size per transfer, e.g. 16M or 512K
    #[arg(long, value_name = "SIZE", value_parser = parse_buffer_size)]
    buffer_size: Option<u64>,

    /// Compare checksums of source and copies after the transfer
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    checksum: Option<bool>,

    /// Checksum algorithm: md5, sha1, sha256, sha512
    #[arg(long, value_name = "ALGORITHM")]
    hash: Option<ChecksumAlgorithm>,

    /// Compare file sizes of source and copies after the transfer
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    size_check: Option<bool>,

    /// Create and verify an ASC MHL manifest at every destination
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    mhl: Option<bool>,

    /// Copy tool executable
    #[arg(long, value_name = "PATH")]
    copy_tool: Option<PathBuf>,

    /// Manifest tool executable
    #[arg(long, value_name = "PATH")]
    manifest_tool: Option<PathBuf>,

    /// Verification worker threads (default: --transfers)
    #[arg(long, value_name = "N")]
    verify_workers: Option<usize>,

    /// Settings file
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save_config: bool,

    /// Directory for per-run log files
    #[arg(long, value_name = "PATH", default_value = logging::DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,
}

fn parse_buffer_size(text: &str) -> Result<u64, String> {
    match engine::progress::parse_size(text) {
        Some(0) | None => Err(format!("invalid buffer size '{}'", text)),
        Some(bytes) => Ok(bytes),
    }
}

/// Settings after merging the file with the command line.
struct Settings {
    config: OffloadConfig,
    engine: EngineConfig,
    request: TransferRequest,
}

impl Settings {
    fn resolve(args: &Args, mut config: OffloadConfig) -> Result<Self, String> {
        if let Some(src) = &args.src {
            config.src = Some(src.clone());
        }
        if !args.dst.is_empty() {
            config.destinations = args.dst.clone();
        }
        if let Some(transfers) = args.transfers {
            config.transfers = transfers;
        }
        if let Some(buffer_size) = args.buffer_size {
            config.buffer_size = buffer_size;
        }
        if let Some(checksum) = args.checksum {
            config.verify_checksum = checksum;
        }
        if let Some(hash) = args.hash {
            config.hash = hash;
        }
        if let Some(size_check) = args.size_check {
            config.verify_size = size_check;
        }
        if let Some(mhl) = args.mhl {
            config.generate_mhl = mhl;
        }
        if let Some(tool) = &args.copy_tool {
            config.copy_tool = tool.clone();
        }
        if let Some(tool) = &args.manifest_tool {
            config.manifest_tool = tool.clone();
        }
        if let Some(workers) = args.verify_workers {
            config.verify_workers = Some(workers);
        }

        let src = config
            .src
            .clone()
            .ok_or("no source given; use --src or set \"src\" in the settings file")?;
        if config.destinations.is_empty() {
            return Err("no destination given; use --dst at least once".to_string());
        }
        if config.transfers == 0 {
            return Err("--transfers must be at least 1".to_string());
        }

        let request = TransferRequest::new(src, config.destinations.clone())
            .with_parallelism(config.transfers)
            .with_buffer_size(config.buffer_size)
            .with_verification(VerificationOptions {
                verify_checksum: config.verify_checksum,
                algorithm: config.hash,
                verify_size: config.verify_size,
            })
            .with_manifest(config.generate_mhl);

        let mut engine = EngineConfig::default()
            .with_copy_tool(config.copy_tool.clone())
            .with_manifest_tool(config.manifest_tool.clone());
        if let Some(workers) = config.verify_workers {
            engine = engine.with_verification_workers(workers);
        }

        Ok(Settings {
            config,
            engine,
            request,
        })
    }
}

fn exit_code_for(report: &TransferReport) -> i32 {
    match report.final_phase() {
        Phase::Completed => EXIT_COMPLETED,
        Phase::Cancelled => EXIT_CANCELLED,
        _ => EXIT_FAILED,
    }
}

/// Set `flag` on Ctrl-C (and SIGTERM where it exists).
fn install_interrupt_flag(flag: &Arc<AtomicBool>) {
    let mut signals = vec![signal_hook::consts::SIGINT];
    #[cfg(unix)]
    signals.push(signal_hook::consts::SIGTERM);
    for signal in signals {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(flag)) {
            log::warn!("Cannot install handler for signal {}: {}", signal, e);
        }
    }
}

/// Parse and validate command-line arguments, then run the offload
fn main() {
    let args = Args::parse();

    match logging::init(&args.log_dir, args.verbose) {
        Ok(path) => log::info!("Logging to {}", path.display()),
        Err(msg) => eprintln!("Warning: {}", msg),
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    install_interrupt_flag(&interrupted);

    let exit_code = match run_cli(&args, interrupted) {
        Ok(report) => exit_code_for(&report),
        Err(msg) => {
            eprintln!("Error: {}", msg);
            EXIT_USAGE
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args, interrupted: Arc<AtomicBool>) -> Result<TransferReport, String> {
    let settings = Settings::resolve(args, OffloadConfig::load(&args.config))?;
    if args.save_config {
        settings
            .config
            .save(&args.config)
            .map_err(|e| format!("cannot save settings to {}: {}", args.config.display(), e))?;
    }

    let machine = TransferMachine::new(&settings.engine, settings.request)
        .with_observer(Arc::new(CliProgress::new(args.verbose)));
    let cancel = machine.cancel_handle();
    let finished = Arc::new(AtomicBool::new(false));

    let watcher = {
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            while !finished.load(Ordering::SeqCst) {
                if interrupted.load(Ordering::SeqCst) {
                    eprintln!();
                    log::warn!("Interrupted; stopping the offload");
                    cancel.cancel();
                    break;
                }
                thread::sleep(Duration::from_millis(100));
            }
        })
    };

    let report = machine.run();
    finished.store(true, Ordering::SeqCst);
    if watcher.join().is_err() {
        log::error!("Interrupt watcher panicked");
    }
    Ok(report)
}
