//! # Offload Engine - Media Offload Orchestration Library
//!
//! A headless engine that copies camera media to one or more destinations
//! with an external copy tool, proves the copies match, and optionally seals
//! each destination with an ASC MHL manifest.
//! Designed as the foundation for multiple front ends (CLI, GUI, automation).
//!
//! ## Overview
//!
//! The engine does not move bytes itself. It:
//! - Validates a request before anything is spawned
//! - Supervises the copy tool and parses its progress output
//! - Verifies every destination against the source on a worker pool
//! - Drives the manifest tool over every destination
//! - Reports phases, progress and per-file results to an observer
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::path::PathBuf;
//! use engine::{EngineConfig, RunStatus, TransferMachine, TransferRequest};
//!
//! let config = EngineConfig::default();
//! let request = TransferRequest::new(
//!     "/Volumes/A001",
//!     vec![PathBuf::from("/Volumes/RAID/A001"), PathBuf::from("/Volumes/SHUTTLE/A001")],
//! )
//! .with_parallelism(4)
//! .with_manifest(true);
//!
//! let machine = TransferMachine::new(&config, request);
//! let cancel = machine.cancel_handle(); // hand to a Ctrl-C handler or a button
//! let report = machine.run();
//!
//! match &report.status {
//!     RunStatus::Completed => println!("verified in {}s", report.duration().num_seconds()),
//!     RunStatus::Failed(err) => eprintln!("failed: {err}"),
//!     RunStatus::Cancelled => eprintln!("cancelled"),
//! }
//! # drop(cancel);
//! ```
//!
//! ## Modules
//!
//! - **machine**: The transfer state machine and its handles
//! - **model**: Requests, phases, live state and reports
//! - **supervisor**: Child process launch, output streaming, cancellation
//! - **progress**: Copy-tool output parsing
//! - **verify**: Post-transfer verification worker pool
//! - **manifest**: ASC MHL create/verify coordination
//! - **observer**: Observer trait and a channel-backed implementation
//! - **checksums**: Digest algorithms and bounded file hashing
//! - **fs_ops**: Enumeration and pre-flight filesystem probes
//! - **tools**: External tool command lines
//! - **config**: Engine-wide settings
//! - **error**: Error types and handling

pub mod cancel;
pub mod checksums;
pub mod config;
pub mod error;
pub mod fs_ops;
pub mod machine;
pub mod manifest;
pub mod model;
pub mod observer;
pub mod progress;
pub mod supervisor;
pub mod tools;
pub mod verify;

pub use cancel::CancelToken;
pub use checksums::{ChecksumAlgorithm, ChecksumValue};
pub use config::EngineConfig;
pub use error::{EngineError, ErrorKind};
pub use machine::{CancelHandle, StateView, TransferMachine};
pub use manifest::{ManifestCoordinator, ManifestOutcome, ManifestStatus};
pub use model::{Phase, RunStatus, TransferReport, TransferRequest, TransferState};
pub use observer::{ChannelObserver, TransferEvent, TransferObserver};
pub use progress::ProgressEvent;
pub use supervisor::{ProcessHandle, Supervisor};
pub use verify::{
    DestinationReport, TimeoutPolicy, VerificationOptions, VerificationOutcome,
    VerificationReport, VerificationResult, Verifier,
};
