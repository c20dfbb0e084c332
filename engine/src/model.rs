//! Core data model for offload runs.
//!
//! This module defines the values that flow in and out of a `TransferMachine`:
//! - TransferRequest: what to copy, where, and how to check it
//! - Phase: the lifecycle position of a run
//! - TransferState: the live, observable progress of a run
//! - TransferReport: the terminal outcome of a run

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::manifest::ManifestOutcome;
use crate::progress::ProgressEvent;
use crate::supervisor::ProcessExit;
use crate::verify::{DestinationReport, VerificationOptions};

pub const DEFAULT_PARALLELISM: usize = 4;
pub const DEFAULT_BUFFER_SIZE: u64 = 16 * 1024 * 1024;

/// Position of a run in its lifecycle.
///
/// Runs move forward through
/// `Idle → Validating → Transferring → Verifying → ManifestChecking → Completed`,
/// and may leave any non-terminal phase for `Failed` or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Validating,
    Transferring,
    Verifying,
    ManifestChecking,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "Idle",
            Phase::Validating => "Validating",
            Phase::Transferring => "Transferring",
            Phase::Verifying => "Verifying",
            Phase::ManifestChecking => "ManifestChecking",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
            Phase::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// One offload: a source tree copied to one or more destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Root of the tree to copy
    pub source: PathBuf,
    /// Target roots; the source tree lands directly inside each
    pub destinations: Vec<PathBuf>,
    /// Copy tool buffer size per transfer, in bytes
    pub buffer_size: u64,
    /// Concurrent file transfers inside the copy tool
    pub parallelism: usize,
    pub verification: VerificationOptions,
    /// Create and verify an ASC MHL manifest at every destination
    pub generate_manifest: bool,
}

impl TransferRequest {
    pub fn new(source: impl Into<PathBuf>, destinations: Vec<PathBuf>) -> Self {
        TransferRequest {
            source: source.into(),
            destinations,
            buffer_size: DEFAULT_BUFFER_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            verification: VerificationOptions::default(),
            generate_manifest: false,
        }
    }

    pub fn with_buffer_size(mut self, bytes: u64) -> Self {
        self.buffer_size = bytes;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_verification(mut self, verification: VerificationOptions) -> Self {
        self.verification = verification;
        self
    }

    pub fn with_manifest(mut self, enabled: bool) -> Self {
        self.generate_manifest = enabled;
        self
    }
}

/// Live progress of a run, updated from copy-tool events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferState {
    pub phase: Phase,
    /// Index into `TransferRequest::destinations` currently being worked on
    pub destination_index: Option<usize>,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub percent: Option<u8>,
    pub bytes_per_second: Option<u64>,
    pub eta: Option<Duration>,
    pub current_file: Option<String>,
    pub files_done: u64,
    pub files_total: u64,
    /// Error lines seen so far, across all destinations
    pub error_lines: usize,
    pub last_error: Option<String>,
    pub cancel_requested: bool,
}

impl Default for TransferState {
    fn default() -> Self {
        TransferState {
            phase: Phase::Idle,
            destination_index: None,
            bytes_transferred: 0,
            bytes_total: 0,
            percent: None,
            bytes_per_second: None,
            eta: None,
            current_file: None,
            files_done: 0,
            files_total: 0,
            error_lines: 0,
            last_error: None,
            cancel_requested: false,
        }
    }
}

impl TransferState {
    /// Fold one copy-tool event into the state.
    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::BytesTransferred { transferred, total } => {
                self.bytes_transferred = *transferred;
                self.bytes_total = *total;
            }
            ProgressEvent::FilesTransferred { done, total } => {
                self.files_done = *done;
                self.files_total = *total;
            }
            ProgressEvent::FileStarted { name } => self.current_file = Some(name.clone()),
            ProgressEvent::FileCompleted { name } => {
                if self.current_file.as_deref() == Some(name.as_str()) {
                    self.current_file = None;
                }
            }
            ProgressEvent::PercentComplete(percent) => self.percent = Some(*percent),
            ProgressEvent::Speed { bytes_per_second } => self.bytes_per_second = Some(*bytes_per_second),
            ProgressEvent::Eta(eta) => self.eta = *eta,
            ProgressEvent::ErrorLine(line) => {
                self.error_lines += 1;
                self.last_error = Some(line.clone());
            }
            ProgressEvent::RawLogLine(_) => {}
        }
    }

    /// Clear per-destination counters before the next copy-tool run.
    pub(crate) fn start_destination(&mut self, index: usize) {
        self.destination_index = Some(index);
        self.bytes_transferred = 0;
        self.bytes_total = 0;
        self.percent = None;
        self.bytes_per_second = None;
        self.eta = None;
        self.current_file = None;
        self.files_done = 0;
        self.files_total = 0;
    }
}

/// How one copy-tool run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationCopy {
    pub destination: PathBuf,
    pub exit: ProcessExit,
}

#[derive(Debug)]
pub enum RunStatus {
    Completed,
    Failed(EngineError),
    Cancelled,
}

/// Everything known about a finished run.
#[derive(Debug)]
pub struct TransferReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// The last non-terminal phase the run was in
    pub stopped_in: Phase,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub copies: Vec<DestinationCopy>,
    pub verification: Vec<DestinationReport>,
    pub manifests: Vec<ManifestOutcome>,
}

impl TransferReport {
    /// `Completed`, `Failed` or `Cancelled`.
    pub fn final_phase(&self) -> Phase {
        match self.status {
            RunStatus::Completed => Phase::Completed,
            RunStatus::Failed(_) => Phase::Failed,
            RunStatus::Cancelled => Phase::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Completed)
    }

    pub fn error(&self) -> Option<&EngineError> {
        match &self.status {
            RunStatus::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
