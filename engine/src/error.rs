//! Error types for the offload engine.
//!
//! `EngineError` represents everything that stops a run short of `Completed`.
//! Problems with individual files found during verification are recorded as
//! `VerificationResult`s, not as errors; only the aggregate verdict surfaces
//! here as `VerificationFailed`, with the full per-file reports attached.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::Phase;
use crate::manifest::ManifestOutcome;
use crate::verify::DestinationReport;

/// Coarse classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// External binary missing or not executable (pre-flight).
    Launch,
    /// Bad paths, empty source, insufficient space (pre-flight).
    Validation,
    /// The copy tool exited non-zero.
    Transfer,
    /// The run completed but the data is provably inconsistent.
    Verification,
    /// The manifest tool exited non-zero.
    Manifest,
    /// User-initiated stop. Not a failure.
    Cancelled,
    /// Filesystem or process plumbing failed underneath the engine.
    Io,
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The executable could not be resolved or spawned
    #[error("cannot launch '{}': {reason}", .program.display())]
    Launch { program: PathBuf, reason: String },

    /// The request itself is malformed (no destinations, zero parallelism, ...)
    #[error("invalid transfer request: {reason}")]
    InvalidRequest { reason: String },

    /// Source directory does not exist
    #[error("Source directory not found: {}", .path.display())]
    SourceNotFound { path: PathBuf },

    /// Source exists but is not a directory
    #[error("Source is not a directory: {}", .path.display())]
    SourceNotDirectory { path: PathBuf },

    /// Source contains no regular files
    #[error("Source directory contains no files: {}", .path.display())]
    EmptySource { path: PathBuf },

    /// Destination exists but is not a directory
    #[error("Destination is not a directory: {}", .path.display())]
    DestinationNotDirectory { path: PathBuf },

    /// Neither the destination nor its parent exists
    #[error("Parent of destination does not exist: {}", .path.display())]
    DestinationParentMissing { path: PathBuf },

    /// A probe file could not be created in the destination
    #[error("Destination is not writable: {}", .path.display())]
    DestinationNotWritable { path: PathBuf, source: io::Error },

    /// Free space at the destination is below the source total
    #[error(
        "Insufficient space at {}: required {required} bytes, available {available} bytes",
        .path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// Failed to enumerate a directory
    #[error("Failed to enumerate directory: {}", .path.display())]
    EnumerationFailed { path: PathBuf, source: io::Error },

    /// Failed to read a file
    #[error("Failed to read file: {}", .path.display())]
    ReadError { path: PathBuf, source: io::Error },

    /// The copy tool exited non-zero; the last captured lines are attached
    #[error(
        "copy tool exited with code {exit_code} while transferring to {}",
        .destination.display()
    )]
    Transfer {
        destination: PathBuf,
        exit_code: i32,
        diagnostics: Vec<String>,
    },

    /// At least one file failed verification at one or more destinations
    #[error(
        "verification failed: {} file(s) did not verify across {} destination(s)",
        failed_file_count(.reports),
        .reports.len()
    )]
    VerificationFailed { reports: Vec<DestinationReport> },

    /// The manifest tool failed for at least one destination
    #[error("manifest check failed for {} destination(s)", .failures.len())]
    Manifest { failures: Vec<ManifestOutcome> },

    /// The user cancelled the run
    #[error("cancelled by user during {phase}")]
    Cancelled { phase: Phase },

    /// Waiting on or talking to a child process failed
    #[error("process error for '{}': {source}", .program.display())]
    Process { program: PathBuf, source: io::Error },
}

fn failed_file_count(reports: &[DestinationReport]) -> usize {
    reports.iter().map(|r| r.report.failures().count()).sum()
}

impl EngineError {
    /// Map this error onto the engine's error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Launch { .. } => ErrorKind::Launch,
            Self::InvalidRequest { .. }
            | Self::SourceNotFound { .. }
            | Self::SourceNotDirectory { .. }
            | Self::EmptySource { .. }
            | Self::DestinationNotDirectory { .. }
            | Self::DestinationParentMissing { .. }
            | Self::DestinationNotWritable { .. }
            | Self::InsufficientSpace { .. } => ErrorKind::Validation,
            Self::Transfer { .. } => ErrorKind::Transfer,
            Self::VerificationFailed { .. } => ErrorKind::Verification,
            Self::Manifest { .. } => ErrorKind::Manifest,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::EnumerationFailed { .. } | Self::ReadError { .. } | Self::Process { .. } => {
                ErrorKind::Io
            }
        }
    }

    /// True for failures detected before any subprocess was started.
    pub fn is_preflight(&self) -> bool {
        matches!(self.kind(), ErrorKind::Launch | ErrorKind::Validation)
    }

    /// Captured tool output attached to this error, if any.
    pub fn diagnostics(&self) -> Vec<String> {
        match self {
            Self::Transfer { diagnostics, .. } => diagnostics.clone(),
            Self::Manifest { failures } => failures
                .iter()
                .flat_map(|f| f.diagnostics().iter().cloned())
                .collect(),
            _ => Vec::new(),
        }
    }
}
