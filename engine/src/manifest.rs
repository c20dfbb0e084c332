//! Manifest Coordinator.
//!
//! After a verified transfer, an ASC MHL manifest is created at each
//! destination and then verified by the same tool. A destination whose
//! create step fails is not verified. One destination failing does not stop
//! the others from being processed.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::supervisor::{OutputLine, Supervisor};
use crate::tools::{display_command, manifest_args, ManifestMode};

/// Result of one manifest tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub cancelled: bool,
    /// Last lines of the tool's output
    pub lines: Vec<String>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestStatus {
    /// Created and verified
    Verified,
    /// The tool ran and exited non-zero
    Failed { mode: ManifestMode, exit_code: i32 },
    /// The tool could not be run at all
    Error { mode: ManifestMode, reason: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestOutcome {
    pub destination: PathBuf,
    pub status: ManifestStatus,
    pub create: Option<ToolOutput>,
    pub verify: Option<ToolOutput>,
}

impl ManifestOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ManifestStatus::Verified
    }

    /// Output tail of the last step that ran.
    pub fn diagnostics(&self) -> &[String] {
        self.verify
            .as_ref()
            .or(self.create.as_ref())
            .map(|output| output.lines.as_slice())
            .unwrap_or(&[])
    }
}

pub struct ManifestCoordinator {
    tool: PathBuf,
    supervisor: Supervisor,
}

impl ManifestCoordinator {
    pub fn new(tool: impl Into<PathBuf>, tail_lines: usize) -> Self {
        ManifestCoordinator {
            tool: tool.into(),
            supervisor: Supervisor::new(tail_lines),
        }
    }

    pub fn create_manifest(
        &self,
        root: &Path,
        cancel: Option<&CancelToken>,
    ) -> Result<ToolOutput, EngineError> {
        self.run(ManifestMode::Create, root, cancel)
    }

    pub fn verify_manifest(
        &self,
        root: &Path,
        cancel: Option<&CancelToken>,
    ) -> Result<ToolOutput, EngineError> {
        self.run(ManifestMode::Verify, root, cancel)
    }

    /// Create then verify a manifest at every destination, in order.
    ///
    /// Stops early, without an outcome for the remaining destinations, once
    /// `cancel` fires.
    pub fn process(&self, destinations: &[PathBuf], cancel: &CancelToken) -> Vec<ManifestOutcome> {
        let mut outcomes = Vec::with_capacity(destinations.len());
        for destination in destinations {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = self.process_one(destination, cancel);
            match &outcome.status {
                ManifestStatus::Verified => {
                    log::info!("Manifest created and verified at {}", destination.display())
                }
                ManifestStatus::Cancelled => {}
                status => log::error!("Manifest check failed at {}: {:?}", destination.display(), status),
            }
            let cancelled = outcome.status == ManifestStatus::Cancelled;
            outcomes.push(outcome);
            if cancelled {
                break;
            }
        }
        outcomes
    }

    fn process_one(&self, destination: &Path, cancel: &CancelToken) -> ManifestOutcome {
        let mut outcome = ManifestOutcome {
            destination: destination.to_path_buf(),
            status: ManifestStatus::Verified,
            create: None,
            verify: None,
        };

        for mode in [ManifestMode::Create, ManifestMode::Verify] {
            let output = match self.run(mode, destination, Some(cancel)) {
                Ok(output) => output,
                Err(e) => {
                    outcome.status = ManifestStatus::Error {
                        mode,
                        reason: e.to_string(),
                    };
                    return outcome;
                }
            };
            let status = if output.cancelled {
                Some(ManifestStatus::Cancelled)
            } else if output.exit_code != 0 {
                Some(ManifestStatus::Failed {
                    mode,
                    exit_code: output.exit_code,
                })
            } else {
                None
            };
            match mode {
                ManifestMode::Create => outcome.create = Some(output),
                ManifestMode::Verify => outcome.verify = Some(output),
            }
            if let Some(status) = status {
                outcome.status = status;
                return outcome;
            }
        }
        outcome
    }

    fn run(
        &self,
        mode: ManifestMode,
        root: &Path,
        cancel: Option<&CancelToken>,
    ) -> Result<ToolOutput, EngineError> {
        let args: Vec<OsString> = manifest_args(mode, root);
        log::info!("Running: {}", display_command(&self.tool, &args));
        let exit = self
            .supervisor
            .run_to_completion(&self.tool, &args, None, cancel, |line: &OutputLine| {
                log::debug!("[{}] {}", mode, line.text);
            })?;
        Ok(ToolOutput {
            exit_code: exit.code,
            cancelled: exit.cancelled,
            lines: exit.tail,
        })
    }
}
