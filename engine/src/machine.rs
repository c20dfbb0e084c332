//! Transfer orchestration.
//!
//! A `TransferMachine` drives one `TransferRequest` through
//! `Validating → Transferring → Verifying → ManifestChecking` and ends in
//! `Completed`, `Failed` or `Cancelled`:
//!
//! - Validating: request sanity, source and destination checks, free space,
//!   and tool resolution. Nothing is spawned if any of it fails.
//! - Transferring: one copy-tool run per destination, in order. Output lines
//!   are parsed into progress events and folded into the shared state.
//! - Verifying: every destination is compared against the source. Skipped
//!   when neither size nor checksum checks are requested.
//! - ManifestChecking: only when the request asks for manifests.
//!
//! Cancellation may arrive from any thread through a `CancelHandle`. The
//! running child is killed, the machine waits for it to exit and the run ends
//! in `Cancelled`. Partially written destination files are left in place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Local;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fs_ops;
use crate::manifest::ManifestCoordinator;
use crate::model::{
    DestinationCopy, Phase, RunStatus, TransferReport, TransferRequest, TransferState,
};
use crate::observer::TransferObserver;
use crate::progress::{self, ProgressEvent};
use crate::supervisor::{resolve_executable, ProcessExit, Supervisor};
use crate::tools;
use crate::verify::{DestinationReport, Verifier};

/// Read-only access to a machine's live state, from any thread.
#[derive(Debug, Clone)]
pub struct StateView {
    state: Arc<Mutex<TransferState>>,
}

impl StateView {
    pub fn snapshot(&self) -> TransferState {
        lock(&self.state).clone()
    }

    pub fn phase(&self) -> Phase {
        lock(&self.state).phase
    }
}

/// Requests cancellation of a machine's run, from any thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancelToken,
    state: Arc<Mutex<TransferState>>,
}

impl CancelHandle {
    /// Idempotent. Has no effect once the run reached a terminal phase.
    pub fn cancel(&self) {
        {
            let mut state = lock(&self.state);
            if state.phase.is_terminal() {
                return;
            }
            if !state.cancel_requested {
                log::info!("Cancellation requested during {}", state.phase);
            }
            state.cancel_requested = true;
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

fn lock(state: &Mutex<TransferState>) -> MutexGuard<'_, TransferState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What validation established about the run.
struct Plan {
    copy_tool: PathBuf,
    manifest_tool: Option<PathBuf>,
    files: usize,
    total_bytes: u64,
}

/// Artefacts collected while the run progresses.
#[derive(Default)]
struct Record {
    copies: Vec<DestinationCopy>,
    verification: Vec<DestinationReport>,
    manifests: Vec<crate::manifest::ManifestOutcome>,
}

/// Drives one request to a terminal phase.
pub struct TransferMachine {
    config: EngineConfig,
    request: TransferRequest,
    observer: Option<Arc<dyn TransferObserver>>,
    cancel: CancelToken,
    state: Arc<Mutex<TransferState>>,
    supervisor: Supervisor,
}

impl TransferMachine {
    pub fn new(config: &EngineConfig, request: TransferRequest) -> Self {
        TransferMachine {
            supervisor: Supervisor::new(config.diagnostic_lines),
            config: config.clone(),
            request,
            observer: None,
            cancel: CancelToken::new(),
            state: Arc::new(Mutex::new(TransferState::default())),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel.clone(),
            state: Arc::clone(&self.state),
        }
    }

    pub fn state_view(&self) -> StateView {
        StateView {
            state: Arc::clone(&self.state),
        }
    }

    /// Run the request to completion. Always returns a report; failures are
    /// carried in `TransferReport::status`.
    pub fn run(self) -> TransferReport {
        let run_id = Uuid::new_v4();
        let started_at = Local::now();
        log::info!(
            "Run {} started: {} -> {}",
            run_id,
            self.request.source.display(),
            self.request
                .destinations
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut record = Record::default();
        let result = self.drive(&mut record);
        let stopped_in = lock(&self.state).phase;

        let status = match result {
            Ok(()) => RunStatus::Completed,
            Err(EngineError::Cancelled { .. }) => RunStatus::Cancelled,
            Err(err) => RunStatus::Failed(err),
        };
        let terminal = match &status {
            RunStatus::Completed => Phase::Completed,
            RunStatus::Failed(_) => Phase::Failed,
            RunStatus::Cancelled => Phase::Cancelled,
        };
        self.transition(terminal);

        let report = TransferReport {
            run_id,
            status,
            stopped_in,
            started_at,
            finished_at: Local::now(),
            copies: record.copies,
            verification: record.verification,
            manifests: record.manifests,
        };
        match &report.status {
            RunStatus::Completed => log::info!(
                "Run {} completed in {}s",
                run_id,
                report.duration().num_seconds()
            ),
            RunStatus::Cancelled => log::warn!("Run {} cancelled during {}", run_id, stopped_in),
            RunStatus::Failed(err) => {
                log::error!("Run {} failed during {}: {}", run_id, stopped_in, err);
                for line in err.diagnostics() {
                    log::error!("  {}", line);
                }
            }
        }
        if let Some(observer) = &self.observer {
            observer.on_finished(&report);
        }
        report
    }

    fn drive(&self, record: &mut Record) -> Result<(), EngineError> {
        self.transition(Phase::Validating);
        let plan = self.validate()?;
        log::info!(
            "Validated {} file(s), {} byte(s) for {} destination(s)",
            plan.files,
            plan.total_bytes,
            self.request.destinations.len()
        );
        self.check_cancel()?;

        self.transition(Phase::Transferring);
        for (index, destination) in self.request.destinations.iter().enumerate() {
            self.check_cancel()?;
            let exit = self.copy_to(index, destination, &plan.copy_tool)?;
            record.copies.push(DestinationCopy {
                destination: destination.clone(),
                exit: exit.clone(),
            });
            if exit.cancelled {
                return Err(self.cancelled());
            }
            if exit.code != 0 {
                return Err(EngineError::Transfer {
                    destination: destination.clone(),
                    exit_code: exit.code,
                    diagnostics: exit.tail,
                });
            }
        }
        self.check_cancel()?;

        if self.request.verification.is_enabled() {
            self.transition(Phase::Verifying);
            self.verify_all(record)?;
        } else {
            log::warn!("Size and checksum verification are both disabled; skipping verification");
        }
        self.check_cancel()?;

        if let Some(manifest_tool) = &plan.manifest_tool {
            self.transition(Phase::ManifestChecking);
            let coordinator = ManifestCoordinator::new(manifest_tool, self.config.diagnostic_lines);
            record.manifests = coordinator.process(&self.request.destinations, &self.cancel);
            self.check_cancel()?;
            let failures: Vec<_> = record
                .manifests
                .iter()
                .filter(|o| !o.is_success())
                .cloned()
                .collect();
            if !failures.is_empty() {
                return Err(EngineError::Manifest { failures });
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<Plan, EngineError> {
        let request = &self.request;
        if request.destinations.is_empty() {
            return Err(invalid("at least one destination is required"));
        }
        if request.parallelism == 0 {
            return Err(invalid("parallelism must be at least 1"));
        }
        if request.buffer_size == 0 {
            return Err(invalid("buffer size must be greater than zero"));
        }

        let source = &request.source;
        match fs::metadata(source) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => return Err(EngineError::SourceNotDirectory { path: source.clone() }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(EngineError::SourceNotFound { path: source.clone() })
            }
            Err(e) => {
                return Err(EngineError::EnumerationFailed {
                    path: source.clone(),
                    source: e,
                })
            }
        }
        let source_canonical = fs::canonicalize(source).map_err(|e| EngineError::EnumerationFailed {
            path: source.clone(),
            source: e,
        })?;

        let files = fs_ops::enumerate_files(source)?;
        if files.is_empty() {
            return Err(EngineError::EmptySource { path: source.clone() });
        }
        let total_bytes = fs_ops::total_size(&files);

        let mut seen: Vec<PathBuf> = Vec::with_capacity(request.destinations.len());
        for destination in &request.destinations {
            let target = writable_target(destination)?;
            let resolved = resolved_destination(destination, &target);
            if resolved.starts_with(&source_canonical) {
                return Err(invalid(format!(
                    "destination {} is the source or lies inside it",
                    destination.display()
                )));
            }
            if seen.contains(&resolved) {
                return Err(invalid(format!(
                    "destination {} is listed more than once",
                    destination.display()
                )));
            }
            seen.push(resolved);

            fs_ops::probe_writable(&target)?;
            if let Some(available) = fs_ops::available_space(&target) {
                if !fs_ops::fits_in(total_bytes, available, self.config.usable_space_fraction) {
                    return Err(EngineError::InsufficientSpace {
                        path: destination.clone(),
                        required: total_bytes,
                        available,
                    });
                }
            }
        }

        let copy_tool = resolve_executable(&self.config.copy_tool)?;
        let manifest_tool = if request.generate_manifest {
            Some(resolve_executable(&self.config.manifest_tool)?)
        } else {
            None
        };

        Ok(Plan {
            copy_tool,
            manifest_tool,
            files: files.len(),
            total_bytes,
        })
    }

    fn copy_to(
        &self,
        index: usize,
        destination: &Path,
        copy_tool: &Path,
    ) -> Result<ProcessExit, EngineError> {
        lock(&self.state).start_destination(index);
        let args = tools::copy_args(&self.request, destination);
        log::info!(
            "Copying to destination {}/{}: {}",
            index + 1,
            self.request.destinations.len(),
            tools::display_command(copy_tool, &args)
        );

        let mut handle = self.supervisor.start(copy_tool, &args, None)?;
        self.cancel.attach(handle.control());
        for line in handle.output() {
            for event in progress::parse_all(&line.text) {
                match &event {
                    ProgressEvent::ErrorLine(text) => log::error!("{}", text),
                    ProgressEvent::RawLogLine(text) => log::debug!("{}", text),
                    _ => {}
                }
                let snapshot = {
                    let mut state = lock(&self.state);
                    state.apply(&event);
                    state.clone()
                };
                if let Some(observer) = &self.observer {
                    observer.on_progress(&snapshot, &event);
                }
            }
        }
        let exit = handle.wait();
        self.cancel.detach();
        let exit = exit?;
        log::info!(
            "Copy tool finished for {} with exit code {}",
            destination.display(),
            exit.code
        );
        Ok(exit)
    }

    fn verify_all(&self, record: &mut Record) -> Result<(), EngineError> {
        let workers = self
            .config
            .verification_workers
            .unwrap_or(self.request.parallelism);
        let verifier = Verifier::new(self.request.verification)
            .with_workers(workers)
            .with_timeout_policy(self.config.timeout_policy.clone())
            .with_cancel(self.cancel.clone());

        for destination in &self.request.destinations {
            let report = verifier.verify_with(&self.request.source, destination, |result| {
                if let Some(observer) = &self.observer {
                    observer.on_verification_result(destination, result);
                }
            })?;
            record.verification.push(DestinationReport {
                destination: destination.clone(),
                report,
            });
        }

        if record.verification.iter().all(|d| d.report.is_success()) {
            Ok(())
        } else {
            Err(EngineError::VerificationFailed {
                reports: record.verification.clone(),
            })
        }
    }

    fn transition(&self, to: Phase) {
        let from = {
            let mut state = lock(&self.state);
            let from = state.phase;
            if from.is_terminal() || from == to {
                return;
            }
            state.phase = to;
            from
        };
        log::info!("Phase: {} -> {}", from, to);
        if let Some(observer) = &self.observer {
            observer.on_phase_changed(from, to);
        }
    }

    fn check_cancel(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(self.cancelled())
        } else {
            Ok(())
        }
    }

    fn cancelled(&self) -> EngineError {
        EngineError::Cancelled {
            phase: lock(&self.state).phase,
        }
    }
}

fn invalid(reason: impl Into<String>) -> EngineError {
    EngineError::InvalidRequest {
        reason: reason.into(),
    }
}

/// The directory that must be writable for `destination`: itself if it
/// exists, else its parent (the copy tool creates the last component).
fn writable_target(destination: &Path) -> Result<PathBuf, EngineError> {
    match fs::metadata(destination) {
        Ok(metadata) if metadata.is_dir() => Ok(destination.to_path_buf()),
        Ok(_) => Err(EngineError::DestinationNotDirectory {
            path: destination.to_path_buf(),
        }),
        Err(_) => {
            let parent = destination
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            if parent.is_dir() {
                Ok(parent.to_path_buf())
            } else {
                Err(EngineError::DestinationParentMissing {
                    path: destination.to_path_buf(),
                })
            }
        }
    }
}

/// Canonical form of `destination`, which may not exist yet.
fn resolved_destination(destination: &Path, target: &Path) -> PathBuf {
    let target = fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
    if target.as_os_str().is_empty() || destination.is_dir() {
        return target;
    }
    match destination.file_name() {
        Some(name) => target.join(name),
        None => target,
    }
}
