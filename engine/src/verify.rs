//! Post-transfer verification.
//!
//! The verifier re-derives sizes and digests of every regular file under the
//! source root and compares them with the copies under a destination root:
//!
//! 1. `plan` enumerates the source and builds one `VerificationTask` per file.
//! 2. `run_tasks` feeds task indices through a channel to a fixed pool of
//!    scoped worker threads. Each worker writes its result into the slot
//!    reserved for that task index, so every task yields exactly one result
//!    and the report keeps enumeration order whatever the pool size.
//!
//! Size mismatches short-circuit: when both checks are enabled and sizes
//! differ, neither file is hashed. This is counted in
//! [`VerificationReport::hashes_skipped`].
//!
//! Verification only ever opens files for reading.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::checksums::{hash_file_bounded, BoundedHash, ChecksumAlgorithm, ChecksumValue};
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::Phase;

/// Worker count used when nothing else is configured.
pub const DEFAULT_WORKERS: usize = 4;

/// Which checks to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOptions {
    /// Compare digests of source and destination
    pub verify_checksum: bool,
    /// Digest used when `verify_checksum` is set
    pub algorithm: ChecksumAlgorithm,
    /// Compare file sizes
    pub verify_size: bool,
}

impl Default for VerificationOptions {
    fn default() -> Self {
        VerificationOptions {
            verify_checksum: true,
            algorithm: ChecksumAlgorithm::Sha256,
            verify_size: true,
        }
    }
}

impl VerificationOptions {
    /// False when neither size nor checksum is checked.
    pub fn is_enabled(&self) -> bool {
        self.verify_checksum || self.verify_size
    }
}

/// Computes the time allowed for one file and for a whole batch.
pub type BudgetFn = Arc<dyn Fn(u64) -> Duration + Send + Sync>;

/// Per-file and batch time budgets, as functions of byte counts.
///
/// The per-file budget receives the file's size; the batch budget receives
/// the total size of all files. Both are tunable; see `scaled`.
#[derive(Clone)]
pub struct TimeoutPolicy {
    per_file: BudgetFn,
    batch: BudgetFn,
}

impl TimeoutPolicy {
    pub const DEFAULT_FILE_FLOOR: Duration = Duration::from_secs(60);
    pub const DEFAULT_BATCH_FLOOR: Duration = Duration::from_secs(300);
    pub const DEFAULT_MIN_THROUGHPUT: u64 = 8 * 1024 * 1024;

    /// Budgets proportional to the bytes read (source and destination),
    /// at `min_bytes_per_second`, never below the given floors.
    pub fn scaled(file_floor: Duration, batch_floor: Duration, min_bytes_per_second: u64) -> Self {
        let rate = min_bytes_per_second.max(1) as f64;
        let scale = move |size: u64, floor: Duration| {
            let seconds = size.saturating_mul(2) as f64 / rate;
            floor.max(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX))
        };
        TimeoutPolicy {
            per_file: Arc::new(move |size| scale(size, file_floor)),
            batch: Arc::new(move |total| scale(total, batch_floor)),
        }
    }

    /// The same budget for every file and for the batch.
    pub fn fixed(budget: Duration) -> Self {
        TimeoutPolicy {
            per_file: Arc::new(move |_| budget),
            batch: Arc::new(move |_| budget),
        }
    }

    pub fn custom<F, B>(per_file: F, batch: B) -> Self
    where
        F: Fn(u64) -> Duration + Send + Sync + 'static,
        B: Fn(u64) -> Duration + Send + Sync + 'static,
    {
        TimeoutPolicy {
            per_file: Arc::new(per_file),
            batch: Arc::new(batch),
        }
    }

    pub fn file_budget(&self, size: u64) -> Duration {
        (self.per_file)(size)
    }

    pub fn batch_budget(&self, total_size: u64) -> Duration {
        (self.batch)(total_size)
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::scaled(
            Self::DEFAULT_FILE_FLOOR,
            Self::DEFAULT_BATCH_FLOOR,
            Self::DEFAULT_MIN_THROUGHPUT,
        )
    }
}

impl fmt::Debug for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutPolicy")
            .field("file_budget(0)", &self.file_budget(0))
            .field("batch_budget(0)", &self.batch_budget(0))
            .finish_non_exhaustive()
    }
}

/// One file to compare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationTask {
    pub relative_path: PathBuf,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub expected_size: u64,
    pub check_size: bool,
    /// `Some` when the digest must be compared
    pub algorithm: Option<ChecksumAlgorithm>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationOutcome {
    Match,
    SizeMismatch,
    ChecksumMismatch,
    MissingDestination,
    Timeout,
    IoError,
}

impl VerificationOutcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, VerificationOutcome::Match)
    }
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Match => "match",
            Self::SizeMismatch => "size mismatch",
            Self::ChecksumMismatch => "checksum mismatch",
            Self::MissingDestination => "missing at destination",
            Self::Timeout => "timed out",
            Self::IoError => "I/O error",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub relative_path: PathBuf,
    pub outcome: VerificationOutcome,
    pub elapsed: Duration,
    /// Human-readable explanation for anything but a match
    pub detail: Option<String>,
    pub source_checksum: Option<ChecksumValue>,
    pub destination_checksum: Option<ChecksumValue>,
    /// A digest was requested but skipped because sizes already differed
    pub hash_skipped: bool,
}

impl VerificationResult {
    fn new(task: &VerificationTask, outcome: VerificationOutcome, started: Instant) -> Self {
        VerificationResult {
            relative_path: task.relative_path.clone(),
            outcome,
            elapsed: started.elapsed(),
            detail: None,
            source_checksum: None,
            destination_checksum: None,
            hash_skipped: false,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Both sides were fully hashed.
    pub fn hashed(&self) -> bool {
        self.source_checksum.is_some() && self.destination_checksum.is_some()
    }
}

/// Counts per outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerificationSummary {
    pub total: usize,
    pub matched: usize,
    pub size_mismatches: usize,
    pub checksum_mismatches: usize,
    pub missing: usize,
    pub timeouts: usize,
    pub io_errors: usize,
}

impl VerificationSummary {
    pub fn failed(&self) -> usize {
        self.total - self.matched
    }
}

impl fmt::Display for VerificationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files: {} ok, {} size mismatch, {} checksum mismatch, {} missing, {} timed out, {} I/O error",
            self.total,
            self.matched,
            self.size_mismatches,
            self.checksum_mismatches,
            self.missing,
            self.timeouts,
            self.io_errors
        )
    }
}

/// Every result of one verification pass, in enumeration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub results: Vec<VerificationResult>,
    pub elapsed: Duration,
}

impl VerificationReport {
    pub fn summary(&self) -> VerificationSummary {
        let mut summary = VerificationSummary {
            total: self.results.len(),
            ..Default::default()
        };
        for result in &self.results {
            match result.outcome {
                VerificationOutcome::Match => summary.matched += 1,
                VerificationOutcome::SizeMismatch => summary.size_mismatches += 1,
                VerificationOutcome::ChecksumMismatch => summary.checksum_mismatches += 1,
                VerificationOutcome::MissingDestination => summary.missing += 1,
                VerificationOutcome::Timeout => summary.timeouts += 1,
                VerificationOutcome::IoError => summary.io_errors += 1,
            }
        }
        summary
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| !r.outcome.is_failure())
    }

    pub fn failures(&self) -> impl Iterator<Item = &VerificationResult> {
        self.results.iter().filter(|r| r.outcome.is_failure())
    }

    /// Files for which both digests were computed.
    pub fn hashes_computed(&self) -> usize {
        self.results.iter().filter(|r| r.hashed()).count()
    }

    /// Files whose digests were skipped because sizes already differed.
    pub fn hashes_skipped(&self) -> usize {
        self.results.iter().filter(|r| r.hash_skipped).count()
    }
}

/// A report tagged with the destination it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationReport {
    pub destination: PathBuf,
    pub report: VerificationReport,
}

/// Compares a source tree with a destination tree.
#[derive(Debug, Clone)]
pub struct Verifier {
    options: VerificationOptions,
    workers: usize,
    timeout_policy: TimeoutPolicy,
    cancel: Option<CancelToken>,
}

impl Verifier {
    pub fn new(options: VerificationOptions) -> Self {
        Verifier {
            options,
            workers: DEFAULT_WORKERS,
            timeout_policy: TimeoutPolicy::default(),
            cancel: None,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Enumerate the source and build one task per regular file.
    pub fn plan(
        &self,
        source_root: &Path,
        destination_root: &Path,
    ) -> Result<Vec<VerificationTask>, EngineError> {
        let algorithm = self.options.verify_checksum.then_some(self.options.algorithm);
        let tasks = fs_ops::enumerate_files(source_root)?
            .into_iter()
            .map(|file| VerificationTask {
                destination_path: destination_root.join(&file.relative_path),
                relative_path: file.relative_path,
                source_path: file.absolute_path,
                expected_size: file.size,
                check_size: self.options.verify_size,
                algorithm,
            })
            .collect();
        Ok(tasks)
    }

    pub fn verify(
        &self,
        source_root: &Path,
        destination_root: &Path,
    ) -> Result<VerificationReport, EngineError> {
        self.verify_with(source_root, destination_root, |_| {})
    }

    /// Like `verify`, calling `on_result` as each result is recorded.
    pub fn verify_with<F>(
        &self,
        source_root: &Path,
        destination_root: &Path,
        on_result: F,
    ) -> Result<VerificationReport, EngineError>
    where
        F: Fn(&VerificationResult) + Sync,
    {
        let tasks = self.plan(source_root, destination_root)?;
        log::info!(
            "Verifying {} files: {} -> {} ({} workers, checksum: {}, size: {})",
            tasks.len(),
            source_root.display(),
            destination_root.display(),
            self.workers.min(tasks.len()).max(1),
            if self.options.verify_checksum {
                self.options.algorithm.to_string()
            } else {
                "off".to_string()
            },
            if self.options.verify_size { "on" } else { "off" },
        );
        let report = self.run_tasks(&tasks, &on_result)?;
        log::info!(
            "Verification of {} finished in {:.1}s: {}",
            destination_root.display(),
            report.elapsed.as_secs_f64(),
            report.summary()
        );
        Ok(report)
    }

    /// Run `tasks` on the worker pool. Returns one result per task, in task order.
    pub fn run_tasks(
        &self,
        tasks: &[VerificationTask],
        on_result: &(dyn Fn(&VerificationResult) + Sync),
    ) -> Result<VerificationReport, EngineError> {
        let started = Instant::now();
        let total_bytes: u64 = tasks.iter().map(|t| t.expected_size).sum();
        let batch_deadline = started.checked_add(self.timeout_policy.batch_budget(total_bytes));

        let slots: Vec<OnceLock<VerificationResult>> = tasks.iter().map(|_| OnceLock::new()).collect();
        let (sender, receiver) = crossbeam_channel::unbounded::<usize>();
        for index in 0..tasks.len() {
            // The receiver is alive for the whole function.
            let _ = sender.send(index);
        }
        drop(sender);

        let workers = self.workers.min(tasks.len()).max(1);
        thread::scope(|scope| {
            for _ in 0..workers {
                let receiver = receiver.clone();
                let slots = &slots;
                scope.spawn(move || {
                    for index in receiver.iter() {
                        if self.is_cancelled() {
                            break;
                        }
                        let result = self.check(&tasks[index], batch_deadline);
                        if result.outcome.is_failure() {
                            log::warn!(
                                "Verification {}: {}{}",
                                result.outcome,
                                result.relative_path.display(),
                                result
                                    .detail
                                    .as_deref()
                                    .map(|d| format!(" ({d})"))
                                    .unwrap_or_default()
                            );
                        }
                        on_result(&result);
                        if slots[index].set(result).is_err() {
                            log::error!("Task {} produced more than one result", index);
                        }
                    }
                });
            }
        });

        if self.is_cancelled() {
            return Err(EngineError::Cancelled {
                phase: Phase::Verifying,
            });
        }

        let results = slots
            .into_iter()
            .zip(tasks)
            .map(|(slot, task)| {
                slot.into_inner().unwrap_or_else(|| {
                    VerificationResult::new(task, VerificationOutcome::IoError, started)
                        .with_detail("no result was recorded")
                })
            })
            .collect();

        Ok(VerificationReport {
            results,
            elapsed: started.elapsed(),
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    fn check(&self, task: &VerificationTask, batch_deadline: Option<Instant>) -> VerificationResult {
        let started = Instant::now();
        if batch_deadline.is_some_and(|d| started >= d) {
            return VerificationResult::new(task, VerificationOutcome::Timeout, started)
                .with_detail("verification time budget exhausted before this file was reached");
        }
        let deadline = earliest(
            started.checked_add(self.timeout_policy.file_budget(task.expected_size)),
            batch_deadline,
        );

        let destination = match fs::metadata(&task.destination_path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => {
                return VerificationResult::new(task, VerificationOutcome::IoError, started)
                    .with_detail("destination is not a regular file")
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return VerificationResult::new(task, VerificationOutcome::MissingDestination, started)
            }
            Err(e) => {
                return VerificationResult::new(task, VerificationOutcome::IoError, started)
                    .with_detail(format!("cannot stat destination: {e}"))
            }
        };

        if task.check_size && destination.len() != task.expected_size {
            let mut result = VerificationResult::new(task, VerificationOutcome::SizeMismatch, started)
                .with_detail(format!(
                    "expected {} bytes, found {}",
                    task.expected_size,
                    destination.len()
                ));
            result.hash_skipped = task.algorithm.is_some();
            return result;
        }

        let Some(algorithm) = task.algorithm else {
            return VerificationResult::new(task, VerificationOutcome::Match, started);
        };

        let source = match self.hash(&task.source_path, algorithm, deadline) {
            Ok(value) => value,
            Err(outcome) => return outcome.into_result(task, started, "source"),
        };
        let copy = match self.hash(&task.destination_path, algorithm, deadline) {
            Ok(value) => value,
            Err(outcome) => return outcome.into_result(task, started, "destination"),
        };

        let outcome = if source.hex() == copy.hex() {
            VerificationOutcome::Match
        } else {
            VerificationOutcome::ChecksumMismatch
        };
        let mut result = VerificationResult::new(task, outcome, started);
        if outcome.is_failure() {
            result.detail = Some(format!(
                "source {} != destination {}",
                source.to_string_with_algo(),
                copy.to_string_with_algo()
            ));
        }
        result.source_checksum = Some(source);
        result.destination_checksum = Some(copy);
        result
    }

    fn hash(
        &self,
        path: &Path,
        algorithm: ChecksumAlgorithm,
        deadline: Option<Instant>,
    ) -> Result<ChecksumValue, HashFailure> {
        match hash_file_bounded(path, algorithm, deadline, self.cancel.as_ref()) {
            Ok(BoundedHash::Complete(value)) => Ok(value),
            Ok(BoundedHash::DeadlineExceeded) => Err(HashFailure::Timeout),
            Ok(BoundedHash::Cancelled) => Err(HashFailure::Cancelled),
            Err(e) => Err(HashFailure::Io(e)),
        }
    }
}

enum HashFailure {
    Timeout,
    Cancelled,
    Io(EngineError),
}

impl HashFailure {
    fn into_result(self, task: &VerificationTask, started: Instant, side: &str) -> VerificationResult {
        match self {
            HashFailure::Timeout => VerificationResult::new(task, VerificationOutcome::Timeout, started)
                .with_detail(format!("time budget exceeded while hashing {side}")),
            // Discarded: a cancelled pass returns an error, not a report.
            HashFailure::Cancelled => VerificationResult::new(task, VerificationOutcome::IoError, started)
                .with_detail("cancelled"),
            HashFailure::Io(e) => VerificationResult::new(task, VerificationOutcome::IoError, started)
                .with_detail(format!("{side}: {e}")),
        }
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
