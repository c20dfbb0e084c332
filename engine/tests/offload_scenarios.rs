//! End-to-end runs of the transfer machine against stand-in copy and
//! manifest tools written as shell scripts.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use engine::{
    ChannelObserver, EngineConfig, EngineError, ErrorKind, ManifestStatus, Phase,
    ProgressEvent, RunStatus, TransferEvent, TransferMachine, TransferReport, TransferRequest,
    VerificationOptions, VerificationOutcome,
};
use tempfile::TempDir;

/// Prints rclone-style output, copies `$2` into `$3`, then runs `extra`.
fn fake_copy_tool(dir: &Path, extra: &str) -> PathBuf {
    let script = format!(
        "#!/bin/sh\n\
         src=\"$2\"\n\
         dst=\"$3\"\n\
         echo \"$@\" >> \"{calls}\"\n\
         mkdir -p \"$dst\" || exit 1\n\
         echo ' *                                 A.mov: 50% /100, 100/s, 0s'\n\
         cp -R \"$src\"/. \"$dst\"/ || exit 1\n\
         echo 'Transferred:   \t  300 B / 300 B, 100%, 300 B/s, ETA 0s'\n\
         echo 'Transferred:            3 / 3, 100%'\n\
         echo '2024/05/01 10:00:00 INFO  : A.mov: Copied (new)' >&2\n\
         {extra}\n\
         exit 0\n",
        calls = dir.join("copy-calls.log").display(),
    );
    write_script(dir, "fake-rclone", &script)
}

/// `create` and `verify` succeed unless the root holds `FAIL_<mode>`.
fn fake_manifest_tool(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "fake-ascmhl",
        "#!/bin/sh\n\
         echo \"$1 $2\"\n\
         if [ \"$1\" = create ] && [ -e \"$2/FAIL_create\" ]; then echo 'create failed' >&2; exit 2; fi\n\
         if [ \"$1\" = verify ] && [ -e \"$2/FAIL_verify\" ]; then echo 'verify failed' >&2; exit 1; fi\n\
         exit 0\n",
    )
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("Failed to write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("Failed to chmod script");
    path
}

fn copy_calls(tools: &Path) -> usize {
    fs::read_to_string(tools.join("copy-calls.log"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// A card with A.mov (100 B), B.mov (200 B) and C.mov (empty).
fn card() -> TempDir {
    let src = tempfile::tempdir().expect("Failed to create temp dir");
    fs::create_dir(src.path().join("CLIPS")).expect("Failed to create dir");
    fs::write(src.path().join("A.mov"), [b'a'; 100]).expect("Failed to write A");
    fs::write(src.path().join("CLIPS/B.mov"), [b'b'; 200]).expect("Failed to write B");
    fs::write(src.path().join("C.mov"), b"").expect("Failed to write C");
    src
}

struct Rig {
    tools: TempDir,
    source: TempDir,
    targets: TempDir,
}

impl Rig {
    fn new() -> Self {
        Rig {
            tools: tempfile::tempdir().expect("Failed to create temp dir"),
            source: card(),
            targets: tempfile::tempdir().expect("Failed to create temp dir"),
        }
    }

    fn destination(&self, name: &str) -> PathBuf {
        self.targets.path().join(name)
    }

    fn config(&self, copy_extra: &str) -> EngineConfig {
        EngineConfig::default()
            .with_copy_tool(fake_copy_tool(self.tools.path(), copy_extra))
            .with_manifest_tool(fake_manifest_tool(self.tools.path()))
    }

    fn request(&self, destinations: &[&str]) -> TransferRequest {
        TransferRequest::new(
            self.source.path(),
            destinations.iter().map(|d| self.destination(d)).collect(),
        )
    }
}

fn run_observed(config: &EngineConfig, request: TransferRequest) -> (TransferReport, Vec<TransferEvent>) {
    let (observer, events) = ChannelObserver::new();
    let report = TransferMachine::new(config, request)
        .with_observer(Arc::new(observer))
        .run();
    (report, events.try_iter().collect())
}

fn phases(events: &[TransferEvent]) -> Vec<Phase> {
    events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::PhaseChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

fn outcome(report: &TransferReport, destination: usize, rel: &str) -> VerificationOutcome {
    report.verification[destination]
        .report
        .results
        .iter()
        .find(|r| r.relative_path == Path::new(rel))
        .map(|r| r.outcome)
        .unwrap_or_else(|| panic!("no result for {rel}"))
}

#[test]
fn test_clean_offload_completes_with_every_phase() {
    let rig = Rig::new();
    let (report, events) = run_observed(&rig.config(""), rig.request(&["RAID"]));

    assert!(report.is_success(), "run failed: {:?}", report.error());
    assert_eq!(
        phases(&events),
        vec![Phase::Validating, Phase::Transferring, Phase::Verifying, Phase::Completed]
    );
    assert_eq!(report.stopped_in, Phase::Verifying);
    assert_eq!(report.copies.len(), 1);
    assert!(report.copies[0].exit.success());

    let verification = &report.verification[0].report;
    assert_eq!(verification.results.len(), 3);
    assert!(verification.is_success());
    assert_eq!(verification.hashes_computed(), 3);

    assert!(events.iter().any(|e| matches!(
        e,
        TransferEvent::Progress {
            event: ProgressEvent::BytesTransferred {
                transferred: 300,
                total: 300
            },
            ..
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        TransferEvent::Progress {
            event: ProgressEvent::FileCompleted { .. },
            ..
        }
    )));
    let verified = events
        .iter()
        .filter(|e| matches!(e, TransferEvent::VerificationResult { .. }))
        .count();
    assert_eq!(verified, 3);
    assert_eq!(events.last(), Some(&TransferEvent::Finished { phase: Phase::Completed }));
}

#[test]
fn test_file_missing_at_destination_fails_verification() {
    let rig = Rig::new();
    let config = rig.config("rm -f \"$dst/C.mov\"");
    let (report, _) = run_observed(&config, rig.request(&["RAID"]));

    assert_eq!(report.final_phase(), Phase::Failed);
    assert_eq!(report.stopped_in, Phase::Verifying);
    let err = report.error().expect("Run should have failed");
    assert_eq!(err.kind(), ErrorKind::Verification);
    match err {
        EngineError::VerificationFailed { reports } => {
            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0].report.results.len(), 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(outcome(&report, 0, "A.mov"), VerificationOutcome::Match);
    assert_eq!(outcome(&report, 0, "CLIPS/B.mov"), VerificationOutcome::Match);
    assert_eq!(outcome(&report, 0, "C.mov"), VerificationOutcome::MissingDestination);
}

#[test]
fn test_truncated_copy_is_a_size_mismatch() {
    let rig = Rig::new();
    let config = rig.config("printf 'b' > \"$dst/CLIPS/B.mov\"");
    let (report, _) = run_observed(&config, rig.request(&["RAID"]));

    assert_eq!(outcome(&report, 0, "CLIPS/B.mov"), VerificationOutcome::SizeMismatch);
    assert_eq!(report.verification[0].report.hashes_skipped(), 1);
    assert!(matches!(
        report.error(),
        Some(EngineError::VerificationFailed { .. })
    ));
}

#[test]
fn test_corrupted_copy_of_same_size_is_a_checksum_mismatch() {
    let rig = Rig::new();
    let config = rig.config("tr b c < \"$src/CLIPS/B.mov\" > \"$dst/CLIPS/B.mov\"");
    let (report, _) = run_observed(&config, rig.request(&["RAID"]));

    assert_eq!(outcome(&report, 0, "CLIPS/B.mov"), VerificationOutcome::ChecksumMismatch);
    assert_eq!(outcome(&report, 0, "A.mov"), VerificationOutcome::Match);
}

#[test]
fn test_every_destination_is_verified_before_failing() {
    let rig = Rig::new();
    let config = rig.config("case \"$dst\" in *SHUTTLE) rm -f \"$dst/A.mov\";; esac");
    let (report, _) = run_observed(&config, rig.request(&["RAID", "SHUTTLE"]));

    assert_eq!(report.copies.len(), 2);
    assert_eq!(report.verification.len(), 2);
    assert!(report.verification[0].report.is_success());
    assert_eq!(outcome(&report, 1, "A.mov"), VerificationOutcome::MissingDestination);
}

#[test]
fn test_copy_tool_failure_stops_at_that_destination() {
    let rig = Rig::new();
    let config = rig.config(
        "case \"$dst\" in *SHUTTLE) echo 'ERROR : A.mov: Failed to copy: disk full' >&2; exit 5;; esac",
    );
    let (report, events) = run_observed(&config, rig.request(&["RAID", "SHUTTLE", "BACKUP"]));

    assert_eq!(report.final_phase(), Phase::Failed);
    assert_eq!(report.stopped_in, Phase::Transferring);
    assert_eq!(report.copies.len(), 2);
    assert_eq!(copy_calls(rig.tools.path()), 2);
    assert!(!rig.destination("BACKUP").exists());
    match report.error() {
        Some(EngineError::Transfer {
            destination,
            exit_code,
            diagnostics,
        }) => {
            assert_eq!(destination, &rig.destination("SHUTTLE"));
            assert_eq!(*exit_code, 5);
            assert!(diagnostics.iter().any(|l| l.contains("disk full")));
        }
        other => panic!("unexpected status: {other:?}"),
    }
    assert!(events.iter().any(|e| matches!(
        e,
        TransferEvent::Progress {
            event: ProgressEvent::ErrorLine(_),
            ..
        }
    )));
    assert!(!phases(&events).contains(&Phase::Verifying));
}

#[test]
fn test_empty_source_never_starts_the_copy_tool() {
    let rig = Rig::new();
    let empty = tempfile::tempdir().expect("Failed to create temp dir");
    let request = TransferRequest::new(empty.path(), vec![rig.destination("RAID")]);
    let (report, events) = run_observed(&rig.config(""), request);

    let err = report.error().expect("Run should have failed");
    assert!(matches!(err, EngineError::EmptySource { .. }));
    assert!(err.is_preflight());
    assert_eq!(copy_calls(rig.tools.path()), 0);
    assert_eq!(phases(&events), vec![Phase::Validating, Phase::Failed]);
}

#[test]
fn test_missing_manifest_tool_fails_before_transferring() {
    let rig = Rig::new();
    let config = rig
        .config("")
        .with_manifest_tool(rig.tools.path().join("no-ascmhl"));
    let (report, _) = run_observed(&config, rig.request(&["RAID"]).with_manifest(true));

    let err = report.error().expect("Run should have failed");
    assert_eq!(err.kind(), ErrorKind::Launch);
    assert_eq!(report.stopped_in, Phase::Validating);
    assert_eq!(copy_calls(rig.tools.path()), 0);
}

#[test]
fn test_manifests_are_created_and_verified_everywhere() {
    let rig = Rig::new();
    let request = rig.request(&["RAID", "SHUTTLE"]).with_manifest(true);
    let (report, events) = run_observed(&rig.config(""), request);

    assert!(report.is_success(), "run failed: {:?}", report.error());
    assert_eq!(
        phases(&events),
        vec![
            Phase::Validating,
            Phase::Transferring,
            Phase::Verifying,
            Phase::ManifestChecking,
            Phase::Completed
        ]
    );
    assert_eq!(report.manifests.len(), 2);
    assert!(report.manifests.iter().all(|m| m.status == ManifestStatus::Verified));
}

#[test]
fn test_manifest_failure_is_reported_for_its_destination_only() {
    let rig = Rig::new();
    let config = rig.config("case \"$dst\" in *RAID) touch \"$dst/FAIL_verify\";; esac");
    let request = rig.request(&["RAID", "SHUTTLE"]).with_manifest(true);
    // The marker is not on the card, so verification would flag it.
    let request = request.with_verification(VerificationOptions {
        verify_checksum: false,
        verify_size: false,
        ..VerificationOptions::default()
    });
    let (report, events) = run_observed(&config, request);

    assert!(!phases(&events).contains(&Phase::Verifying));
    assert_eq!(report.stopped_in, Phase::ManifestChecking);
    match report.error() {
        Some(EngineError::Manifest { failures }) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].destination, rig.destination("RAID"));
            assert!(failures[0].diagnostics().iter().any(|l| l == "verify failed"));
        }
        other => panic!("unexpected status: {other:?}"),
    }
    assert_eq!(report.manifests.len(), 2);
    assert!(report.manifests[1].is_success());
}

#[test]
fn test_cancel_during_transfer_kills_the_copy_tool() {
    let rig = Rig::new();
    let config = rig.config("exec sleep 30");
    let (observer, events) = ChannelObserver::new();
    let machine = TransferMachine::new(&config, rig.request(&["RAID", "SHUTTLE"]))
        .with_observer(Arc::new(observer));
    let cancel = machine.cancel_handle();
    let view = machine.state_view();

    let canceller = thread::spawn(move || {
        for event in events.iter() {
            if let TransferEvent::Progress {
                event: ProgressEvent::FileCompleted { .. },
                ..
            } = event
            {
                thread::sleep(Duration::from_millis(100));
                cancel.cancel();
                cancel.cancel();
                break;
            }
        }
    });

    let started = Instant::now();
    let report = machine.run();
    canceller.join().expect("canceller thread panicked");

    assert!(matches!(report.status, RunStatus::Cancelled));
    assert_eq!(report.stopped_in, Phase::Transferring);
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(report.copies.len(), 1);
    assert!(report.copies[0].exit.cancelled);
    assert_eq!(copy_calls(rig.tools.path()), 1);
    assert!(report.verification.is_empty());
    assert!(view.snapshot().cancel_requested);
    assert_eq!(view.phase(), Phase::Cancelled);
}

#[test]
fn test_cancel_reaches_work_the_copy_tool_spawned() {
    let rig = Rig::new();
    // The copy tool waits on a child of its own instead of exec'ing it.
    let config = rig.config("sh -c 'sleep 3; touch \"$0/late\"' \"$dst\"; echo finished");
    let machine = TransferMachine::new(&config, rig.request(&["RAID"]));
    let cancel = machine.cancel_handle();
    let view = machine.state_view();

    let canceller = thread::spawn(move || {
        while view.snapshot().files_done == 0 && !view.phase().is_terminal() {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(200));
        cancel.cancel();
    });

    let started = Instant::now();
    let report = machine.run();
    canceller.join().expect("canceller thread panicked");

    assert!(matches!(report.status, RunStatus::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(report.copies[0].exit.cancelled);

    thread::sleep(Duration::from_secs(4));
    assert!(!rig.destination("RAID").join("late").exists());
}

#[test]
fn test_repeated_runs_give_the_same_outcome() {
    let rig = Rig::new();
    let config = rig.config("");
    let first = TransferMachine::new(&config, rig.request(&["RAID"])).run();
    let second = TransferMachine::new(&config, rig.request(&["RAID"])).run();

    assert!(first.is_success());
    assert!(second.is_success());
    assert_ne!(first.run_id, second.run_id);
    let outcomes = |r: &TransferReport| {
        r.verification[0]
            .report
            .results
            .iter()
            .map(|r| (r.relative_path.clone(), r.outcome))
            .collect::<Vec<_>>()
    };
    assert_eq!(outcomes(&first), outcomes(&second));
}

#[test]
fn test_worker_count_does_not_change_results() {
    let rig = Rig::new();
    let config = rig.config("rm -f \"$dst/A.mov\"");
    let single = TransferMachine::new(
        &config.clone().with_verification_workers(1),
        rig.request(&["RAID"]),
    )
    .run();
    let many = TransferMachine::new(&config.with_verification_workers(8), rig.request(&["RAID"])).run();

    let summary = |r: &TransferReport| r.verification[0].report.summary();
    assert_eq!(summary(&single), summary(&many));
    assert_eq!(summary(&single).missing, 1);
    assert_eq!(summary(&single).total, 3);
}
