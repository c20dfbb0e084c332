//! Terminal rendering of a run.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use engine::{
    Phase, ProgressEvent, RunStatus, TransferObserver, TransferReport, TransferState,
    VerificationResult,
};

const REDRAW_INTERVAL: Duration = Duration::from_millis(200);

/// CLI implementation of TransferObserver for displaying run progress
pub struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_progress_update: Mutex<Option<Instant>>,
}

impl CliProgress {
    pub fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
            last_progress_update: Mutex::new(None),
        }
    }

    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    pub fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    pub fn progress_bar(percent: u8) -> String {
        let percent = percent.min(100);
        let filled = (percent / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {:3}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    /// One status line from the current state.
    pub fn status_line(state: &TransferState) -> String {
        let percent = state.percent.unwrap_or_else(|| {
            if state.bytes_total == 0 {
                0
            } else {
                (state.bytes_transferred.saturating_mul(100) / state.bytes_total).min(100) as u8
            }
        });
        let mut line = format!(
            "{} | {}/{}",
            Self::progress_bar(percent),
            Self::format_bytes(state.bytes_transferred),
            Self::format_bytes(state.bytes_total)
        );
        if let Some(speed) = state.bytes_per_second {
            line.push_str(&format!(" | {}/s", Self::format_bytes(speed)));
        }
        if let Some(eta) = state.eta {
            line.push_str(&format!(" | ETA {}", Self::format_duration(eta)));
        }
        if let Some(file) = &state.current_file {
            line.push_str(&format!(" | {}", file));
        }
        line
    }

    fn should_redraw(&self) -> bool {
        let mut last = self
            .last_progress_update
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < REDRAW_INTERVAL => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn end_progress_line(&self) {
        let mut last = self
            .last_progress_update
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if last.take().is_some() {
            eprintln!();
        }
    }
}

impl TransferObserver for CliProgress {
    fn on_phase_changed(&self, _from: Phase, to: Phase) {
        self.end_progress_line();
        let message = match to {
            Phase::Validating => "Checking source, destinations and tools...",
            Phase::Transferring => "Copying...",
            Phase::Verifying => "Verifying copies against the source...",
            Phase::ManifestChecking => "Creating and verifying MHL manifests...",
            Phase::Completed | Phase::Failed | Phase::Cancelled | Phase::Idle => return,
        };
        eprintln!("==> {}", message);
    }

    fn on_progress(&self, state: &TransferState, event: &ProgressEvent) {
        match event {
            ProgressEvent::FileCompleted { name } if self.verbose => {
                self.end_progress_line();
                eprintln!("    copied: {}", name);
            }
            ProgressEvent::RawLogLine(_) | ProgressEvent::ErrorLine(_) => {}
            _ => {
                if !self.should_redraw() {
                    return;
                }
                let destination = state
                    .destination_index
                    .map(|i| format!("[{}] ", i + 1))
                    .unwrap_or_default();
                eprint!("\r{}{}\x1b[K", destination, Self::status_line(state));
                let _ = std::io::stderr().flush();
            }
        }
    }

    fn on_verification_result(&self, destination: &Path, result: &VerificationResult) {
        if result.outcome.is_failure() {
            eprintln!(
                "    {}: {} ({}){}",
                result.outcome,
                result.relative_path.display(),
                destination.display(),
                result
                    .detail
                    .as_deref()
                    .map(|d| format!(": {}", d))
                    .unwrap_or_default()
            );
        } else if self.verbose {
            eprintln!("    ok: {} ({})", result.relative_path.display(), destination.display());
        }
    }

    fn on_finished(&self, report: &TransferReport) {
        self.end_progress_line();
        eprintln!();

        for copy in &report.copies {
            eprintln!(
                "Copy to {}: exit code {}{}",
                copy.destination.display(),
                copy.exit.code,
                if copy.exit.cancelled { " (cancelled)" } else { "" }
            );
        }
        for destination in &report.verification {
            eprintln!(
                "Verification of {}: {}",
                destination.destination.display(),
                destination.report.summary()
            );
        }
        for manifest in &report.manifests {
            let status = if manifest.is_success() {
                "verified".to_string()
            } else {
                format!("{:?}", manifest.status)
            };
            eprintln!("Manifest at {}: {}", manifest.destination.display(), status);
        }

        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
        match &report.status {
            RunStatus::Completed => eprintln!("Offload complete. Run {}", report.run_id),
            RunStatus::Cancelled => eprintln!("Offload cancelled during {}.", report.stopped_in),
            RunStatus::Failed(err) => {
                eprintln!("Offload FAILED during {}: {}", report.stopped_in, err);
                let diagnostics = err.diagnostics();
                if !diagnostics.is_empty() {
                    eprintln!("Last tool output:");
                    for line in diagnostics {
                        eprintln!("  {}", line);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(CliProgress::format_bytes(0), "0.00 B");
        assert_eq!(CliProgress::format_bytes(1536), "1.50 KB");
        assert_eq!(CliProgress::format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(CliProgress::format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(CliProgress::format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(CliProgress::format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_progress_bar_is_clamped() {
        assert_eq!(CliProgress::progress_bar(50), format!("[{}{}]  50%", "=".repeat(10), " ".repeat(10)));
        assert_eq!(CliProgress::progress_bar(250), format!("[{}] 100%", "=".repeat(20)));
    }

    #[test]
    fn test_status_line_falls_back_to_byte_ratio() {
        let state = TransferState {
            bytes_transferred: 512,
            bytes_total: 1024,
            current_file: Some("A001C001.mov".to_string()),
            ..TransferState::default()
        };
        let line = CliProgress::status_line(&state);
        assert!(line.contains(" 50%"));
        assert!(line.ends_with("A001C001.mov"));
    }

    #[test]
    fn test_redraw_is_throttled() {
        let progress = CliProgress::new(false);
        assert!(progress.should_redraw());
        assert!(!progress.should_redraw());
    }
}
