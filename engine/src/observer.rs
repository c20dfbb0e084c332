//! Run observation.
//!
//! This module defines the TransferObserver trait, which decouples the
//! transfer machine from any specific front end (terminal, GUI, automation).
//!
//! Callbacks are invoked synchronously from the thread that produced the
//! event. Verification results arrive from worker threads, so implementations
//! must be `Send + Sync` and should return quickly.

use std::path::{Path, PathBuf};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::model::{Phase, TransferReport, TransferState};
use crate::progress::ProgressEvent;
use crate::verify::VerificationResult;

/// Trait for receiving updates from a running `TransferMachine`.
pub trait TransferObserver: Send + Sync {
    /// Called on every phase transition, terminal ones included.
    fn on_phase_changed(&self, from: Phase, to: Phase);

    /// Called for every event parsed from copy-tool output.
    ///
    /// `state` already includes the event.
    fn on_progress(&self, state: &TransferState, event: &ProgressEvent);

    /// Called once per verified file, from a verification worker.
    fn on_verification_result(&self, destination: &Path, result: &VerificationResult);

    /// Called once, after the run reached its terminal phase.
    fn on_finished(&self, report: &TransferReport);
}

/// Owned form of the observer callbacks, for crossing threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    PhaseChanged { from: Phase, to: Phase },
    Progress { state: TransferState, event: ProgressEvent },
    VerificationResult { destination: PathBuf, result: VerificationResult },
    Finished { phase: Phase },
}

/// Forwards every callback into a channel.
///
/// Sends never block. Events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: Sender<TransferEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<TransferEvent>) {
        let (sender, receiver) = unbounded();
        (ChannelObserver { sender }, receiver)
    }

    fn send(&self, event: TransferEvent) {
        let _ = self.sender.send(event);
    }
}

impl TransferObserver for ChannelObserver {
    fn on_phase_changed(&self, from: Phase, to: Phase) {
        self.send(TransferEvent::PhaseChanged { from, to });
    }

    fn on_progress(&self, state: &TransferState, event: &ProgressEvent) {
        self.send(TransferEvent::Progress {
            state: state.clone(),
            event: event.clone(),
        });
    }

    fn on_verification_result(&self, destination: &Path, result: &VerificationResult) {
        self.send(TransferEvent::VerificationResult {
            destination: destination.to_path_buf(),
            result: result.clone(),
        });
    }

    fn on_finished(&self, report: &TransferReport) {
        self.send(TransferEvent::Finished {
            phase: report.final_phase(),
        });
    }
}
