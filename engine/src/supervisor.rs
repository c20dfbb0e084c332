//! Process supervision for the external copy and manifest tools.
//!
//! `Supervisor::start` resolves the executable before anything is spawned,
//! launches it with piped stdout/stderr and hands each pipe to a reader thread.
//! The readers split the byte stream into lines (on `\n` and on the `\r`
//! progress redraws), keep a bounded tail for diagnostics and push every line
//! into an unbounded channel, so the child never stalls on a full pipe no
//! matter how slowly the consumer reads.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

#[cfg(unix)]
use std::os::unix::process::{CommandExt, ExitStatusExt};

use crate::cancel::CancelToken;
use crate::error::EngineError;

/// Number of trailing output lines kept for diagnostics by default.
pub const DEFAULT_TAIL_LINES: usize = 20;

/// Exit code reported when the platform gives neither a code nor a signal.
const UNKNOWN_EXIT_CODE: i32 = 255;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A single line of child output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

/// How a supervised child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; signal deaths are reported as `128 + signal`
    pub code: i32,
    /// True if the child was killed through `cancel`
    pub cancelled: bool,
    /// The last captured output lines, oldest first
    pub tail: Vec<String>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == 0 && !self.cancelled
    }
}

/// Resolve `program` to an executable path without spawning anything.
///
/// Bare names are looked up on `PATH`; explicit paths must exist and be
/// executable.
pub fn resolve_executable(program: &Path) -> Result<PathBuf, EngineError> {
    which::which(program).map_err(|e| EngineError::Launch {
        program: program.to_path_buf(),
        reason: format!("executable not found or not executable ({e})"),
    })
}

/// Launches child processes and wires up their output.
#[derive(Debug, Clone)]
pub struct Supervisor {
    tail_lines: usize,
}

impl Default for Supervisor {
    fn default() -> Self {
        Supervisor {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

impl Supervisor {
    pub fn new(tail_lines: usize) -> Self {
        Supervisor {
            tail_lines: tail_lines.max(1),
        }
    }

    /// Start `executable` with `args`, optionally inside `working_dir`.
    pub fn start(
        &self,
        executable: &Path,
        args: &[OsString],
        working_dir: Option<&Path>,
    ) -> Result<ProcessHandle, EngineError> {
        let resolved = resolve_executable(executable)?;

        let mut command = Command::new(&resolved);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }
        // Own process group, so cancel also reaches anything the tool spawns.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| EngineError::Launch {
            program: executable.to_path_buf(),
            reason: format!("failed to spawn {}: {e}", resolved.display()),
        })?;
        log::debug!(
            "Spawned {} (pid {}) with {} argument(s)",
            resolved.display(),
            child.id(),
            args.len()
        );

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(self.tail_lines)));
        let (sender, receiver) = unbounded();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                stdout,
                StreamKind::Stdout,
                sender.clone(),
                Arc::clone(&tail),
                self.tail_lines,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                stderr,
                StreamKind::Stderr,
                sender.clone(),
                Arc::clone(&tail),
                self.tail_lines,
            ));
        }
        // Only the readers may hold senders, so the channel closes with the pipes.
        drop(sender);

        let control = ProcessControl {
            program: resolved,
            pid: child.id(),
            child: Arc::new(Mutex::new(child)),
            cancelled: Arc::new(AtomicBool::new(false)),
        };

        Ok(ProcessHandle {
            control,
            lines: Some(receiver),
            readers,
            tail,
            finished: false,
        })
    }

    /// Start a child, feed every output line to `on_line`, and wait for it.
    ///
    /// While it runs the child is attached to `cancel`, if given.
    pub fn run_to_completion(
        &self,
        executable: &Path,
        args: &[OsString],
        working_dir: Option<&Path>,
        cancel: Option<&CancelToken>,
        mut on_line: impl FnMut(&OutputLine),
    ) -> Result<ProcessExit, EngineError> {
        let mut handle = self.start(executable, args, working_dir)?;
        if let Some(token) = cancel {
            token.attach(handle.control());
        }
        for line in handle.output() {
            on_line(&line);
        }
        let exit = handle.wait();
        if let Some(token) = cancel {
            token.detach();
        }
        exit
    }
}

/// Cloneable control over a running child: cancel it or ask if it is alive.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    program: PathBuf,
    pid: u32,
    child: Arc<Mutex<Child>>,
    cancelled: Arc<AtomicBool>,
}

impl ProcessControl {
    /// Forcefully kill the child and its process group. A no-op if it
    /// already exited or was already cancelled.
    pub fn cancel(&self) {
        let mut child = lock_child(&self.child);
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        match child.try_wait() {
            Ok(Some(_)) => {}
            Ok(None) => match kill_tree(&mut child, self.pid) {
                Ok(()) => {
                    self.cancelled.store(true, Ordering::SeqCst);
                    log::warn!("Killed {} (pid {})", self.program.display(), self.pid);
                }
                Err(e) => log::warn!("Failed to kill pid {}: {}", self.pid, e),
            },
            Err(e) => log::warn!("Failed to query pid {}: {}", self.pid, e),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(lock_child(&self.child).try_wait(), Ok(None))
    }
}

/// Kill the child's whole process group, falling back to the child alone.
#[cfg(unix)]
fn kill_tree(child: &mut Child, pid: u32) -> io::Result<()> {
    let Ok(group) = libc::pid_t::try_from(pid) else {
        return child.kill();
    };
    // SAFETY: killpg only sends a signal; the group was created at spawn and
    // cannot be reused while the unreaped leader holds its id.
    if unsafe { libc::killpg(group, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        let err = io::Error::last_os_error();
        log::debug!("killpg({}) failed: {}; killing the child only", group, err);
        child.kill()
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child, _pid: u32) -> io::Result<()> {
    child.kill()
}

/// A launched child process.
pub struct ProcessHandle {
    control: ProcessControl,
    lines: Option<Receiver<OutputLine>>,
    readers: Vec<JoinHandle<()>>,
    tail: Arc<Mutex<VecDeque<String>>>,
    finished: bool,
}

impl ProcessHandle {
    pub fn control(&self) -> ProcessControl {
        self.control.clone()
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// The child's output lines, in arrival order, until both pipes close.
    ///
    /// One-shot: the stream is handed out once, later calls yield nothing.
    pub fn output(&mut self) -> OutputLines {
        OutputLines {
            receiver: self.lines.take(),
        }
    }

    fn tail(&self) -> Vec<String> {
        lock_tail(&self.tail).iter().cloned().collect()
    }

    /// Block until the child exits and its output readers are done.
    pub fn wait(mut self) -> Result<ProcessExit, EngineError> {
        let status = self.poll_until_exit()?;
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        self.finished = true;

        Ok(ProcessExit {
            code: exit_code_of(status),
            cancelled: self.control.cancelled.load(Ordering::SeqCst),
            tail: self.tail(),
        })
    }

    fn poll_until_exit(&self) -> Result<ExitStatus, EngineError> {
        loop {
            let polled = lock_child(&self.control.child).try_wait();
            match polled {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => thread::sleep(WAIT_POLL_INTERVAL),
                Err(source) => {
                    return Err(EngineError::Process {
                        program: self.control.program.clone(),
                        source,
                    })
                }
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Never leave an orphan behind: kill and reap.
        self.control.cancel();
        let _ = lock_child(&self.control.child).wait();
    }
}

/// Iterator over a child's output; see [`ProcessHandle::output`].
pub struct OutputLines {
    receiver: Option<Receiver<OutputLine>>,
}

impl Iterator for OutputLines {
    type Item = OutputLine;

    fn next(&mut self) -> Option<OutputLine> {
        self.receiver.as_ref()?.recv().ok()
    }
}

/// Splits a byte stream into text lines on `\n` and `\r`.
///
/// Invalid UTF-8 is replaced, blank fragments are dropped, and a trailing
/// fragment without terminator is returned by `finish`.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' || byte == b'\r' {
                if let Some(line) = self.take_pending() {
                    lines.push(line);
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        self.take_pending()
    }

    fn take_pending(&mut self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.pending).trim_end().to_string();
        self.pending.clear();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

fn spawn_reader<R>(
    mut reader: R,
    stream: StreamKind,
    sender: Sender<OutputLine>,
    tail: Arc<Mutex<VecDeque<String>>>,
    tail_lines: usize,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut splitter = LineSplitter::default();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        let deliver = |text: String| {
            {
                let mut tail = lock_tail(&tail);
                if tail.len() == tail_lines {
                    tail.pop_front();
                }
                tail.push_back(text.clone());
            }
            // The consumer may have gone away; keep draining regardless.
            let _ = sender.send(OutputLine { stream, text });
        };

        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => splitter.push(&chunk[..n]).into_iter().for_each(&deliver),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("{:?} reader stopped: {}", stream, e);
                    break;
                }
            }
        }
        if let Some(text) = splitter.finish() {
            deliver(text);
        }
    })
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    UNKNOWN_EXIT_CODE
}

fn lock_child(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_tail(tail: &Mutex<VecDeque<String>>) -> MutexGuard<'_, VecDeque<String>> {
    tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
