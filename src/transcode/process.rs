//! Transcoder process abstraction
//!
//! The supervisor talks to processes through [`Launcher`] and
//! [`ChildProcess`] so sessions can be exercised without an FFmpeg binary.

use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, watch};

use super::config::{OutputTarget, TranscodeCommand};
use crate::registry::SessionKey;

/// Boxed output pipe of a child process
pub type OutputPipe = Box<dyn AsyncRead + Send + Unpin>;

/// How a transcoder process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    pub success: bool,
    /// Exit was the result of a stop request
    pub requested: bool,
    /// Last stderr lines
    pub diagnostic: String,
}

impl ExitReport {
    /// Human readable reason for an unexpected exit
    pub fn describe(&self) -> String {
        let status = match self.code {
            Some(code) => format!("transcoder exited with code {}", code),
            None => "transcoder terminated by signal".to_string(),
        };
        if self.diagnostic.is_empty() {
            status
        } else {
            format!("{}: {}", status, self.diagnostic)
        }
    }
}

/// A running transcoder
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    fn take_stdout(&mut self) -> Option<OutputPipe>;

    fn take_stderr(&mut self) -> Option<OutputPipe>;

    /// Ask the process to finish on its own
    async fn request_stop(&mut self) -> io::Result<()>;

    /// Forcibly kill the process without waiting
    fn start_kill(&mut self) -> io::Result<()>;

    /// Wait for the process to exit (cancel safe)
    async fn wait(&mut self) -> io::Result<ExitReport>;
}

/// Spawns transcoder processes
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, command: &TranscodeCommand) -> io::Result<Box<dyn ChildProcess>>;
}

/// Launches real processes with `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, command: &TranscodeCommand) -> io::Result<Box<dyn ChildProcess>> {
        let stdout = match command.output {
            OutputTarget::Stdout => Stdio::piped(),
            OutputTarget::Directory { .. } => Stdio::null(),
        };

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        Ok(Box::new(OsProcess { child, stdin }))
    }
}

struct OsProcess {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl ChildProcess for OsProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<OutputPipe> {
        self.child
            .stdout
            .take()
            .map(|pipe| Box::new(pipe) as OutputPipe)
    }

    fn take_stderr(&mut self) -> Option<OutputPipe> {
        self.child
            .stderr
            .take()
            .map(|pipe| Box::new(pipe) as OutputPipe)
    }

    async fn request_stop(&mut self) -> io::Result<()> {
        // FFmpeg finishes the current output and exits on `q`
        match self.stdin.take() {
            Some(mut stdin) => {
                stdin.write_all(b"q").await?;
                stdin.flush().await
            }
            None => Ok(()),
        }
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<ExitReport> {
        let status = self.child.wait().await?;
        Ok(ExitReport {
            code: status.code(),
            success: status.success(),
            requested: false,
            diagnostic: String::new(),
        })
    }
}

/// Observable state of a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Spawned, no output yet
    Running,
    /// Output observed
    Producing,
    Exited(ExitReport),
}

/// Rolling tail of a process's stderr
#[derive(Debug)]
pub(crate) struct Diagnostics {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Diagnostics {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&self, line: String) {
        let mut lines = match self.lines.lock() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        };
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub(crate) fn tail(&self) -> String {
        let lines = match self.lines.lock() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        };
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

pub(crate) struct HandleInner {
    pub(crate) key: SessionKey,
    pub(crate) pid: Option<u32>,
    pub(crate) started_at: Instant,
    pub(crate) started_wall: SystemTime,
    pub(crate) stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    pub(crate) status: watch::Receiver<ProcessStatus>,
}

/// Handle to a supervised transcoder
///
/// Cloning shares the same process. Only the supervisor signals it.
#[derive(Clone)]
pub struct ProcessHandle {
    pub(crate) inner: Arc<HandleInner>,
}

impl ProcessHandle {
    pub fn key(&self) -> SessionKey {
        self.inner.key
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn started_at(&self) -> Instant {
        self.inner.started_at
    }

    pub fn started_wall(&self) -> SystemTime {
        self.inner.started_wall
    }

    pub fn status(&self) -> ProcessStatus {
        self.inner.status.borrow().clone()
    }

    /// Receiver for status changes
    pub fn watch(&self) -> watch::Receiver<ProcessStatus> {
        self.inner.status.clone()
    }

    pub fn has_exited(&self) -> bool {
        matches!(*self.inner.status.borrow(), ProcessStatus::Exited(_))
    }

    /// Whether the stop request has been sent
    pub fn stop_requested(&self) -> bool {
        match self.inner.stop_tx.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }

    /// Running and not on its way out
    pub fn is_live(&self) -> bool {
        !self.has_exited() && !self.stop_requested()
    }

    /// Whether two handles refer to the same process
    pub fn same_process(&self, other: &ProcessHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Send the stop request; returns `false` if it was already sent
    pub(crate) fn request_stop(&self) -> bool {
        let sender = match self.inner.stop_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("key", &self.inner.key)
            .field("pid", &self.inner.pid)
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_keeps_tail() {
        let diag = Diagnostics::new(2);
        diag.push("one".into());
        diag.push("two".into());
        diag.push("three".into());

        assert_eq!(diag.tail(), "two\nthree");
    }

    #[test]
    fn test_exit_report_describe() {
        let report = ExitReport {
            code: Some(1),
            success: false,
            requested: false,
            diagnostic: "Connection refused".into(),
        };
        assert_eq!(
            report.describe(),
            "transcoder exited with code 1: Connection refused"
        );

        let signalled = ExitReport {
            code: None,
            success: false,
            requested: false,
            diagnostic: String::new(),
        };
        assert_eq!(signalled.describe(), "transcoder terminated by signal");
    }
}
