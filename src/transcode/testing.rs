//! In-memory launcher for tests

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use super::config::{OutputTarget, TranscodeCommand};
use super::process::{ChildProcess, ExitReport, Launcher, OutputPipe};
use crate::registry::SessionKey;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct Shared {
    stdout: tokio::sync::Mutex<Option<DuplexStream>>,
    stderr: tokio::sync::Mutex<Option<DuplexStream>>,
    stop_requests: AtomicUsize,
    kills: AtomicUsize,
}

/// Test-side control of one fake process
#[derive(Clone)]
pub(crate) struct FakeProcess {
    pub key: SessionKey,
    pub args: Vec<String>,
    output: OutputTarget,
    exit_tx: mpsc::UnboundedSender<Option<i32>>,
    shared: Arc<Shared>,
}

impl FakeProcess {
    /// Write bytes to the process's stdout
    pub async fn emit(&self, data: &[u8]) {
        if let Some(pipe) = self.shared.stdout.lock().await.as_mut() {
            let _ = pipe.write_all(data).await;
        }
    }

    /// Write a stderr line
    pub async fn log(&self, line: &str) {
        if let Some(pipe) = self.shared.stderr.lock().await.as_mut() {
            let _ = pipe.write_all(format!("{line}\n").as_bytes()).await;
        }
    }

    /// Create the segment index of a segmented process
    pub async fn write_index(&self) {
        if let OutputTarget::Directory { index, .. } = &self.output {
            tokio::fs::write(index, b"#EXTM3U\n").await.unwrap();
        }
    }

    /// Write a segment file and list it in the index
    pub async fn write_segment(&self, name: &str, data: &[u8]) {
        if let OutputTarget::Directory { dir, index } = &self.output {
            tokio::fs::write(dir.join(name), data).await.unwrap();
            let mut playlist = tokio::fs::read_to_string(index)
                .await
                .unwrap_or_else(|_| "#EXTM3U\n#EXT-X-TARGETDURATION:2\n".to_string());
            playlist.push_str(&format!("#EXTINF:2.000,\n{name}\n"));
            // Readers never see a half-written index
            let staged = dir.join("index.m3u8.tmp");
            tokio::fs::write(&staged, playlist).await.unwrap();
            tokio::fs::rename(&staged, index).await.unwrap();
        }
    }

    /// Make the process exit with a code
    pub fn exit(&self, code: i32) {
        let _ = self.exit_tx.send(Some(code));
    }

    pub fn stop_requests(&self) -> usize {
        self.shared.stop_requests.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.shared.kills.load(Ordering::SeqCst)
    }
}

/// Launcher whose processes are driven by the test
#[derive(Default)]
pub(crate) struct FakeLauncher {
    processes: Mutex<Vec<FakeProcess>>,
    fail_next: AtomicBool,
    ignore_stop: AtomicBool,
    ignore_kill: AtomicBool,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next launch fail as if the binary were missing
    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Processes launched from now on only exit when killed
    pub fn ignore_stop_requests(&self) {
        self.ignore_stop.store(true, Ordering::SeqCst);
    }

    /// Processes launched from now on never exit, even when killed
    pub fn ignore_kills(&self) {
        self.ignore_kill.store(true, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<FakeProcess> {
        self.processes.lock().unwrap().last().cloned()
    }

    pub fn process(&self, index: usize) -> Option<FakeProcess> {
        self.processes.lock().unwrap().get(index).cloned()
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, command: &TranscodeCommand) -> io::Result<Box<dyn ChildProcess>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "No such file or directory",
            ));
        }

        let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            stdout: tokio::sync::Mutex::new(Some(stdout_writer)),
            stderr: tokio::sync::Mutex::new(Some(stderr_writer)),
            ..Default::default()
        });

        let stdout = match command.output {
            OutputTarget::Stdout => Some(stdout_reader),
            OutputTarget::Directory { .. } => None,
        };

        self.processes.lock().unwrap().push(FakeProcess {
            key: command.key,
            args: command.args.clone(),
            output: command.output.clone(),
            exit_tx: exit_tx.clone(),
            shared: Arc::clone(&shared),
        });

        Ok(Box::new(FakeChild {
            stdout,
            stderr: Some(stderr_reader),
            exit_tx,
            exit_rx,
            shared,
            obey_stop: !self.ignore_stop.load(Ordering::SeqCst),
            obey_kill: !self.ignore_kill.load(Ordering::SeqCst),
            report: None,
        }))
    }
}

struct FakeChild {
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    exit_tx: mpsc::UnboundedSender<Option<i32>>,
    exit_rx: mpsc::UnboundedReceiver<Option<i32>>,
    shared: Arc<Shared>,
    obey_stop: bool,
    obey_kill: bool,
    report: Option<ExitReport>,
}

#[async_trait]
impl ChildProcess for FakeChild {
    fn id(&self) -> Option<u32> {
        None
    }

    fn take_stdout(&mut self) -> Option<OutputPipe> {
        self.stdout.take().map(|p| Box::new(p) as OutputPipe)
    }

    fn take_stderr(&mut self) -> Option<OutputPipe> {
        self.stderr.take().map(|p| Box::new(p) as OutputPipe)
    }

    async fn request_stop(&mut self) -> io::Result<()> {
        self.shared.stop_requests.fetch_add(1, Ordering::SeqCst);
        if self.obey_stop {
            let _ = self.exit_tx.send(Some(0));
        }
        Ok(())
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.shared.kills.fetch_add(1, Ordering::SeqCst);
        if self.obey_kill {
            let _ = self.exit_tx.send(None);
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<ExitReport> {
        if let Some(report) = &self.report {
            return Ok(report.clone());
        }

        let code = self.exit_rx.recv().await.flatten();
        self.shared.stdout.lock().await.take();
        self.shared.stderr.lock().await.take();

        let report = ExitReport {
            code,
            success: code == Some(0),
            requested: false,
            diagnostic: String::new(),
        };
        self.report = Some(report.clone());
        Ok(report)
    }
}
