//! Transcoder supervision
//!
//! The supervisor owns every transcoder process. Each process gets a monitor
//! task that waits for it to exit (or for a stop request), an output task
//! that feeds the fan-out sink or watches for the segment index, and a
//! stderr task that keeps the diagnostic tail.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use bytes::BytesMut;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::config::{OutputTarget, TranscodeConfig};
use super::process::{
    ChildProcess, Diagnostics, ExitReport, HandleInner, Launcher, OutputPipe, ProcessHandle,
    ProcessStatus,
};
use crate::error::{Error, Result};
use crate::registry::SessionKey;
use crate::sink::FanoutSink;

/// Extra time after a forced kill before `stop` gives up waiting
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long the monitor waits for the stderr reader to drain after exit
const DIAGNOSTIC_DRAIN: Duration = Duration::from_millis(200);

type LiveMap = Arc<DashMap<SessionKey, ProcessHandle>>;

/// Starts, watches and stops transcoder processes
pub struct Supervisor {
    config: Arc<TranscodeConfig>,
    launcher: Arc<dyn Launcher>,
    sink: Arc<FanoutSink>,
    live: LiveMap,
}

impl Supervisor {
    pub fn new(config: TranscodeConfig, launcher: Arc<dyn Launcher>, sink: Arc<FanoutSink>) -> Self {
        Self {
            config: Arc::new(config),
            launcher,
            sink,
            live: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    pub fn sink(&self) -> &Arc<FanoutSink> {
        &self.sink
    }

    /// Start a transcoder for the session
    ///
    /// Returns the existing handle if a process for this key is still
    /// running and has not been asked to stop. A process that is still
    /// dying after a stop is replaced. Launch failures surface as
    /// [`Error::SourceUnavailable`].
    pub async fn start(&self, key: SessionKey, source_url: &str) -> Result<ProcessHandle> {
        if let Some(existing) = self.running(&key) {
            return Ok(existing);
        }

        let command = self.config.command(key, source_url);
        if let OutputTarget::Directory { dir, .. } = &command.output {
            prepare_segment_dir(dir).await.map_err(|err| Error::SourceUnavailable {
                camera: key.camera,
                diagnostic: format!("cannot prepare segment directory {}: {}", dir.display(), err),
            })?;
        }

        let slot = match self.live.entry(key) {
            Entry::Occupied(entry) if entry.get().is_live() => {
                return Ok(entry.get().clone());
            }
            Entry::Occupied(entry) => {
                let (_, stale) = entry.remove_entry();
                if !stale.has_exited() {
                    tracing::warn!(
                        session = %key,
                        pid = ?stale.pid(),
                        "Replacing a transcoder that has not exited"
                    );
                }
                self.live.entry(key)
            }
            vacant => vacant,
        };

        let mut child = self
            .launcher
            .launch(&command)
            .map_err(|err| Error::SourceUnavailable {
                camera: key.camera,
                diagnostic: format!("failed to launch {}: {}", command.program.display(), err),
            })?;

        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
        let status_tx = Arc::new(status_tx);
        let (stop_tx, stop_rx) = oneshot::channel();

        let handle = ProcessHandle {
            inner: Arc::new(HandleInner {
                key,
                pid: child.id(),
                started_at: Instant::now(),
                started_wall: SystemTime::now(),
                stop_tx: Mutex::new(Some(stop_tx)),
                status: status_rx,
            }),
        };
        slot.insert(handle.clone());

        tracing::info!(
            session = %key,
            pid = ?handle.pid(),
            program = %command.program.display(),
            "Transcoder started"
        );

        let diagnostics = Arc::new(Diagnostics::new(self.config.diagnostic_lines));
        let stderr_task = child
            .take_stderr()
            .map(|pipe| tokio::spawn(read_diagnostics(key, pipe, Arc::clone(&diagnostics))));

        let output_task = match &command.output {
            OutputTarget::Stdout => child.take_stdout().map(|pipe| {
                tokio::spawn(read_output(
                    key,
                    pipe,
                    Arc::clone(&self.sink),
                    Arc::clone(&status_tx),
                    self.config.read_chunk_size,
                ))
            }),
            OutputTarget::Directory { index, .. } => Some(tokio::spawn(watch_index(
                index.clone(),
                self.config.index_poll_interval,
                Arc::clone(&status_tx),
            ))),
        };

        let segment_dir = match &command.output {
            OutputTarget::Directory { dir, .. } if self.config.remove_segments_on_stop => {
                Some(dir.clone())
            }
            _ => None,
        };

        tokio::spawn(monitor(Monitor {
            key,
            child,
            stop_rx,
            status_tx,
            diagnostics,
            stderr_task,
            output_task,
            stop_timeout: self.config.stop_timeout,
            live: Arc::clone(&self.live),
            handle: Arc::downgrade(&handle.inner),
            segment_dir,
        }));

        Ok(handle)
    }

    /// Stop a transcoder and wait (bounded) for it to exit
    ///
    /// Sends the stop request, gives the process `stop_timeout` to exit and
    /// kills it after that.
    pub async fn stop(&self, handle: &ProcessHandle) -> ExitReport {
        let key = handle.key();
        if handle.request_stop() {
            tracing::debug!(session = %key, "Stop requested");
        }

        let mut status = handle.watch();
        let bound = self.config.stop_timeout + KILL_GRACE;
        let waited = timeout(bound, async {
            status
                .wait_for(|s| matches!(s, ProcessStatus::Exited(_)))
                .await
                .map(|s| s.clone())
        })
        .await;

        match waited {
            Ok(Ok(ProcessStatus::Exited(report))) => report,
            Ok(_) => ExitReport {
                code: None,
                success: false,
                requested: true,
                diagnostic: "monitor ended without an exit status".to_string(),
            },
            Err(_) => {
                tracing::error!(session = %key, timeout = ?bound, "Transcoder did not exit");
                ExitReport {
                    code: None,
                    success: false,
                    requested: true,
                    diagnostic: format!("did not exit within {:?}", bound),
                }
            }
        }
    }

    /// Stop every running transcoder
    pub async fn stop_all(&self) {
        let handles: Vec<ProcessHandle> = self.live.iter().map(|e| e.value().clone()).collect();
        futures::future::join_all(handles.iter().map(|h| self.stop(h))).await;
    }

    /// Handle of the running process for a key
    pub fn running(&self, key: &SessionKey) -> Option<ProcessHandle> {
        self.live
            .get(key)
            .filter(|h| h.is_live())
            .map(|h| h.value().clone())
    }

    pub fn is_running(&self, key: &SessionKey) -> bool {
        self.running(key).is_some()
    }

    /// Number of processes that are running and not stopping
    pub fn running_count(&self) -> usize {
        self.live.iter().filter(|h| h.is_live()).count()
    }
}

/// Clear out stale segments and create the directory
async fn prepare_segment_dir(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    tokio::fs::create_dir_all(dir).await
}

fn mark_producing(status: &watch::Sender<ProcessStatus>) -> bool {
    status.send_if_modified(|s| {
        if *s == ProcessStatus::Running {
            *s = ProcessStatus::Producing;
            true
        } else {
            false
        }
    })
}

async fn read_output(
    key: SessionKey,
    mut pipe: OutputPipe,
    sink: Arc<FanoutSink>,
    status: Arc<watch::Sender<ProcessStatus>>,
    chunk_size: usize,
) {
    let mut buf = BytesMut::with_capacity(chunk_size);
    loop {
        buf.reserve(chunk_size);
        match pipe.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = buf.split().freeze();
                if mark_producing(&status) {
                    tracing::info!(session = %key, "First output received");
                }
                sink.on_chunk(&key, chunk);
            }
            Err(err) => {
                tracing::warn!(session = %key, error = %err, "Output read failed");
                break;
            }
        }
    }
    tracing::debug!(session = %key, "Output closed");
}

async fn watch_index(index: PathBuf, interval: Duration, status: Arc<watch::Sender<ProcessStatus>>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if matches!(*status.borrow(), ProcessStatus::Exited(_)) {
            return;
        }
        if let Ok(true) = tokio::fs::try_exists(&index).await {
            if mark_producing(&status) {
                tracing::info!(index = %index.display(), "Segment index written");
            }
            return;
        }
    }
}

async fn read_diagnostics(key: SessionKey, pipe: OutputPipe, diagnostics: Arc<Diagnostics>) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(session = %key, "{}", line);
                diagnostics.push(line);
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(session = %key, error = %err, "Stderr read failed");
                break;
            }
        }
    }
}

struct Monitor {
    key: SessionKey,
    child: Box<dyn ChildProcess>,
    stop_rx: oneshot::Receiver<()>,
    status_tx: Arc<watch::Sender<ProcessStatus>>,
    diagnostics: Arc<Diagnostics>,
    stderr_task: Option<JoinHandle<()>>,
    output_task: Option<JoinHandle<()>>,
    stop_timeout: Duration,
    live: LiveMap,
    handle: Weak<HandleInner>,
    segment_dir: Option<PathBuf>,
}

async fn monitor(m: Monitor) {
    let Monitor {
        key,
        mut child,
        stop_rx,
        status_tx,
        diagnostics,
        stderr_task,
        output_task,
        stop_timeout,
        live,
        handle,
        segment_dir,
    } = m;

    // A dropped stop sender counts as a stop request
    let exited = tokio::select! {
        res = child.wait() => Some(res),
        _ = stop_rx => None,
    };

    let requested = exited.is_none();
    let result = match exited {
        Some(res) => res,
        None => terminate(child.as_mut(), stop_timeout, &key).await,
    };

    if let Some(task) = stderr_task {
        let _ = timeout(DIAGNOSTIC_DRAIN, task).await;
    }
    if let Some(task) = output_task {
        task.abort();
    }

    let mut report = match result {
        Ok(report) => report,
        Err(err) => ExitReport {
            code: None,
            success: false,
            requested,
            diagnostic: format!("wait failed: {}", err),
        },
    };
    report.requested = requested;
    let tail = diagnostics.tail();
    if !tail.is_empty() {
        report.diagnostic = tail;
    }

    if requested {
        tracing::info!(session = %key, code = ?report.code, "Transcoder stopped");
    } else {
        tracing::warn!(
            session = %key,
            code = ?report.code,
            diagnostic = %report.diagnostic,
            "Transcoder exited"
        );
    }

    live.remove_if(&key, |_, h| std::ptr::eq(Arc::as_ptr(&h.inner), handle.as_ptr()));

    if let Some(dir) = segment_dir {
        if !live.contains_key(&key) {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => tracing::debug!(dir = %dir.display(), "Segment directory removed"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), error = %err, "Segment cleanup failed")
                }
            }
        }
    }

    status_tx.send_replace(ProcessStatus::Exited(report));
}

/// Graceful stop, then kill after `grace`
async fn terminate(
    child: &mut dyn ChildProcess,
    grace: Duration,
    key: &SessionKey,
) -> io::Result<ExitReport> {
    let graceful = timeout(grace, async {
        if let Err(err) = child.request_stop().await {
            tracing::debug!(session = %key, error = %err, "Stop request failed");
        }
        child.wait().await
    })
    .await;

    match graceful {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(session = %key, grace = ?grace, "Transcoder ignored stop request, killing");
            child.start_kill()?;
            child.wait().await
        }
    }
}
