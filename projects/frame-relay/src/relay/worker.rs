// Worker handle: owns the external detection process and its stdio

use crate::error::{RelayError, Result};
use crate::relay::types::{FramePayload, WorkerState};
use clap::ValueEnum;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// How long the output readers may keep draining after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How stdout is cut into results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFraming {
    /// Every read from the pipe is one result. A chunk may hold a partial
    /// line or several lines; the worker is trusted to flush once per input.
    #[default]
    Chunk,
    /// Every newline-terminated line is one result.
    Line,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEventKind {
    /// Text read from stdout.
    Output(String),
    /// Text read from stderr. Observational only.
    Diagnostic(String),
    /// A line handed to the stdin writer could not be written.
    WriteFailed(String),
    /// The process terminated. Sent once stdout and stderr are drained, or
    /// after [`DRAIN_GRACE`] if a descendant still holds them open.
    Exited { code: Option<i32> },
}

/// Notification from a worker process, tagged with the start it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEvent {
    pub generation: u64,
    pub kind: WorkerEventKind,
}

pub type WorkerEvents = mpsc::UnboundedSender<WorkerEvent>;

/// Lifecycle and input side of a detection worker.
///
/// Output, diagnostics, write failures and exit are not polled: the worker
/// pushes them as [`WorkerEvent`]s into the sink given to [`Worker::start`].
pub trait Worker: Send + 'static {
    fn state(&self) -> WorkerState;

    /// Incremented on every successful start.
    fn generation(&self) -> u64;

    /// Launch the process. Returns as soon as it is spawned; there is no
    /// readiness handshake.
    fn start(&mut self, events: WorkerEvents) -> Result<()>;

    /// Hand one frame to the process's stdin without waiting for the write.
    fn submit(&mut self, payload: &FramePayload) -> Result<()>;

    /// Record that the current process has terminated.
    fn mark_exited(&mut self);

    /// Forcibly terminate the process.
    fn stop(&mut self);
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub framing: OutputFraming,
}

/// [`Worker`] backed by a child process speaking the line protocol on stdio.
pub struct ProcessWorker {
    config: WorkerConfig,
    state: WorkerState,
    generation: u64,
    pid: Option<u32>,
    input: Option<mpsc::Sender<String>>,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessWorker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            state: WorkerState::Unstarted,
            generation: 0,
            pid: None,
            input: None,
            kill: None,
        }
    }
}

impl Worker for ProcessWorker {
    fn state(&self) -> WorkerState {
        self.state
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn start(&mut self, events: WorkerEvents) -> Result<()> {
        if self.state == WorkerState::Running {
            warn!(
                pid = ?self.pid,
                "Starting a new worker while one is running; the old process will be killed"
            );
        }

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RelayError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(RelayError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(RelayError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(RelayError::MissingPipe("stderr"))?;

        self.generation += 1;
        let generation = self.generation;

        // One slot: at most one line is ever waiting for the pipe.
        let (input_tx, input_rx) = mpsc::channel::<String>(1);
        tokio::spawn(write_input(stdin, input_rx, generation, events.clone()));

        let stdout_task = tokio::spawn(read_stream(
            stdout,
            self.config.framing,
            WorkerEventKind::Output,
            generation,
            events.clone(),
        ));
        let stderr_task = tokio::spawn(read_stream(
            stderr,
            OutputFraming::Chunk,
            WorkerEventKind::Diagnostic,
            generation,
            events.clone(),
        ));

        let (kill_tx, kill_rx) = oneshot::channel();
        self.pid = child.id();
        tokio::spawn(monitor(
            child,
            kill_rx,
            [stdout_task, stderr_task],
            generation,
            events,
        ));

        self.input = Some(input_tx);
        self.kill = Some(kill_tx);
        self.state = WorkerState::Running;

        info!(
            program = %self.config.program,
            pid = ?self.pid,
            generation,
            "Started worker process"
        );
        Ok(())
    }

    fn submit(&mut self, payload: &FramePayload) -> Result<()> {
        if self.state != WorkerState::Running {
            return Err(RelayError::WorkerUnavailable(self.state));
        }
        let input = self.input.as_ref().ok_or(RelayError::InputClosed)?;

        input
            .try_send(payload.to_wire_line())
            .map_err(|e| match e {
                TrySendError::Full(_) => RelayError::InputBusy,
                TrySendError::Closed(_) => RelayError::InputClosed,
            })
    }

    fn mark_exited(&mut self) {
        self.state = WorkerState::Exited;
        self.pid = None;
        self.input = None;
        self.kill = None;
    }

    fn stop(&mut self) {
        if let Some(kill) = self.kill.take() {
            info!(pid = ?self.pid, "Stopping worker process");
            let _ = kill.send(());
        }
        self.input = None;
        if self.state == WorkerState::Running {
            self.state = WorkerState::Exited;
        }
    }
}

async fn write_input(
    mut stdin: ChildStdin,
    mut lines: mpsc::Receiver<String>,
    generation: u64,
    events: WorkerEvents,
) {
    while let Some(line) = lines.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            let _ = events.send(WorkerEvent {
                generation,
                kind: WorkerEventKind::WriteFailed(e.to_string()),
            });
            break;
        }
    }
    debug!(generation, "Worker stdin writer finished");
}

async fn read_stream<R>(
    reader: R,
    framing: OutputFraming,
    kind: fn(String) -> WorkerEventKind,
    generation: u64,
    events: WorkerEvents,
) where
    R: AsyncRead + Unpin,
{
    let emit = |text: String| {
        events
            .send(WorkerEvent {
                generation,
                kind: kind(text),
            })
            .is_ok()
    };

    match framing {
        OutputFraming::Chunk => {
            let mut reader = reader;
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if !emit(String::from_utf8_lossy(&buf[..n]).into_owned()) {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(generation, "Failed to read from worker: {}", e);
                        break;
                    }
                }
            }
        }
        OutputFraming::Line => {
            let mut reader = BufReader::new(reader);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line);
                        let text = text.trim_end_matches('\n').trim_end_matches('\r');
                        if !emit(text.to_string()) {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(generation, "Failed to read from worker: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

async fn monitor(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    readers: [JoinHandle<()>; 2],
    generation: u64,
    events: WorkerEvents,
) {
    // A dropped kill sender means the handle no longer owns this process.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.kill().await {
                warn!(generation, "Failed to kill worker process: {}", e);
            }
            child.wait().await
        }
    };

    // Deliver all output before the exit notification.
    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            warn!(
                generation,
                "Worker output still open after exit; abandoning the reader"
            );
            reader.abort();
        }
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(generation, "Failed to collect worker exit status: {}", e);
            None
        }
    };
    info!(generation, ?code, "Worker process exited");

    let _ = events.send(WorkerEvent {
        generation,
        kind: WorkerEventKind::Exited { code },
    });
}
