//! Worker lifecycle and request I/O.
//!
//! A [`Worker`] owns one interpreter child process and serializes exactly one
//! request at a time onto its stdin, reading the reply from its stdout. The
//! worker tracks its own liveness: a broken pipe, a timeout, a protocol
//! violation or reaching the configured request budget marks it *dead*, and a
//! dead worker is a lazy-respawn slot, not a tombstone. It is restarted on
//! next use, never eagerly.
//!
//! # Locking
//!
//! Three concerns, three guards:
//!
//! - the I/O mutex (`io`) serializes the write-then-read of one request and
//!   is the only lock held across a restart
//! - the `dead` flag has its own read-write lock
//! - `state` and the in-flight counter share one read-write lock so the
//!   completion transition (in-flight hits zero while draining) is atomic
//!
//! The request counter is a plain atomic.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use framegate_common::framing::{read_frame, write_frame};
use framegate_common::{GateError, RequestPayload, ResponsePayload, Result, StreamFrame};

use crate::sink::StreamSink;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Alive, no request in flight.
    Idle,
    /// A request is in flight.
    Busy,
    /// Admission closed; becomes `Dead` once in-flight work completes.
    Draining,
    /// Unusable until restarted. Restarting is lazy, on next use.
    Dead,
}

/// Configuration for spawning workers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interpreter binary, e.g. `php`.
    pub program: String,
    /// Arguments placed before the entry script.
    pub args: Vec<String>,
    /// Entry script, relative to the project root. `None` runs the program
    /// bare, which is mostly useful for tests.
    pub entry: Option<PathBuf>,
    /// File whose presence marks the project root while walking up from the
    /// current directory. Falls back to the current directory if never found.
    pub root_marker: String,
    /// Requests served before the worker is recycled. 0 disables the budget.
    pub max_requests: u64,
    /// Deadline for one request or one whole stream. Zero waits forever.
    pub request_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "php".to_string(),
            args: Vec::new(),
            entry: Some(PathBuf::from("php/worker.php")),
            root_marker: "composer.json".to_string(),
            max_requests: 0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// The spawned child and its framing pipes.
struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

struct Lifecycle {
    state: WorkerState,
    in_flight: u32,
}

/// One interpreter subprocess.
pub struct Worker {
    config: WorkerConfig,
    base_dir: PathBuf,
    /// Serializes request I/O. `None` only for workers that have never been
    /// spawned or whose process was taken on a timeout kill.
    io: Mutex<Option<WorkerProcess>>,
    dead: RwLock<bool>,
    lifecycle: RwLock<Lifecycle>,
    request_count: AtomicU64,
}

impl Worker {
    /// Locates the project root and starts the interpreter there.
    ///
    /// The child's stdin/stdout become the framing pipes; stderr is drained
    /// into the log stream by a background task.
    pub fn spawn(config: WorkerConfig) -> Result<Self> {
        let base_dir = project_root(&config.root_marker);
        let process = spawn_process(&config, &base_dir)?;

        Ok(Self {
            config,
            base_dir,
            io: Mutex::new(Some(process)),
            dead: RwLock::new(false),
            lifecycle: RwLock::new(Lifecycle {
                state: WorkerState::Idle,
                in_flight: 0,
            }),
            request_count: AtomicU64::new(0),
        })
    }

    /// A worker with no process attached. State helpers behave normally;
    /// any request I/O fails.
    #[cfg(test)]
    pub(crate) fn detached(config: WorkerConfig) -> Self {
        Self {
            config,
            base_dir: PathBuf::from("."),
            io: Mutex::new(None),
            dead: RwLock::new(false),
            lifecycle: RwLock::new(Lifecycle {
                state: WorkerState::Idle,
                in_flight: 0,
            }),
            request_count: AtomicU64::new(0),
        }
    }

    pub fn is_dead(&self) -> bool {
        *self.dead.read()
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.read().state
    }

    pub fn is_draining(&self) -> bool {
        self.state() == WorkerState::Draining
    }

    /// Requests served since the last restart.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_dead(&self) {
        *self.dead.write() = true;
        self.lifecycle.write().state = WorkerState::Dead;
    }

    /// Closes admission. Never overwrites `Dead`.
    pub(crate) fn start_draining(&self) {
        let mut lc = self.lifecycle.write();
        if lc.state != WorkerState::Dead {
            lc.state = WorkerState::Draining;
        }
    }

    fn begin_request(&self) {
        let mut lc = self.lifecycle.write();
        lc.in_flight += 1;
        lc.state = WorkerState::Busy;
    }

    /// Completion transition. The in-flight decrement and the
    /// draining-to-dead election happen in one critical section so two
    /// concurrent completions cannot both observe zero.
    fn finish_request(&self) {
        let mut lc = self.lifecycle.write();
        if lc.in_flight > 0 {
            lc.in_flight -= 1;
        }
        if lc.in_flight == 0 && lc.state == WorkerState::Draining {
            lc.state = WorkerState::Dead;
            drop(lc);
            *self.dead.write() = true;
        } else if lc.in_flight == 0 && lc.state == WorkerState::Busy && !self.is_dead() {
            lc.state = WorkerState::Idle;
        }
    }

    /// Restarts the worker if it is dead. Used by the pool to revive a dead
    /// slot before dispatching to it.
    pub async fn revive(&self) -> Result<()> {
        let mut io = self.io.lock().await;
        if self.is_dead() {
            self.restart_locked(&mut io).await?;
        }
        Ok(())
    }

    /// Kills and reaps any current process, spawns a fresh one, and resets
    /// liveness, state and the request counter. Caller holds the I/O mutex.
    async fn restart_locked(&self, io: &mut Option<WorkerProcess>) -> Result<()> {
        if let Some(mut old) = io.take() {
            let _ = old.child.start_kill();
            let _ = old.child.wait().await;
        }

        *io = Some(spawn_process(&self.config, &self.base_dir)?);

        *self.dead.write() = false;
        {
            let mut lc = self.lifecycle.write();
            lc.state = WorkerState::Idle;
            lc.in_flight = 0;
        }
        self.request_count.store(0, Ordering::Relaxed);

        info!(dir = %self.base_dir.display(), "restarted worker");
        Ok(())
    }

    /// Sends one request and awaits the single response frame.
    ///
    /// Broken-pipe-class failures mark the worker dead and are retried once;
    /// the retry restarts the process first. A second failure surfaces as an
    /// unexpected end of stream. Timeouts kill the process and are not
    /// retried.
    pub async fn handle(&self, payload: &RequestPayload) -> Result<ResponsePayload> {
        if self.is_dead() {
            return Err(GateError::WorkerDead);
        }
        if self.is_draining() {
            return Err(GateError::WorkerDraining);
        }

        self.begin_request();
        let result = self.handle_inner(payload).await;
        self.finish_request();
        result
    }

    async fn handle_inner(&self, payload: &RequestPayload) -> Result<ResponsePayload> {
        for _attempt in 0..2 {
            match self.exchange(payload).await {
                Ok(resp) => {
                    let served = self.request_count.fetch_add(1, Ordering::Relaxed) + 1;
                    if self.config.max_requests > 0 && served >= self.config.max_requests {
                        debug!(served, "worker reached its request budget, recycling");
                        self.mark_dead();
                    }
                    return Ok(resp);
                }
                Err(err) if err.is_broken_pipe() => {
                    warn!(error = %err, "worker pipe broke, will restart and retry");
                    self.mark_dead();
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(GateError::UnexpectedEof)
    }

    /// One write-then-read exchange under the I/O mutex. A worker found dead
    /// here (marked by a previous attempt) is restarted first.
    async fn exchange(&self, payload: &RequestPayload) -> Result<ResponsePayload> {
        let mut io = self.io.lock().await;
        if self.is_dead() {
            self.restart_locked(&mut io).await?;
        }
        let process = io.as_mut().ok_or(GateError::WorkerDead)?;

        let encoded = serde_json::to_vec(payload)?;
        let fut = async {
            write_frame(&mut process.stdin, &encoded).await?;
            let raw = read_frame(&mut process.stdout).await?;
            Ok::<ResponsePayload, GateError>(serde_json::from_slice(&raw)?)
        };

        if self.config.request_timeout.is_zero() {
            return fut.await;
        }

        let result = tokio::time::timeout(self.config.request_timeout, fut).await;
        match result {
            Ok(result) => result,
            Err(_) => {
                self.mark_dead();
                if let Some(mut process) = io.take() {
                    let _ = process.child.start_kill();
                    let _ = process.child.wait().await;
                }
                Err(GateError::Timeout(self.config.request_timeout))
            }
        }
    }

    /// Sends one request and relays the worker's stream frames into `sink`
    /// until an `end` or `error` frame. The configured timeout bounds the
    /// whole stream.
    pub async fn stream(&self, payload: &RequestPayload, sink: &mut dyn StreamSink) -> Result<()> {
        if self.is_dead() {
            return Err(GateError::WorkerDead);
        }
        if self.is_draining() {
            return Err(GateError::WorkerDraining);
        }

        self.begin_request();
        let result = self.stream_inner(payload, sink).await;
        self.finish_request();
        result
    }

    async fn stream_inner(&self, payload: &RequestPayload, sink: &mut dyn StreamSink) -> Result<()> {
        let mut io = self.io.lock().await;
        if self.is_dead() {
            self.restart_locked(&mut io).await?;
        }
        let process = io.as_mut().ok_or(GateError::WorkerDead)?;

        let encoded = serde_json::to_vec(payload)?;
        let fut = async {
            write_frame(&mut process.stdin, &encoded).await?;
            self.relay(&mut process.stdout, sink).await
        };

        if self.config.request_timeout.is_zero() {
            return fut.await;
        }

        let result = tokio::time::timeout(self.config.request_timeout, fut).await;
        match result {
            Ok(result) => result,
            Err(_) => {
                self.mark_dead();
                if let Some(mut process) = io.take() {
                    let _ = process.child.start_kill();
                    let _ = process.child.wait().await;
                }
                Err(GateError::Timeout(self.config.request_timeout))
            }
        }
    }

    /// Reads stream frames and pushes them into the sink.
    ///
    /// Header emission rules: Set-Cookie values go out as separate header
    /// lines, any other multi-valued header is joined with `", "`, a missing
    /// status means 200, and a `chunk` arriving before `headers` gets a
    /// synthesized 200 header block. A second `headers` frame, an unknown
    /// frame type and any framing failure mark the worker dead.
    async fn relay<R>(&self, reader: &mut R, sink: &mut dyn StreamSink) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut headers_sent = false;

        loop {
            let raw = match read_frame(reader).await {
                Ok(raw) => raw,
                Err(err) => {
                    self.mark_dead();
                    return Err(err);
                }
            };

            let frame: StreamFrame = match serde_json::from_slice(&raw) {
                Ok(frame) => frame,
                Err(err) => {
                    self.mark_dead();
                    return Err(GateError::Protocol(format!("bad stream frame: {err}")));
                }
            };

            match frame {
                StreamFrame::Headers {
                    status,
                    headers,
                    data,
                } => {
                    if headers_sent {
                        self.mark_dead();
                        return Err(GateError::Protocol("duplicate headers frame".to_string()));
                    }

                    let mut out = Vec::new();
                    if let Some(headers) = headers {
                        for (name, values) in headers {
                            if values.is_empty() {
                                continue;
                            }
                            if name.eq_ignore_ascii_case("set-cookie") {
                                // Cookie values must not be joined.
                                for value in values {
                                    out.push((name.clone(), value));
                                }
                            } else {
                                out.push((name, values.join(", ")));
                            }
                        }
                    }

                    let status = match status {
                        Some(s) if s != 0 => s,
                        _ => 200,
                    };
                    sink.send_headers(status, out)?;
                    headers_sent = true;

                    if let Some(data) = data {
                        if !data.is_empty() {
                            sink.send_data(data.as_bytes())?;
                        }
                    }
                }

                StreamFrame::Chunk { data } => {
                    if !headers_sent {
                        sink.send_headers(200, Vec::new())?;
                        headers_sent = true;
                    }
                    if let Some(data) = data {
                        if !data.is_empty() {
                            sink.send_data(data.as_bytes())?;
                        }
                    }
                }

                StreamFrame::End => return Ok(()),

                StreamFrame::Error { error } => {
                    return Err(GateError::Stream(error.unwrap_or_default()));
                }
            }
        }
    }
}

/// Walks parent directories from the current working directory until one
/// contains `marker`. Falls back to the starting directory.
pub fn project_root(marker: &str) -> PathBuf {
    let start = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    let mut dir = start.clone();
    loop {
        if dir.join(marker).exists() {
            return dir;
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => return start,
        }
    }
}

fn spawn_process(config: &WorkerConfig, base_dir: &Path) -> Result<WorkerProcess> {
    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args);
    if let Some(entry) = &config.entry {
        cmd.arg(base_dir.join(entry));
    }
    cmd.current_dir(base_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("worker stdin was not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("worker stdout was not captured"))?;

    if let Some(stderr) = child.stderr.take() {
        let program = config.program.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(worker = %program, "{}", line);
            }
        });
    }

    debug!(program = %config.program, dir = %base_dir.display(), "spawned worker");

    Ok(WorkerProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}
