//! Subprocess abstraction shared by the device monitor and the task orchestrator.
//!
//! A [`ProcessRunner`] turns a [`CommandSpec`] into a [`ProcessHandle`]. The handle is a
//! bundle of channels: merged output lines and finally the exit code flow out, while
//! termination signals flow in. The producing side of those channels is a [`ProcessDriver`];
//! [`TokioProcessRunner`] drives it from a real child process, tests drive it by hand.

use camino::Utf8PathBuf;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

/// How long buffered output is still forwarded after the process exited
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur while running an external tool
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Process I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process supervisor stopped without reporting an exit status")]
    Lost,
}

/// A program and its argument vector. Never passed through a shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<Utf8PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Arguments safe to log: the value after `--apikey` is masked.
    pub fn display_args(&self) -> Vec<String> {
        let mut masked = Vec::with_capacity(self.args.len());
        let mut hide_next = false;
        for arg in &self.args {
            if hide_next {
                masked.push(crate::models::mask_secret(arg));
                hide_next = false;
            } else {
                hide_next = arg == "--apikey";
                masked.push(arg.clone());
            }
        }
        masked
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in self.display_args() {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Requests sent from a [`ProcessController`] to whoever drives the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Ask the process to exit (SIGTERM on Unix)
    Terminate,
    /// Force the process down
    Kill,
}

type ExitResult = Result<Option<i32>, ProcessError>;

/// Consumer side of a running process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    output_rx: mpsc::UnboundedReceiver<String>,
    exit_rx: oneshot::Receiver<ExitResult>,
    control_tx: mpsc::UnboundedSender<ProcessSignal>,
}

/// Producer side of a [`ProcessHandle`].
#[derive(Debug)]
pub struct ProcessDriver {
    output_tx: mpsc::UnboundedSender<String>,
    exit_tx: oneshot::Sender<ExitResult>,
    control_rx: mpsc::UnboundedReceiver<ProcessSignal>,
}

/// Clonable handle for signalling a process from another task.
#[derive(Debug, Clone)]
pub struct ProcessController {
    control_tx: mpsc::UnboundedSender<ProcessSignal>,
}

impl ProcessHandle {
    /// Create a connected handle/driver pair.
    pub fn channel(pid: Option<u32>) -> (ProcessHandle, ProcessDriver) {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            ProcessHandle {
                pid,
                output_rx,
                exit_rx,
                control_tx,
            },
            ProcessDriver {
                output_tx,
                exit_tx,
                control_rx,
            },
        )
    }

    /// A handle for a process that already printed `lines` and exited with `exit_code`.
    pub fn completed<I, S>(lines: I, exit_code: Option<i32>) -> ProcessHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (handle, driver) = Self::channel(None);
        for line in lines {
            driver.send_line(line);
        }
        driver.exit(exit_code);
        handle
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn controller(&self) -> ProcessController {
        ProcessController {
            control_tx: self.control_tx.clone(),
        }
    }

    /// Next merged output line, in emission order. `None` once all output was delivered.
    pub async fn next_line(&mut self) -> Option<String> {
        self.output_rx.recv().await
    }

    /// Wait for the exit code. `Ok(None)` means the process was killed by a signal.
    pub async fn wait(self) -> ExitResult {
        self.exit_rx.await.unwrap_or(Err(ProcessError::Lost))
    }
}

impl ProcessDriver {
    /// Forward one output line. Returns false if nobody is listening anymore.
    pub fn send_line(&self, line: impl Into<String>) -> bool {
        self.output_tx.send(line.into()).is_ok()
    }

    /// Next signal from a controller; `None` once every controller is gone.
    pub async fn recv_signal(&mut self) -> Option<ProcessSignal> {
        self.control_rx.recv().await
    }

    pub fn try_recv_signal(&mut self) -> Option<ProcessSignal> {
        self.control_rx.try_recv().ok()
    }

    /// Close the output stream, then report the exit code.
    pub fn exit(self, exit_code: Option<i32>) {
        self.finish(Ok(exit_code));
    }

    /// Close the output stream, then report a failure.
    pub fn fail(self, error: ProcessError) {
        self.finish(Err(error));
    }

    fn finish(self, result: ExitResult) {
        let Self {
            output_tx, exit_tx, ..
        } = self;
        drop(output_tx);
        let _ = exit_tx.send(result);
    }
}

impl ProcessController {
    /// Request graceful termination. Returns false if the process is already gone.
    pub fn terminate(&self) -> bool {
        self.control_tx.send(ProcessSignal::Terminate).is_ok()
    }

    /// Force the process down. Returns false if the process is already gone.
    pub fn kill(&self) -> bool {
        self.control_tx.send(ProcessSignal::Kill).is_ok()
    }
}

/// Something that can start external programs.
///
/// `spawn` must not block; the returned handle reports output and exit asynchronously.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, spec: &CommandSpec) -> Result<ProcessHandle, ProcessError>;
}

/// Captured result of [`run_to_completion`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub lines: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Run a short-lived tool and collect everything it prints.
///
/// The process is killed and [`ProcessError::Timeout`] returned if it does not finish
/// within `limit`.
pub async fn run_to_completion(
    runner: &dyn ProcessRunner,
    spec: &CommandSpec,
    limit: Duration,
) -> Result<CommandOutput, ProcessError> {
    tracing::debug!("Running: {}", spec);

    let mut handle = runner.spawn(spec)?;
    let controller = handle.controller();

    let collect = async move {
        let mut lines = Vec::new();
        while let Some(line) = handle.next_line().await {
            lines.push(line);
        }
        let exit_code = handle.wait().await?;
        Ok(CommandOutput { exit_code, lines })
    };

    match timeout(limit, collect).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("{} timed out after {:?}, killing it", spec.program, limit);
            controller.kill();
            Err(ProcessError::Timeout(limit))
        }
    }
}

/// [`ProcessRunner`] backed by `tokio::process`.
///
/// stdout and stderr share one OS pipe, so lines arrive in the order the child wrote them.
#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    drain_timeout: Duration,
}

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for TokioProcessRunner {
    fn spawn(&self, spec: &CommandSpec) -> Result<ProcessHandle, ProcessError> {
        let spawn_err = |source: io::Error| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        };

        if let Some(dir) = &spec.current_dir {
            if !dir.is_dir() {
                return Err(spawn_err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("working directory {} does not exist", dir),
                )));
            }
        }

        let (reader, writer) = io::pipe().map_err(spawn_err)?;
        let writer_err = writer.try_clone().map_err(spawn_err)?;

        // The Command owns our copies of the pipe's write end; it has to be dropped
        // right after spawning or the reader never sees EOF.
        let child = {
            let mut cmd = Command::new(&spec.program);
            cmd.args(&spec.args)
                .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::null())
                .stdout(Stdio::from(writer))
                .stderr(Stdio::from(writer_err))
                .kill_on_drop(true);
            if let Some(dir) = &spec.current_dir {
                cmd.current_dir(dir);
            }
            cmd.spawn().map_err(|source| {
                if source.kind() == io::ErrorKind::NotFound {
                    ProcessError::NotFound(spec.program.clone())
                } else {
                    spawn_err(source)
                }
            })?
        };

        let pid = child.id();
        tracing::debug!("Spawned {} (pid {:?})", spec, pid);

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("process-output".to_string())
            .spawn(move || read_lines(reader, line_tx))
            .map_err(spawn_err)?;

        let (handle, driver) = ProcessHandle::channel(pid);
        tokio::spawn(supervise(child, line_rx, driver, self.drain_timeout));

        Ok(handle)
    }
}

/// Blocking reader: split the merged pipe into lines, decoding lossily as UTF-8.
fn read_lines<R: Read>(reader: R, line_tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if line_tx.send(decode_line(&buf)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("Error reading process output: {}", e);
                break;
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    while end > 0 && (raw[end - 1] == b'\n' || raw[end - 1] == b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Owns the child: forwards output, applies signals, reports the exit.
async fn supervise(
    mut child: Child,
    mut line_rx: mpsc::UnboundedReceiver<String>,
    mut driver: ProcessDriver,
    drain_timeout: Duration,
) {
    let mut output_done = false;
    let mut signals_open = true;

    let status = loop {
        tokio::select! {
            line = line_rx.recv(), if !output_done => match line {
                Some(line) => {
                    driver.send_line(line);
                }
                None => output_done = true,
            },
            status = child.wait() => break status,
            signal = driver.recv_signal(), if signals_open => match signal {
                Some(ProcessSignal::Terminate) => {
                    if let Err(e) = send_terminate(&mut child) {
                        tracing::warn!("Failed to terminate process: {}", e);
                    }
                }
                Some(ProcessSignal::Kill) => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!("Failed to kill process: {}", e);
                    }
                }
                None => signals_open = false,
            },
        }
    };

    if !output_done {
        let drain = async {
            while let Some(line) = line_rx.recv().await {
                driver.send_line(line);
            }
        };
        if timeout(drain_timeout, drain).await.is_err() {
            tracing::warn!(
                "Output pipe still open {:?} after exit, dropping the rest",
                drain_timeout
            );
        }
    }

    match status {
        Ok(status) => {
            tracing::debug!("Process exited: {}", status);
            driver.exit(status.code());
        }
        Err(e) => driver.fail(ProcessError::Io(e)),
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from),
        // Already reaped
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}
