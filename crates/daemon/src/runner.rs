//! Command runner module for autotranscode
//!
//! Runs one shell command per job in its own process group, streams its
//! output into the job's log file and enforces a wall-clock timeout. The
//! running group can be interrupted, suspended and resumed through a
//! cloneable [`RunControl`] handle while the owner awaits the outcome.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};

/// How long the post-exit drain waits for each further line.
const DRAIN_SLICE: Duration = Duration::from_secs(1);

/// Error type for command runs
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Suspend/resume requested from the wrong state
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// The process has already exited
    #[error("Process is not running")]
    NotRunning,

    /// `sh` could not be started
    #[error("Failed to start command: {0}")]
    Spawn(#[source] io::Error),

    /// Delivering a signal to the process group failed
    #[error("Failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: i32,
        #[source]
        source: io::Error,
    },

    /// IO error on the job's log file
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Everything needed to launch one run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Passed verbatim to `sh -c`
    pub command: String,
    /// Added on top of the inherited environment
    pub env: Vec<(String, OsString)>,
    /// Wall-clock limit measured from launch
    pub timeout: Duration,
    /// Output log, appended to
    pub log_path: PathBuf,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    /// Exit code, `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    /// A soft interrupt was delivered
    pub interrupted: bool,
    /// The timeout fired and the group was killed
    pub timed_out: bool,
}

/// Classified result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    Success,
    Interrupted,
    TimedOut,
    Failed,
}

impl ExitOutcome {
    /// Timeout takes precedence over interruption, which takes precedence
    /// over the exit code.
    pub fn classify(&self) -> RunVerdict {
        if self.timed_out {
            RunVerdict::TimedOut
        } else if self.interrupted {
            RunVerdict::Interrupted
        } else if self.exit_code == Some(0) {
            RunVerdict::Success
        } else {
            RunVerdict::Failed
        }
    }
}

#[derive(Debug)]
struct RunState {
    pgid: i32,
    running: bool,
    suspended: bool,
    interrupted: bool,
    timed_out: bool,
}

/// Sends `signal` to every process in group `pgid`.
fn signal_group(pgid: i32, signal: libc::c_int) -> Result<(), RunnerError> {
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == -1 {
        return Err(RunnerError::Signal {
            pgid,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Cloneable handle for signalling an in-flight run.
#[derive(Debug, Clone)]
pub struct RunControl {
    state: Arc<Mutex<RunState>>,
}

impl RunControl {
    fn new(pgid: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(RunState {
                pgid,
                running: true,
                suspended: false,
                interrupted: false,
                timed_out: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn running(&self) -> Result<MutexGuard<'_, RunState>, RunnerError> {
        let state = self.lock();
        if !state.running {
            return Err(RunnerError::NotRunning);
        }
        Ok(state)
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    /// Interrupts the run.
    ///
    /// A soft interrupt sends SIGINT and marks the outcome as interrupted so
    /// the job is requeued. Otherwise SIGTERM is sent and nothing is recorded.
    /// A suspended group is continued first so it can act on the signal.
    pub fn interrupt(&self, soft: bool) -> Result<(), RunnerError> {
        let mut state = self.running()?;
        if state.suspended {
            signal_group(state.pgid, libc::SIGCONT)?;
            state.suspended = false;
        }
        if soft {
            signal_group(state.pgid, libc::SIGINT)?;
            state.interrupted = true;
        } else {
            signal_group(state.pgid, libc::SIGTERM)?;
        }
        Ok(())
    }

    /// Stops the process group with SIGSTOP.
    pub fn suspend(&self) -> Result<(), RunnerError> {
        let mut state = self.running()?;
        if state.suspended {
            return Err(RunnerError::InvalidState("process is already suspended"));
        }
        signal_group(state.pgid, libc::SIGSTOP)?;
        state.suspended = true;
        Ok(())
    }

    /// Continues a suspended process group with SIGCONT.
    pub fn resume(&self) -> Result<(), RunnerError> {
        let mut state = self.running()?;
        if !state.suspended {
            return Err(RunnerError::InvalidState("process is not suspended"));
        }
        signal_group(state.pgid, libc::SIGCONT)?;
        state.suspended = false;
        Ok(())
    }

    fn kill_for_timeout(&self) {
        let mut state = self.lock();
        if !state.running {
            return;
        }
        state.timed_out = true;
        if state.suspended {
            if let Err(e) = signal_group(state.pgid, libc::SIGCONT) {
                tracing::warn!(error = %e, "Failed to continue timed out process group");
            }
            state.suspended = false;
        }
        if let Err(e) = signal_group(state.pgid, libc::SIGKILL) {
            tracing::warn!(error = %e, "Failed to kill timed out process group");
        }
    }

    /// Marks the run finished and returns the recorded flags.
    fn finish(&self) -> (bool, bool) {
        let mut state = self.lock();
        state.running = false;
        state.suspended = false;
        (state.interrupted, state.timed_out)
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Writes command output to the job log and to tracing.
struct RunLog {
    file: File,
    path: PathBuf,
    write_failed: bool,
}

impl RunLog {
    async fn open(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            file,
            path,
            write_failed: false,
        })
    }

    async fn line(&mut self, stream: Stream, line: &str) {
        let level = match stream {
            Stream::Stdout => {
                tracing::debug!("{}", line);
                "INFO"
            }
            Stream::Stderr => {
                tracing::error!("{}", line);
                "ERROR"
            }
        };

        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f");
        let entry = format!("[{}] [{}]: {}\n", stamp, level, line);
        if let Err(e) = self.file.write_all(entry.as_bytes()).await {
            if !self.write_failed {
                tracing::warn!(log = %self.path.display(), error = %e, "Failed to write job log");
                self.write_failed = true;
            }
        }
    }

    async fn flush(&mut self) {
        if let Err(e) = self.file.flush().await {
            tracing::warn!(log = %self.path.display(), error = %e, "Failed to flush job log");
        }
    }
}

/// Line reader over one output pipe.
///
/// Lines are read as raw bytes and decoded lossily, so output that is not
/// UTF-8 is logged instead of ending the read. Partial lines survive a
/// cancelled read in `buf`.
struct OutputPipe<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    stream: Stream,
    open: bool,
}

impl<R: AsyncRead + Unpin> OutputPipe<R> {
    fn new(reader: R, stream: Stream) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
            stream,
            open: true,
        }
    }

    /// Next line without its terminator, or `None` at end of stream.
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        let mut end = self.buf.len();
        while end > 0 && matches!(self.buf[end - 1], b'\n' | b'\r') {
            end -= 1;
        }
        let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }

    /// Handles one read result. Only end of stream closes the pipe.
    async fn forward(&mut self, read: io::Result<Option<String>>, log: &mut RunLog) {
        match read {
            Ok(Some(line)) => log.line(self.stream, &line).await,
            Ok(None) => self.open = false,
            Err(e) => {
                self.buf.clear();
                tracing::warn!(stream = ?self.stream, error = %e, "Failed to read command output");
            }
        }
    }

    /// Reads what is left, giving up once no line arrives for
    /// [`DRAIN_SLICE`].
    async fn drain(&mut self, log: &mut RunLog) {
        while self.open {
            match timeout(DRAIN_SLICE, self.next_line()).await {
                Ok(Err(e)) => {
                    self.forward(Err(e), log).await;
                    break;
                }
                Ok(read) => self.forward(read, log).await,
                Err(_) => break,
            }
        }
    }
}

/// A launched command.
pub struct CommandRunner {
    control: RunControl,
    task: JoinHandle<Result<ExitOutcome, RunnerError>>,
}

impl CommandRunner {
    /// Launches `sh -c <command>` in a new process group.
    ///
    /// # Arguments
    /// * `spec` - Command, extra environment, timeout and log path
    ///
    /// # Returns
    /// The running command, or an error if the log could not be opened or
    /// the shell could not be started
    pub async fn spawn(spec: CommandSpec) -> Result<Self, RunnerError> {
        let CommandSpec {
            command,
            env,
            timeout: limit,
            log_path,
        } = spec;

        let mut log = RunLog::open(log_path).await?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(RunnerError::Spawn)?;

        let pid = child
            .id()
            .ok_or_else(|| RunnerError::Spawn(io::Error::other("child exited before start")))?;
        let control = RunControl::new(pid as i32);
        tracing::info!(pid, command = %command, "Started command");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Spawn(io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Spawn(io::Error::other("stderr not captured")))?;

        let deadline = Instant::now() + limit;
        let task_control = control.clone();

        let task = tokio::spawn(async move {
            let mut out = OutputPipe::new(stdout, Stream::Stdout);
            let mut err = OutputPipe::new(stderr, Stream::Stderr);
            let mut deadline_armed = true;

            let status = loop {
                tokio::select! {
                    read = out.next_line(), if out.open => out.forward(read, &mut log).await,
                    read = err.next_line(), if err.open => err.forward(read, &mut log).await,
                    _ = sleep_until(deadline), if deadline_armed => {
                        deadline_armed = false;
                        tracing::error!(pid, "Command timed out, killing process group");
                        task_control.kill_for_timeout();
                    },
                    status = child.wait() => break status,
                }
            };

            let (interrupted, timed_out) = task_control.finish();

            out.drain(&mut log).await;
            err.drain(&mut log).await;
            log.flush().await;

            let status = status?;
            Ok(ExitOutcome {
                exit_code: status.code(),
                interrupted,
                timed_out,
            })
        });

        Ok(Self { control, task })
    }

    /// Handle for signalling this run.
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    /// Waits for the process to exit and its output to be drained.
    pub async fn wait(self) -> Result<ExitOutcome, RunnerError> {
        self.task
            .await
            .map_err(|e| RunnerError::Io(io::Error::other(e.to_string())))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Instant as StdInstant;
    use tempfile::TempDir;

    fn spec(dir: &TempDir, command: &str, limit: Duration) -> CommandSpec {
        CommandSpec {
            command: command.to_string(),
            env: Vec::new(),
            timeout: limit,
            log_path: dir.path().join("run.log"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_classify_precedence(
            exit_code in proptest::option::of(-5i32..5),
            interrupted in any::<bool>(),
            timed_out in any::<bool>(),
        ) {
            let verdict = ExitOutcome { exit_code, interrupted, timed_out }.classify();
            let expected = if timed_out {
                RunVerdict::TimedOut
            } else if interrupted {
                RunVerdict::Interrupted
            } else if exit_code == Some(0) {
                RunVerdict::Success
            } else {
                RunVerdict::Failed
            };
            prop_assert_eq!(verdict, expected);
        }
    }

    #[tokio::test]
    async fn test_success_logs_both_streams() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::spawn(spec(
            &dir,
            "echo hello; echo oops >&2",
            Duration::from_secs(30),
        ))
        .await
        .unwrap();

        let outcome = runner.wait().await.unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.classify(), RunVerdict::Success);

        let log = std::fs::read_to_string(dir.path().join("run.log")).unwrap();
        assert!(log.contains("] [INFO]: hello\n"), "log was: {log}");
        assert!(log.contains("] [ERROR]: oops\n"), "log was: {log}");
        assert!(log.starts_with('['));
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_pipe_read() {
        let dir = TempDir::new().unwrap();
        // A non-UTF-8 line, then far more output than a pipe buffer holds.
        let command = "printf '\\377\\376\\n'; \
                       head -c 262144 /dev/zero | tr '\\0' 'a'; echo; echo done";
        let runner = CommandRunner::spawn(spec(&dir, command, Duration::from_secs(20)))
            .await
            .unwrap();

        let outcome = runner.wait().await.unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.classify(), RunVerdict::Success);

        let log = std::fs::read_to_string(dir.path().join("run.log")).unwrap();
        assert!(log.contains("] [INFO]: \u{FFFD}\u{FFFD}\n"));
        assert!(log.contains("] [INFO]: done\n"));
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_logged() {
        let dir = TempDir::new().unwrap();
        let command = "printf 'no newline'";
        let runner = CommandRunner::spawn(spec(&dir, command, Duration::from_secs(30)))
            .await
            .unwrap();

        assert_eq!(runner.wait().await.unwrap().classify(), RunVerdict::Success);
        let log = std::fs::read_to_string(dir.path().join("run.log")).unwrap();
        assert!(log.contains("] [INFO]: no newline\n"), "log was: {log}");
    }

    #[tokio::test]
    async fn test_environment_is_passed() {
        let dir = TempDir::new().unwrap();
        let mut spec = spec(
            &dir,
            r#"test "$INPUT_FILE" = /in/a.mp4 && test "$OUTPUT_FILE" = /in/a_transcoded.mp4"#,
            Duration::from_secs(30),
        );
        spec.env = vec![
            ("INPUT_FILE".into(), "/in/a.mp4".into()),
            ("OUTPUT_FILE".into(), "/in/a_transcoded.mp4".into()),
        ];

        let outcome = CommandRunner::spawn(spec).await.unwrap().wait().await.unwrap();
        assert_eq!(outcome.classify(), RunVerdict::Success);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::spawn(spec(&dir, "exit 3", Duration::from_secs(30)))
            .await
            .unwrap();

        let outcome = runner.wait().await.unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.interrupted && !outcome.timed_out);
        assert_eq!(outcome.classify(), RunVerdict::Failed);
    }

    #[tokio::test]
    async fn test_timeout_kills_group() {
        let dir = TempDir::new().unwrap();
        let started = StdInstant::now();
        let runner = CommandRunner::spawn(spec(&dir, "sleep 30", Duration::from_millis(200)))
            .await
            .unwrap();

        let outcome = runner.wait().await.unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.exit_code.is_none());
        assert_eq!(outcome.classify(), RunVerdict::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_kills_suspended_group() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::spawn(spec(&dir, "sleep 30", Duration::from_millis(300)))
            .await
            .unwrap();
        runner.control().suspend().unwrap();

        let outcome = runner.wait().await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.classify(), RunVerdict::TimedOut);
    }

    #[tokio::test]
    async fn test_suspend_twice_then_resume() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::spawn(spec(&dir, "sleep 30", Duration::from_secs(60)))
            .await
            .unwrap();
        let control = runner.control();

        assert!(matches!(control.resume(), Err(RunnerError::InvalidState(_))));
        control.suspend().unwrap();
        assert!(control.is_suspended());
        assert!(matches!(control.suspend(), Err(RunnerError::InvalidState(_))));
        control.resume().unwrap();
        assert!(!control.is_suspended());
        assert!(matches!(control.resume(), Err(RunnerError::InvalidState(_))));

        control.interrupt(true).unwrap();
        let outcome = runner.wait().await.unwrap();
        assert!(outcome.interrupted);
        assert_eq!(outcome.classify(), RunVerdict::Interrupted);
    }

    #[tokio::test]
    async fn test_soft_interrupt_of_suspended_run() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::spawn(spec(&dir, "sleep 30", Duration::from_secs(60)))
            .await
            .unwrap();
        let control = runner.control();
        control.suspend().unwrap();
        control.interrupt(true).unwrap();

        let outcome = runner.wait().await.unwrap();
        assert_eq!(outcome.classify(), RunVerdict::Interrupted);
    }

    #[tokio::test]
    async fn test_hard_interrupt_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::spawn(spec(&dir, "sleep 30", Duration::from_secs(60)))
            .await
            .unwrap();
        runner.control().interrupt(false).unwrap();

        let outcome = runner.wait().await.unwrap();
        assert!(!outcome.interrupted);
        assert!(outcome.exit_code.is_none());
        assert_eq!(outcome.classify(), RunVerdict::Failed);
    }

    #[tokio::test]
    async fn test_control_after_exit_is_not_running() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::spawn(spec(&dir, "true", Duration::from_secs(30)))
            .await
            .unwrap();
        let control = runner.control();
        runner.wait().await.unwrap();

        assert!(!control.is_running());
        assert!(matches!(control.suspend(), Err(RunnerError::NotRunning)));
        assert!(matches!(control.resume(), Err(RunnerError::NotRunning)));
        assert!(matches!(control.interrupt(true), Err(RunnerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_unwritable_log_fails_before_launch() {
        let dir = TempDir::new().unwrap();
        let mut spec = spec(&dir, "true", Duration::from_secs(30));
        spec.log_path = dir.path().join("missing/run.log");

        assert!(matches!(
            CommandRunner::spawn(spec).await,
            Err(RunnerError::Io(_))
        ));
    }
}
