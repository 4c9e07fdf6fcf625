//! Running the speed-test tool as a child process.
//!
//! `ProcessRunner::spawn` starts the tool and returns an `OutputStream`: every
//! line printed on stdout or stderr arrives as a `RunnerEvent::Line`, followed
//! by exactly one `RunnerEvent::Exited`. The two streams are read on separate
//! tasks that funnel into one channel. Cancellation and the run timeout first
//! ask the process to stop, then kill it once the grace period runs out.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::output::{RawOutputLine, StreamKind};
use crate::process::Invocation;

/// Time the tool gets to exit on its own after being asked to stop.
pub const DEFAULT_GRACE_MS: u64 = 3000;
/// Upper bound for a whole test run.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

// Readers may be held open by grandchildren that outlive the tool.
const READER_DRAIN: Duration = Duration::from_millis(500);
const CHANNEL_CAPACITY: usize = 256;

/// Cooperative cancellation shared between a caller and a running test.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    pub grace: Duration,
    /// `None` lets the tool run for as long as it likes.
    pub timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(DEFAULT_GRACE_MS),
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        }
    }
}

impl RunnerConfig {
    /// Builds a config from settings values; a zero timeout disables it.
    pub fn new(grace_ms: u64, timeout_secs: u64) -> Self {
        Self {
            grace: Duration::from_millis(grace_ms),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        }
    }
}

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited on its own with this code. Non-zero is still a normal outcome here.
    Completed(i32),
    /// Ended without an exit code, e.g. killed by a signal.
    Crashed(Option<i32>),
    /// Ran past the configured timeout and was stopped.
    TimedOut,
    /// Stopped because the cancel signal fired.
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum RunnerEvent {
    Line(RawOutputLine),
    Exited(ExitOutcome),
}

/// Events of one running process, in arrival order.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::Receiver<RunnerEvent>,
    finished: bool,
}

impl OutputStream {
    /// Next line or the final exit. `None` after `Exited` has been returned.
    pub async fn next(&mut self) -> Option<RunnerEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await;
        match &event {
            Some(RunnerEvent::Exited(_)) => self.finished = true,
            None => {
                self.finished = true;
                return Some(RunnerEvent::Exited(ExitOutcome::Crashed(None)));
            }
            Some(RunnerEvent::Line(_)) => {}
        }
        event
    }
}

/// Spawns the tool and supervises it until it exits.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner {
    config: RunnerConfig,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> RunnerConfig {
        self.config
    }

    /// Starts `invocation`. Must be called from inside a tokio runtime.
    pub fn spawn(&self, invocation: &Invocation, cancel: CancelSignal) -> io::Result<OutputStream> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        debug!("spawned {} (pid {:?})", invocation.display(), child.id());

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_stream(
                StreamKind::Stdout,
                stdout,
                tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_stream(
                StreamKind::Stderr,
                stderr,
                tx.clone(),
            )));
        }
        tokio::spawn(supervise(child, readers, tx, cancel, self.config));

        Ok(OutputStream {
            rx,
            finished: false,
        })
    }
}

async fn supervise(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    tx: mpsc::Sender<RunnerEvent>,
    cancel: CancelSignal,
    config: RunnerConfig,
) {
    let deadline = async {
        match config.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => match status.code() {
                Some(code) => ExitOutcome::Completed(code),
                None => ExitOutcome::Crashed(None),
            },
            Err(err) => {
                warn!("failed to wait for speed test process: {}", err);
                ExitOutcome::Crashed(None)
            }
        },
        _ = cancel.cancelled() => {
            debug!("cancel requested, stopping speed test process");
            terminate(&mut child, config.grace).await;
            ExitOutcome::Cancelled
        }
        _ = deadline => {
            warn!("speed test exceeded {:?}, stopping it", config.timeout);
            terminate(&mut child, config.grace).await;
            ExitOutcome::TimedOut
        }
    };

    let drain_until = tokio::time::Instant::now() + READER_DRAIN;
    for mut reader in readers {
        if tokio::time::timeout_at(drain_until, &mut reader).await.is_err() {
            reader.abort();
        }
    }
    debug!("speed test process finished: {:?}", outcome);
    let _ = tx.send(RunnerEvent::Exited(outcome)).await;
}

// Graceful stop, then a hard kill once `grace` has passed.
async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };
    send_terminate(pid);
    match wait_for_exit(child, grace).await {
        Ok(Some(status)) => debug!("speed test process stopped with {}", status),
        Ok(None) => {
            warn!("speed test process ignored termination for {:?}, killing it", grace);
            kill_group(pid);
            let _ = child.kill().await;
        }
        Err(err) => {
            warn!("failed to wait for speed test process: {}", err);
            let _ = child.kill().await;
        }
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, libc::SIGTERM);
        let _ = libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    unsafe {
        let _ = libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(windows)]
fn send_terminate(pid: u32) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // CTRL_BREAK is the closest console signal to SIGTERM.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

#[cfg(all(not(unix), not(windows)))]
fn send_terminate(_pid: u32) {}

async fn wait_for_exit(
    child: &mut Child,
    timeout: Duration,
) -> io::Result<Option<std::process::ExitStatus>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}

// Splits on both `\n` and `\r` so progress redraws arrive as they happen.
async fn read_stream<R>(stream: StreamKind, reader: R, tx: mpsc::Sender<RunnerEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!("{} read failed: {}", stream.label(), err);
                break;
            }
        };
        if chunk.is_empty() {
            break;
        }
        let consumed = chunk.len();
        let mut complete = Vec::new();
        for &byte in chunk {
            match byte {
                b'\n' | b'\r' => {
                    if !pending.is_empty() {
                        complete.push(std::mem::take(&mut pending));
                    }
                }
                _ => pending.push(byte),
            }
        }
        reader.consume(consumed);
        for bytes in complete {
            if !send_line(&tx, stream, &bytes).await {
                return;
            }
        }
    }
    if !pending.is_empty() {
        send_line(&tx, stream, &pending).await;
    }
}

async fn send_line(tx: &mpsc::Sender<RunnerEvent>, stream: StreamKind, bytes: &[u8]) -> bool {
    let text = String::from_utf8_lossy(bytes).into_owned();
    tx.send(RunnerEvent::Line(RawOutputLine::new(text, stream)))
        .await
        .is_ok()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::OutputFormat;

    fn sh(script: &str) -> Invocation {
        Invocation::new(
            "/bin/sh",
            vec!["-c".to_string(), script.to_string()],
            OutputFormat::Human,
        )
    }

    async fn collect(mut stream: OutputStream) -> (Vec<RawOutputLine>, ExitOutcome) {
        let mut lines = Vec::new();
        while let Some(event) = stream.next().await {
            match event {
                RunnerEvent::Line(line) => lines.push(line),
                RunnerEvent::Exited(outcome) => return (lines, outcome),
            }
        }
        panic!("stream ended without an exit event");
    }

    #[tokio::test]
    async fn streams_both_outputs_then_exit() {
        let runner = ProcessRunner::default();
        let stream = runner
            .spawn(&sh("echo one; echo two 1>&2; echo three"), CancelSignal::new())
            .unwrap();
        let (lines, outcome) = collect(stream).await;
        assert_eq!(outcome, ExitOutcome::Completed(0));
        let stdout: Vec<_> = lines
            .iter()
            .filter(|line| line.stream == StreamKind::Stdout)
            .map(|line| line.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "three"]);
        assert!(lines
            .iter()
            .any(|line| line.stream == StreamKind::Stderr && line.text == "two"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_completed_with_code() {
        let runner = ProcessRunner::default();
        let stream = runner.spawn(&sh("echo oops; exit 3"), CancelSignal::new()).unwrap();
        let (lines, outcome) = collect(stream).await;
        assert_eq!(outcome, ExitOutcome::Completed(3));
        assert_eq!(lines.len(), 1);
    }

    #[tokio::test]
    async fn carriage_returns_split_lines() {
        let runner = ProcessRunner::default();
        let stream = runner
            .spawn(&sh("printf 'a\\rb\\r\\nc'"), CancelSignal::new())
            .unwrap();
        let (lines, _) = collect(stream).await;
        let texts: Vec<_> = lines.iter().map(|line| line.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cancel_stops_process_within_grace() {
        let runner = ProcessRunner::new(RunnerConfig::new(1000, 0));
        let cancel = CancelSignal::new();
        let mut stream = runner
            .spawn(&sh("echo started; sleep 30"), cancel.clone())
            .unwrap();
        match stream.next().await {
            Some(RunnerEvent::Line(line)) => assert_eq!(line.text, "started"),
            other => panic!("unexpected event: {:?}", other),
        }
        let begun = std::time::Instant::now();
        cancel.cancel();
        let (_, outcome) = collect(stream).await;
        assert_eq!(outcome, ExitOutcome::Cancelled);
        assert!(begun.elapsed() < Duration::from_secs(3));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn ignored_termination_is_escalated_to_kill() {
        let runner = ProcessRunner::new(RunnerConfig::new(200, 0));
        let cancel = CancelSignal::new();
        let mut stream = runner
            .spawn(&sh("trap '' TERM; echo ready; sleep 30"), cancel.clone())
            .unwrap();
        assert!(matches!(stream.next().await, Some(RunnerEvent::Line(_))));
        let begun = std::time::Instant::now();
        cancel.cancel();
        let (_, outcome) = collect(stream).await;
        assert_eq!(outcome, ExitOutcome::Cancelled);
        assert!(begun.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn timeout_reports_timed_out() {
        let runner = ProcessRunner::new(RunnerConfig {
            grace: Duration::from_millis(200),
            timeout: Some(Duration::from_millis(300)),
        });
        let stream = runner.spawn(&sh("sleep 30"), CancelSignal::new()).unwrap();
        let (_, outcome) = collect(stream).await;
        assert_eq!(outcome, ExitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let runner = ProcessRunner::default();
        let invocation = Invocation::new(
            "/definitely/not/a/program",
            Vec::new(),
            OutputFormat::Json,
        );
        assert!(runner.spawn(&invocation, CancelSignal::new()).is_err());
    }
}
