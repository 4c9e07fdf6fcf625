//! Coordinating one speed test from launch to result.
//!
//! `TestOrchestrator::start` hands the run to a tokio task and returns at once.
//! The task feeds every output line through the classifier and the progress
//! state machine, reports stage changes to the `ProgressSink`, and on exit
//! assembles a record (or a failure) for the `ResultSink`. Only one test runs
//! per orchestrator; a second `start` is rejected with `AlreadyRunning`.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::assemble::{
    assemble_from_heuristics, assemble_from_structured, parse_server_list, ParseError,
};
use crate::classify::{classify, ClassifiedEvent};
use crate::errors::{ErrorKind, TestError};
use crate::output::OutputLog;
use crate::process::{resolve_executable, servers_args, Invocation, OutputFormat, TestOptions};
use crate::progress::{apply, ProgressState};
use crate::record::{ServerInfo, SpeedTestRecord};
use crate::runner::{CancelSignal, ExitOutcome, ProcessRunner, RunnerEvent};

/// Lines of captured output attached to failure messages.
const FAILURE_TAIL_LINES: usize = 20;

/// Minimum gap between live output snapshots that carry no stage change.
const LIVE_OUTPUT_INTERVAL: Duration = Duration::from_millis(100);

/// Receives progress while a test runs. Called from a worker task.
pub trait ProgressSink: Send + Sync {
    fn on_stage_changed(&self, state: &ProgressState);
    /// Captured output so far, for diagnostic display.
    fn on_live_output(&self, text: &str);
}

/// Receives exactly one terminal notification per started test.
pub trait ResultSink: Send + Sync {
    fn on_completed(&self, record: SpeedTestRecord);
    fn on_failed(&self, kind: ErrorKind, message: &str);
    fn on_cancelled(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Finishing,
}

#[derive(Debug)]
struct Slot {
    phase: Phase,
    cancel: Option<CancelSignal>,
}

/// Runs speed tests one at a time.
pub struct TestOrchestrator {
    runner: ProcessRunner,
    program: Option<String>,
    max_lines: usize,
    progress: Arc<dyn ProgressSink>,
    results: Arc<dyn ResultSink>,
    slot: Arc<Mutex<Slot>>,
}

impl TestOrchestrator {
    pub fn new(
        runner: ProcessRunner,
        progress: Arc<dyn ProgressSink>,
        results: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            runner,
            program: None,
            max_lines: 500,
            progress,
            results,
            slot: Arc::new(Mutex::new(Slot {
                phase: Phase::Idle,
                cancel: None,
            })),
        }
    }

    /// Uses this executable instead of looking up `speedtest`.
    pub fn with_program(mut self, program: Option<String>) -> Self {
        self.program = program;
        self
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines;
        self
    }

    pub fn phase(&self) -> Phase {
        lock(&self.slot).phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() != Phase::Idle
    }

    /// Starts a test with the given options.
    ///
    /// A missing executable is reported through `ResultSink::on_failed`, like
    /// every other terminal failure.
    pub fn start(&self, options: TestOptions) -> Result<JoinHandle<()>, TestError> {
        let cancel = self.begin()?;
        let prepared = resolve_executable(self.program.as_deref())
            .map(|program| Invocation::for_test(program, &options));
        Ok(self.spawn_run(prepared, cancel))
    }

    /// Starts a test with a fully prepared command line.
    pub fn start_invocation(&self, invocation: Invocation) -> Result<JoinHandle<()>, TestError> {
        let cancel = self.begin()?;
        Ok(self.spawn_run(Ok(invocation), cancel))
    }

    /// Asks the running test to stop. Returns `false` when nothing was running
    /// or the run already settled on a result.
    pub fn cancel(&self) -> bool {
        let slot = lock(&self.slot);
        match (&slot.phase, &slot.cancel) {
            (Phase::Idle, _) | (_, None) => false,
            (_, Some(cancel)) => {
                if !cancel.is_cancelled() {
                    info!("cancelling speed test");
                    cancel.cancel();
                }
                true
            }
        }
    }

    /// Lists the servers the tool would pick from.
    pub async fn list_servers(&self) -> Result<Vec<ServerInfo>, TestError> {
        let program = resolve_executable(self.program.as_deref())?;
        let invocation = Invocation::new(program, servers_args(), OutputFormat::Json);
        let mut stream = self
            .runner
            .spawn(&invocation, CancelSignal::new())
            .map_err(|err| spawn_error(&invocation, err))?;
        let mut log = OutputLog::new(self.max_lines);
        loop {
            match stream.next().await {
                Some(RunnerEvent::Line(line)) => {
                    log.push(line);
                }
                Some(RunnerEvent::Exited(outcome)) => {
                    if let Some((kind, message)) = failure_for(outcome, self.runner) {
                        return Err(TestError::new(kind, with_tail(&message, &log)));
                    }
                    break;
                }
                None => break,
            }
        }
        parse_server_list(&log.joined()).map_err(|err| {
            let kind = match err {
                ParseError::Empty => ErrorKind::OutputEmpty,
                ParseError::Malformed(_) => ErrorKind::ParseMalformed,
            };
            TestError::new(kind, with_tail(&err.to_string(), &log))
        })
    }

    fn begin(&self) -> Result<CancelSignal, TestError> {
        let mut slot = lock(&self.slot);
        if slot.phase != Phase::Idle {
            debug!("start rejected, phase is {:?}", slot.phase);
            return Err(TestError::already_running());
        }
        let cancel = CancelSignal::new();
        slot.phase = Phase::Running;
        slot.cancel = Some(cancel.clone());
        Ok(cancel)
    }

    fn spawn_run(
        &self,
        prepared: Result<Invocation, TestError>,
        cancel: CancelSignal,
    ) -> JoinHandle<()> {
        let run = Run {
            runner: self.runner,
            max_lines: self.max_lines,
            progress: Arc::clone(&self.progress),
            results: Arc::clone(&self.results),
            slot: Arc::clone(&self.slot),
            cancel,
        };
        tokio::spawn(run.execute(prepared))
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Verdict {
    Completed(SpeedTestRecord),
    Cancelled,
    Failed(ErrorKind, String),
}

struct Run {
    runner: ProcessRunner,
    max_lines: usize,
    progress: Arc<dyn ProgressSink>,
    results: Arc<dyn ResultSink>,
    slot: Arc<Mutex<Slot>>,
    cancel: CancelSignal,
}

impl Run {
    async fn execute(self, prepared: Result<Invocation, TestError>) {
        let mut state = ProgressState::new();
        self.progress.on_stage_changed(&state);

        let verdict = match prepared {
            Ok(invocation) => self.drive(&invocation, &mut state).await,
            Err(err) => Verdict::Failed(err.kind, err.to_string()),
        };

        match self.settle(verdict) {
            Verdict::Completed(record) => {
                info!(
                    "speed test complete: {:.2} / {:.2} Mbps, {:.2} ms",
                    record.download.mbps(),
                    record.upload.mbps(),
                    record.latency_ms
                );
                if log::log_enabled!(log::Level::Debug) {
                    debug!("{}", record.debug_dump());
                }
                let done = apply(&ClassifiedEvent::Completed, &state);
                if done != state {
                    self.progress.on_stage_changed(&done);
                }
                self.results.on_completed(record);
            }
            Verdict::Cancelled => {
                info!("speed test cancelled");
                self.results.on_cancelled();
            }
            Verdict::Failed(kind, message) => {
                warn!("speed test failed: {}", kind.description());
                self.progress.on_stage_changed(&state.fail());
                self.results.on_failed(kind, &message);
            }
        }

        let mut slot = lock(&self.slot);
        slot.phase = Phase::Idle;
        slot.cancel = None;
    }

    async fn drive(&self, invocation: &Invocation, state: &mut ProgressState) -> Verdict {
        info!(
            "starting speed test ({} output): {}",
            invocation.format.as_str(),
            invocation.display()
        );
        let mut stream = match self.runner.spawn(invocation, self.cancel.clone()) {
            Ok(stream) => stream,
            Err(err) => {
                let err = spawn_error(invocation, err);
                return Verdict::Failed(err.kind, err.to_string());
            }
        };

        let mut log = OutputLog::new(self.max_lines);
        let mut live_sent: Option<Instant> = None;
        let mut live_pending = false;
        let outcome = loop {
            match stream.next().await {
                Some(RunnerEvent::Line(line)) => {
                    let event = classify(&line.text);
                    log.push(line);
                    let next = apply(&event, state);
                    let changed = next != *state;
                    let due = live_sent.map_or(true, |at| at.elapsed() >= LIVE_OUTPUT_INTERVAL);
                    if changed || due {
                        self.progress.on_live_output(&log.joined());
                        live_sent = Some(Instant::now());
                        live_pending = false;
                    } else {
                        live_pending = true;
                    }
                    if changed {
                        if next.stage != state.stage {
                            debug!("stage {:?} -> {:?}", state.stage, next.stage);
                        }
                        *state = next;
                        self.progress.on_stage_changed(state);
                    }
                }
                Some(RunnerEvent::Exited(outcome)) => break outcome,
                None => break ExitOutcome::Crashed(None),
            }
        };
        if live_pending {
            self.progress.on_live_output(&log.joined());
        }
        if log.dropped() > 0 {
            debug!("{} early output lines were not kept", log.dropped());
        }
        self.set_phase(Phase::Finishing);
        if self.cancel.is_cancelled() {
            return Verdict::Cancelled;
        }
        conclude(outcome, &log, invocation.format, self.runner)
    }

    fn set_phase(&self, phase: Phase) {
        lock(&self.slot).phase = phase;
    }

    // An acknowledged cancel wins over any result. Once settled, `cancel`
    // reports `false`.
    fn settle(&self, verdict: Verdict) -> Verdict {
        let mut slot = lock(&self.slot);
        slot.phase = Phase::Finishing;
        slot.cancel = None;
        if self.cancel.is_cancelled() {
            Verdict::Cancelled
        } else {
            verdict
        }
    }
}

fn conclude(
    outcome: ExitOutcome,
    log: &OutputLog,
    format: OutputFormat,
    runner: ProcessRunner,
) -> Verdict {
    if outcome == ExitOutcome::Cancelled {
        return Verdict::Cancelled;
    }
    if let Some((kind, message)) = failure_for(outcome, runner) {
        return Verdict::Failed(kind, with_tail(&message, log));
    }
    if !log.has_content() {
        return Verdict::Failed(
            ErrorKind::OutputEmpty,
            "the tool exited without printing anything".to_string(),
        );
    }

    let mut structured_error = None;
    if format == OutputFormat::Json {
        match assemble_from_structured(&log.joined()) {
            Ok(record) => return Verdict::Completed(record),
            Err(err) => {
                warn!("structured result unusable ({}), trying text heuristics", err);
                structured_error = Some(err);
            }
        }
    }

    let record = assemble_from_heuristics(log.iter());
    if record.has_measurements() {
        return Verdict::Completed(record);
    }
    match structured_error {
        Some(ParseError::Malformed(reason)) => Verdict::Failed(
            ErrorKind::ParseMalformed,
            with_tail(&format!("malformed result: {}", reason), log),
        ),
        _ => Verdict::Failed(
            ErrorKind::OutputEmpty,
            with_tail("no measurements found in the output", log),
        ),
    }
}

// Exit outcomes that end a run without a result to assemble.
fn failure_for(outcome: ExitOutcome, runner: ProcessRunner) -> Option<(ErrorKind, String)> {
    match outcome {
        ExitOutcome::Completed(0) => None,
        ExitOutcome::Completed(code) => Some((
            ErrorKind::ProcessCrashed(Some(code)),
            format!("the tool exited with code {}", code),
        )),
        ExitOutcome::Crashed(code) => Some((
            ErrorKind::ProcessCrashed(code),
            "the tool terminated unexpectedly".to_string(),
        )),
        ExitOutcome::TimedOut => {
            let secs = runner
                .config()
                .timeout
                .map(|timeout| timeout.as_secs())
                .unwrap_or_default();
            Some((ErrorKind::ProcessTimedOut, TestError::timed_out(secs).to_string()))
        }
        ExitOutcome::Cancelled => Some((
            ErrorKind::ProcessCancelled,
            "the run was cancelled".to_string(),
        )),
    }
}

fn with_tail(message: &str, log: &OutputLog) -> String {
    let tail = log.tail(FAILURE_TAIL_LINES);
    if tail.trim().is_empty() {
        message.to_string()
    } else {
        format!("{}\n{}", message, tail)
    }
}

fn spawn_error(invocation: &Invocation, err: io::Error) -> TestError {
    let program = &invocation.program;
    if err.kind() == io::ErrorKind::NotFound {
        return TestError::not_found(&program.display().to_string());
    }
    TestError::new(
        ErrorKind::ProcessCrashed(None),
        format!("failed to start {}: {}", program.display(), err),
    )
}
