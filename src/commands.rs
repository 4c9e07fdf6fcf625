//! The launcher's command surface.
//!
//! A launcher shows entries for a query and runs the one the user picks.
//! While a test is running the run entries are replaced by a disabled notice,
//! since only one test may run at a time.

use std::path::PathBuf;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::errors::ErrorKind;
use crate::history::{History, HistoryEntry};
use crate::orchestrator::TestOrchestrator;
use crate::process::TestOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherCommand {
    RunTest,
    /// Download and latency only.
    RunQuickTest,
    CancelTest,
    ShowHistory,
}

impl LauncherCommand {
    pub fn name(&self) -> &'static str {
        match self {
            LauncherCommand::RunTest => "run",
            LauncherCommand::RunQuickTest => "quick",
            LauncherCommand::CancelTest => "cancel",
            LauncherCommand::ShowHistory => "history",
        }
    }
}

/// One row in the launcher's result list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEntry {
    pub title: &'static str,
    pub subtitle: &'static str,
    /// `None` for informational rows that do nothing when picked.
    pub command: Option<LauncherCommand>,
}

/// Entries offered for the current state.
pub fn query(running: bool) -> Vec<QueryEntry> {
    if running {
        return vec![
            QueryEntry {
                title: "Speed test is currently running…",
                subtitle: "Please wait for the current test to complete",
                command: None,
            },
            QueryEntry {
                title: "Cancel Speed Test",
                subtitle: "Stop the running test",
                command: Some(LauncherCommand::CancelTest),
            },
        ];
    }
    vec![
        QueryEntry {
            title: "Run Speed Test",
            subtitle: "Test your internet connection speed",
            command: Some(LauncherCommand::RunTest),
        },
        QueryEntry {
            title: "Quick Speed Test",
            subtitle: "Measure latency and download only",
            command: Some(LauncherCommand::RunQuickTest),
        },
        QueryEntry {
            title: "Speed Test History",
            subtitle: "Show recent results",
            command: Some(LauncherCommand::ShowHistory),
        },
    ]
}

/// What executing a command led to.
#[derive(Debug)]
pub enum Outcome {
    /// A test was started; results arrive through the sinks.
    Started(JoinHandle<()>),
    /// Another test is still running.
    Busy,
    /// Whether there was a test to cancel.
    CancelRequested(bool),
    /// Newest first.
    History(Vec<HistoryEntry>),
}

/// Maps launcher commands onto the orchestrator.
pub struct Launcher {
    orchestrator: TestOrchestrator,
    options: TestOptions,
    history_path: Option<PathBuf>,
    history_limit: usize,
}

impl Launcher {
    pub fn new(
        orchestrator: TestOrchestrator,
        options: TestOptions,
        history_path: Option<PathBuf>,
    ) -> Self {
        Self {
            orchestrator,
            options,
            history_path,
            history_limit: crate::history::MAX_HISTORY,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn orchestrator(&self) -> &TestOrchestrator {
        &self.orchestrator
    }

    pub fn query(&self) -> Vec<QueryEntry> {
        query(self.orchestrator.is_running())
    }

    pub fn execute(&self, command: LauncherCommand) -> Result<Outcome> {
        log::debug!("launcher command: {}", command.name());
        match command {
            LauncherCommand::RunTest => Ok(self.start(self.options.clone())),
            LauncherCommand::RunQuickTest => Ok(self.start(self.options.clone().quick())),
            LauncherCommand::CancelTest => {
                Ok(Outcome::CancelRequested(self.orchestrator.cancel()))
            }
            LauncherCommand::ShowHistory => {
                let Some(path) = &self.history_path else {
                    return Ok(Outcome::History(Vec::new()));
                };
                let history = History::load(path)?;
                Ok(Outcome::History(
                    history.recent(self.history_limit).cloned().collect(),
                ))
            }
        }
    }

    fn start(&self, options: TestOptions) -> Outcome {
        match self.orchestrator.start(options) {
            Ok(handle) => Outcome::Started(handle),
            Err(err) if err.kind == ErrorKind::AlreadyRunning => Outcome::Busy,
            Err(err) => {
                log::warn!("{}", err);
                Outcome::Busy
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::orchestrator::{ProgressSink, ResultSink};
    use crate::progress::ProgressState;
    use crate::record::SpeedTestRecord;
    use crate::runner::{ProcessRunner, RunnerConfig};

    #[derive(Default)]
    struct Failures(Mutex<Vec<ErrorKind>>);

    impl ProgressSink for Failures {
        fn on_stage_changed(&self, _state: &ProgressState) {}
        fn on_live_output(&self, _text: &str) {}
    }

    impl ResultSink for Failures {
        fn on_completed(&self, _record: SpeedTestRecord) {}
        fn on_failed(&self, kind: ErrorKind, _message: &str) {
            self.0.lock().unwrap().push(kind);
        }
        fn on_cancelled(&self) {}
    }

    fn launcher(program: &str, history_path: Option<PathBuf>) -> (Launcher, Arc<Failures>) {
        let sink = Arc::new(Failures::default());
        let orchestrator = TestOrchestrator::new(
            ProcessRunner::new(RunnerConfig::new(500, 10)),
            sink.clone(),
            sink.clone(),
        )
        .with_program(Some(program.to_string()));
        (
            Launcher::new(orchestrator, TestOptions::default(), history_path),
            sink,
        )
    }

    #[test]
    fn idle_query_offers_tests() {
        let entries = query(false);
        assert_eq!(entries[0].title, "Run Speed Test");
        assert_eq!(entries[0].subtitle, "Test your internet connection speed");
        assert!(entries.iter().all(|entry| entry.command.is_some()));
    }

    #[test]
    fn running_query_shows_notice() {
        let entries = query(true);
        assert_eq!(entries[0].title, "Speed test is currently running…");
        assert_eq!(entries[0].command, None);
        assert!(!entries
            .iter()
            .any(|entry| entry.command == Some(LauncherCommand::RunTest)));
    }

    #[tokio::test]
    async fn cancel_when_idle_is_a_no_op() {
        let (launcher, _) = launcher("speedtest", None);
        assert!(matches!(
            launcher.execute(LauncherCommand::CancelTest).unwrap(),
            Outcome::CancelRequested(false)
        ));
    }

    #[tokio::test]
    async fn history_without_file_is_empty() {
        let (launcher, _) = launcher("speedtest", None);
        match launcher.execute(LauncherCommand::ShowHistory).unwrap() {
            Outcome::History(entries) => assert!(entries.is_empty()),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_test_reaches_the_orchestrator() {
        // `sh` rejects the speed-test flags and exits non-zero.
        let (launcher, sink) = launcher("/bin/sh", None);
        let handle = match launcher.execute(LauncherCommand::RunQuickTest).unwrap() {
            Outcome::Started(handle) => handle,
            other => panic!("unexpected outcome: {:?}", other),
        };
        handle.await.unwrap();
        let failures = sink.0.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], ErrorKind::ProcessCrashed(_)));
        assert!(!launcher.orchestrator().is_running());
    }
}
