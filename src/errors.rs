//! Error types for running a speed test.
//!
//! Process-level failures and parse failures are values, not panics: the
//! orchestrator inspects the `ErrorKind` to pick a fallback or to tell the
//! result sink what went wrong.

use std::error::Error;
use std::fmt;

/// Categories of failure a test run can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The speed-test executable is neither bundled nor on `PATH`.
    ProcessNotFound,
    /// The tool exited unsuccessfully. `None` means it was killed by a signal.
    ProcessCrashed(Option<i32>),
    /// The tool ran past the configured timeout and was terminated.
    ProcessTimedOut,
    /// The user cancelled the run. Not an error from the user's point of view.
    ProcessCancelled,
    /// The tool exited cleanly but printed nothing usable.
    OutputEmpty,
    /// The structured result could not be decoded.
    ParseMalformed,
    /// A test is already running on this orchestrator.
    AlreadyRunning,
}

impl ErrorKind {
    /// Get a user-friendly description of this error kind.
    pub fn description(&self) -> String {
        match self {
            ErrorKind::ProcessNotFound => "Speed test tool not found".to_string(),
            ErrorKind::ProcessCrashed(Some(code)) => {
                format!("Speed test tool exited with code {}", code)
            }
            ErrorKind::ProcessCrashed(None) => "Speed test tool was terminated".to_string(),
            ErrorKind::ProcessTimedOut => "Speed test timed out".to_string(),
            ErrorKind::ProcessCancelled => "Speed test cancelled".to_string(),
            ErrorKind::OutputEmpty => "Speed test produced no output".to_string(),
            ErrorKind::ParseMalformed => "Could not parse speed test output".to_string(),
            ErrorKind::AlreadyRunning => "A speed test is already running".to_string(),
        }
    }
}

/// A user-facing error for speed test operations.
#[derive(Debug)]
pub struct TestError {
    /// The kind of error.
    pub kind: ErrorKind,
    /// What happened, in plain words.
    pub message: String,
    /// Optional suggestion for how to resolve the error.
    pub suggestion: Option<String>,
}

impl TestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn not_found(program: &str) -> Self {
        Self::new(
            ErrorKind::ProcessNotFound,
            format!("could not locate `{}`", program),
        )
        .with_suggestion("Install the Speedtest CLI or set `cli_path` in speedrack.toml.")
    }

    pub fn already_running() -> Self {
        Self::new(
            ErrorKind::AlreadyRunning,
            "wait for the current test to finish or cancel it",
        )
    }

    pub fn timed_out(after_secs: u64) -> Self {
        Self::new(
            ErrorKind::ProcessTimedOut,
            format!("no result after {}s", after_secs),
        )
        .with_suggestion("The network may be unreachable. Try again or pick another server.")
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.description(), self.message)?;

        if let Some(ref suggestion) = self.suggestion {
            write!(f, "\n  Suggestion: {}", suggestion)?;
        }

        Ok(())
    }
}

impl Error for TestError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_suggestion() {
        let err = TestError::not_found("speedtest");
        let text = err.to_string();
        assert!(text.starts_with("Speed test tool not found: could not locate `speedtest`"));
        assert!(text.contains("Suggestion:"));
    }

    #[test]
    fn crashed_description_mentions_code() {
        assert_eq!(
            ErrorKind::ProcessCrashed(Some(2)).description(),
            "Speed test tool exited with code 2"
        );
        assert_eq!(
            ErrorKind::ProcessCrashed(None).description(),
            "Speed test tool was terminated"
        );
    }
}
