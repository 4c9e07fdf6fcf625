//! Captured output of the speed-test tool.
//!
//! Every line the child process prints becomes a `RawOutputLine` tagged with
//! the stream it came from. The orchestrator archives them in an `OutputLog`,
//! a bounded buffer that backs the live diagnostic view and the failure tail.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use strip_ansi_escapes::strip;

/// Indicates the source stream of an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// A single line of output, stamped when it was read.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutputLine {
    /// The content of the line, without the trailing newline.
    pub text: String,
    /// The stream it originated from (stdout/stderr).
    pub stream: StreamKind,
    /// When the runner received the line.
    pub at: DateTime<Utc>,
}

impl RawOutputLine {
    pub fn new(text: impl Into<String>, stream: StreamKind) -> Self {
        Self {
            text: text.into(),
            stream,
            at: Utc::now(),
        }
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Self::new(text, StreamKind::Stdout)
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self::new(text, StreamKind::Stderr)
    }

    /// Text prepared for display: ANSI codes removed, progress redraws collapsed.
    pub fn display_text(&self) -> String {
        sanitize_text(&strip_carriage(&self.text), true)
    }
}

/// A fixed-capacity ring buffer of output lines.
#[derive(Debug, Clone)]
pub struct OutputLog {
    max_lines: usize,
    lines: VecDeque<RawOutputLine>,
    dropped: usize,
}

impl OutputLog {
    /// Creates a new `OutputLog` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
            dropped: 0,
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: RawOutputLine) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            self.dropped += 1;
            dropped = true;
        }
        dropped
    }

    /// Returns the number of lines currently in the buffer.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Number of lines evicted since the log was created.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Returns an iterator over the lines in the buffer.
    pub fn iter(&self) -> impl Iterator<Item = &RawOutputLine> {
        self.lines.iter()
    }

    /// Whether any retained line carries non-whitespace text.
    pub fn has_content(&self) -> bool {
        self.lines.iter().any(|line| !line.text.trim().is_empty())
    }

    /// All retained lines joined verbatim, in arrival order.
    pub fn joined(&self) -> String {
        let mut text = String::new();
        for line in &self.lines {
            text.push_str(&line.text);
            text.push('\n');
        }
        text
    }

    /// The last `count` lines for display, stderr lines marked as such.
    pub fn tail(&self, count: usize) -> String {
        let skip = self.lines.len().saturating_sub(count);
        self.lines
            .iter()
            .skip(skip)
            .map(|line| match line.stream {
                StreamKind::Stdout => line.display_text(),
                StreamKind::Stderr => format!("[stderr] {}", line.display_text()),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// Keeps only the text after the last carriage return.
///
/// The tool redraws its progress line in place with `\r`; only the final
/// redraw is meaningful.
pub fn strip_carriage(text: &str) -> String {
    let text = text.trim_end_matches('\r');
    text.rsplit('\r').next().unwrap_or(text).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_log_drops_oldest() {
        let mut log = OutputLog::new(2);
        log.push(RawOutputLine::stdout("a"));
        log.push(RawOutputLine::stdout("b"));
        let dropped = log.push(RawOutputLine::stdout("c"));
        assert!(dropped);
        assert_eq!(log.dropped(), 1);
        let lines = log.iter().map(|l| l.text.clone()).collect::<Vec<_>>();
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[test]
    fn tail_marks_stderr_and_limits_count() {
        let mut log = OutputLog::new(10);
        log.push(RawOutputLine::stdout("one"));
        log.push(RawOutputLine::stderr("two"));
        log.push(RawOutputLine::stdout("three"));
        assert_eq!(log.tail(2), "[stderr] two\nthree");
    }

    #[test]
    fn has_content_ignores_blank_lines() {
        let mut log = OutputLog::new(10);
        log.push(RawOutputLine::stdout("   "));
        assert!(!log.has_content());
        log.push(RawOutputLine::stderr("x"));
        assert!(log.has_content());
    }

    #[test]
    fn display_text_strips_ansi_and_redraws() {
        let line = RawOutputLine::stdout("\u{1b}[32mDownload: 1 Mbps\rDownload: 2 Mbps\u{1b}[0m");
        assert_eq!(line.display_text(), "Download: 2 Mbps");
    }
}
