//! Application state and UI logic.
//!
//! This module holds the `App` struct, the state behind the progress and
//! result views. The event loop feeds it sink events; key presses come back
//! out as `AppAction`s for the loop to carry out.

use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::errors::ErrorKind;
use crate::events::Event;
use crate::progress::{ProgressState, Stage};
use crate::record::SpeedTestRecord;

/// Which screen is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    /// A test is running.
    Progress,
    /// The last test produced a record.
    Result,
    /// The last test failed.
    Failure,
    /// The last test was cancelled.
    Cancelled,
}

/// Actions resulting from user interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppAction {
    /// No action required.
    None,
    /// Stop the running test.
    Cancel,
    /// Exit the application.
    Quit,
    /// Copy the report to the clipboard.
    CopyReport,
    /// Start another test.
    Rerun,
}

#[derive(Debug, Clone, Copy)]
pub enum StatusLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Option<Duration>,
    level: StatusLevel,
}

/// The main application state container.
#[derive(Debug)]
pub struct App {
    pub screen: Screen,
    pub progress: ProgressState,
    /// Captured tool output, shown in the output pane.
    pub live_output: String,
    /// Whether the raw output pane is visible.
    pub show_output: bool,
    pub record: Option<SpeedTestRecord>,
    pub failure: Option<(ErrorKind, String)>,
    /// Use a decimal comma in numbers.
    pub decimal_comma: bool,
    /// A cancel was requested and has not been confirmed yet.
    pub cancelling: bool,
    /// Flag indicating if the application should exit.
    pub should_quit: bool,
    /// Quit as soon as the test ends.
    pub quit_when_done: bool,
    started_at: Instant,
    finished_after: Option<Duration>,
    status_message: Option<StatusMessage>,
}

impl App {
    pub fn new(decimal_comma: bool) -> Self {
        Self {
            screen: Screen::Progress,
            progress: ProgressState::new(),
            live_output: String::new(),
            show_output: false,
            record: None,
            failure: None,
            decimal_comma,
            cancelling: false,
            should_quit: false,
            quit_when_done: false,
            started_at: Instant::now(),
            finished_after: None,
            status_message: None,
        }
    }

    /// Resets everything for a new run.
    pub fn restart(&mut self) {
        let show_output = self.show_output;
        let decimal_comma = self.decimal_comma;
        *self = Self::new(decimal_comma);
        self.show_output = show_output;
    }

    pub fn is_running(&self) -> bool {
        self.screen == Screen::Progress
    }

    /// Applies a sink event. Input events are handled by `handle_key`.
    pub fn on_event(&mut self, event: Event) {
        match event {
            Event::Stage(state) => self.progress = state,
            Event::Live(text) => self.live_output = text,
            Event::Completed(record) => {
                self.finish(Screen::Result);
                self.progress.stage = Stage::Complete;
                self.record = Some(*record);
            }
            Event::Failed { kind, message } => {
                self.finish(Screen::Failure);
                self.progress = self.progress.fail();
                self.failure = Some((kind, message));
            }
            Event::Cancelled => {
                self.finish(Screen::Cancelled);
                self.set_status_message("Speed test cancelled");
            }
            Event::Key(_) | Event::Resize { .. } | Event::Interrupt => {}
        }
    }

    fn finish(&mut self, screen: Screen) {
        self.screen = screen;
        self.cancelling = false;
        self.finished_after = Some(self.started_at.elapsed());
        if self.quit_when_done {
            self.should_quit = true;
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        let ctrl_c =
            key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL);
        if self.is_running() {
            return match key.code {
                _ if ctrl_c => self.request_cancel(true),
                KeyCode::Esc | KeyCode::Char('q') => self.request_cancel(false),
                KeyCode::Char('o') => {
                    self.show_output = !self.show_output;
                    AppAction::None
                }
                _ => AppAction::None,
            };
        }
        match key.code {
            _ if ctrl_c => {
                self.should_quit = true;
                AppAction::Quit
            }
            KeyCode::Esc | KeyCode::Char('q') | KeyCode::Enter => {
                self.should_quit = true;
                AppAction::Quit
            }
            KeyCode::Char('c') if self.record.is_some() => AppAction::CopyReport,
            KeyCode::Char('r') => AppAction::Rerun,
            KeyCode::Char('o') => {
                self.show_output = !self.show_output;
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    /// Cancels the running test; with `then_quit` the app exits once it stops.
    pub fn request_cancel(&mut self, then_quit: bool) -> AppAction {
        if then_quit {
            self.quit_when_done = true;
        }
        if !self.is_running() {
            if then_quit {
                self.should_quit = true;
            }
            return AppAction::None;
        }
        if self.cancelling {
            return AppAction::None;
        }
        self.cancelling = true;
        self.set_status_message("Cancelling...");
        AppAction::Cancel
    }

    pub fn elapsed(&self) -> Duration {
        self.finished_after
            .unwrap_or_else(|| self.started_at.elapsed())
    }

    /// Fraction of the stage sequence completed, for the progress gauge.
    pub fn ratio(&self) -> f64 {
        match self.progress.stage {
            Stage::Complete => 1.0,
            stage => stage.step() as f64 / Stage::Complete.step() as f64,
        }
    }

    pub fn status_line(&self) -> String {
        let stage = if self.cancelling {
            "Cancelling..."
        } else {
            self.progress.stage.label()
        };
        let keys = if self.is_running() {
            "esc cancel | o output"
        } else if self.record.is_some() {
            "c copy | r rerun | o output | q quit"
        } else {
            "r rerun | o output | q quit"
        };
        format!("{} | {} | {}", stage, format_duration(self.elapsed()), keys)
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        if let Some(message) = &self.status_message {
            let still_visible = match message.ttl {
                Some(ttl) => message.at.elapsed() < ttl,
                None => true,
            };
            if still_visible {
                return Some((message.text.as_str(), message.level));
            }
        }
        None
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Info, Some(Duration::from_secs(3)));
    }

    pub fn set_status_warning_for(&mut self, message: impl Into<String>, ttl: Duration) {
        self.set_status_message_with_level(message, StatusLevel::Warning, Some(ttl));
    }

    fn set_status_message_with_level(
        &mut self,
        message: impl Into<String>,
        level: StatusLevel,
        ttl: Option<Duration>,
    ) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let minutes = secs / 60;
    let seconds = secs % 60;
    format!("{:02}:{:02}", minutes, seconds)
}
