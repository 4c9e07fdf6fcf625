//! Event definitions for the application event loop.
//!
//! This module defines the `Event` enum which carries everything that drives
//! the interactive view: progress and results from the orchestrator's worker
//! task, user input, and system signals. `ChannelSink` implements both sink
//! traits by forwarding into the loop's channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossterm::event::KeyEvent;
use log::debug;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::errors::ErrorKind;
use crate::orchestrator::{ProgressSink, ResultSink};
use crate::progress::ProgressState;
use crate::record::SpeedTestRecord;

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// The test moved to a new stage or picked up new readings.
    Stage(ProgressState),
    /// Captured tool output so far.
    Live(String),
    /// The test finished with a record.
    Completed(Box<SpeedTestRecord>),
    /// The test ended in an error.
    Failed { kind: ErrorKind, message: String },
    /// The test was cancelled by the user.
    Cancelled,
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// The terminal window was resized.
    Resize { width: u16, height: u16 },
    /// Ctrl-C or a termination signal reached this process.
    Interrupt,
}

/// Forwards sink callbacks from the worker task into the event loop.
///
/// Inside a tokio runtime every event passes through one forwarding task, so
/// the loop sees them in the order the sink received them even while its
/// channel is full. Live output snapshots are dropped instead of queued once
/// the loop falls behind.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
    forward: Option<Forwarder>,
}

#[derive(Debug, Clone)]
struct Forwarder {
    queue: mpsc::UnboundedSender<Event>,
    pending: Arc<AtomicUsize>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        let forward = tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| Forwarder::spawn(&handle, tx.clone()));
        Self { tx, forward }
    }

    // Progress and results must arrive even when the loop is behind.
    fn deliver(&self, event: Event) {
        match &self.forward {
            Some(forward) => forward.push(event),
            None => match self.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    let _ = self.tx.blocking_send(event);
                }
                Err(TrySendError::Closed(_)) => debug!("event loop gone, dropping event"),
            },
        }
    }

    fn has_room(&self) -> bool {
        let pending = self
            .forward
            .as_ref()
            .map_or(0, |forward| forward.pending.load(Ordering::SeqCst));
        self.tx.capacity() > pending
    }
}

impl Forwarder {
    fn spawn(handle: &tokio::runtime::Handle, tx: mpsc::Sender<Event>) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pending);
        handle.spawn(async move {
            while let Some(event) = rx.recv().await {
                let sent = tx.send(event).await;
                counter.fetch_sub(1, Ordering::SeqCst);
                if sent.is_err() {
                    debug!("event loop gone, stopping event forwarding");
                    break;
                }
            }
        });
        Self { queue, pending }
    }

    fn push(&self, event: Event) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(event).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            debug!("event loop gone, dropping event");
        }
    }
}

impl ProgressSink for ChannelSink {
    fn on_stage_changed(&self, state: &ProgressState) {
        self.deliver(Event::Stage(state.clone()));
    }

    fn on_live_output(&self, text: &str) {
        // Stale snapshots are superseded by the next one.
        if self.has_room() {
            self.deliver(Event::Live(text.to_string()));
        }
    }
}

impl ResultSink for ChannelSink {
    fn on_completed(&self, record: SpeedTestRecord) {
        self.deliver(Event::Completed(Box::new(record)));
    }

    fn on_failed(&self, kind: ErrorKind, message: &str) {
        self.deliver(Event::Failed {
            kind,
            message: message.to_string(),
        });
    }

    fn on_cancelled(&self) {
        self.deliver(Event::Cancelled);
    }
}
