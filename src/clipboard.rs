//! Where finished reports are copied to.

use anyhow::{Context, Result};

/// Receives plain text, e.g. the system clipboard.
pub trait TextSink {
    fn put_text(&mut self, text: &str) -> Result<()>;
}

/// The system clipboard, opened on first use.
#[derive(Default)]
pub struct SystemClipboard {
    inner: Option<arboard::Clipboard>,
}

impl TextSink for SystemClipboard {
    fn put_text(&mut self, text: &str) -> Result<()> {
        let clipboard = match self.inner.take() {
            Some(clipboard) => clipboard,
            None => arboard::Clipboard::new().context("failed to access clipboard")?,
        };
        let clipboard = self.inner.insert(clipboard);
        clipboard
            .set_text(text.to_string())
            .context("failed to set clipboard text")?;
        Ok(())
    }
}

/// Copies a report, logging instead of failing when the clipboard is unavailable.
pub fn copy_report(sink: &mut dyn TextSink, report: &str) -> bool {
    match sink.put_text(report) {
        Ok(()) => true,
        Err(err) => {
            log::warn!("could not copy report: {:#}", err);
            false
        }
    }
}
