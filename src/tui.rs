use std::cell::Cell;
use std::io::{self, IsTerminal, Write};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::debug;

use crate::pipeline::Stage;
use crate::progress::ProgressSink;

/// Progress line on stderr, with q, Esc or Ctrl-C cancelling the current
/// stage. Keys are only read while raw mode is held, i.e. when stdin is a
/// terminal.
pub struct TerminalProgress {
    raw: bool,
    cancelled: Cell<bool>,
    last_percent: Cell<Option<u8>>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        let raw = io::stdin().is_terminal() && enable_raw_mode().is_ok();
        if !raw {
            debug!("stdin is not a terminal; cancellation keys disabled");
        }
        Self {
            raw,
            cancelled: Cell::new(false),
            last_percent: Cell::new(None),
        }
    }

    fn poll_keys(&self) {
        if !self.raw {
            return;
        }
        while let Ok(true) = event::poll(Duration::ZERO) {
            match event::read() {
                Ok(Event::Key(key)) if is_cancel_key(key) => self.cancelled.set(true),
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }

    fn line_end(&self) -> &'static str {
        if self.raw { "\r\n" } else { "\n" }
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TerminalProgress {
    fn drop(&mut self) {
        if self.raw {
            let _ = disable_raw_mode();
        }
    }
}

impl ProgressSink for TerminalProgress {
    fn begin(&self, stage: Stage, label: &str) {
        // A cancelled archive copy does not stop the stages after it.
        self.cancelled.set(false);
        self.last_percent.set(None);
        let mut err = io::stderr().lock();
        let _ = write!(err, "{stage}: {label}{}", self.line_end());
    }

    fn report_progress(&self, percent: u8, detail: &str) {
        if self.last_percent.replace(Some(percent)) == Some(percent) && percent < 100 {
            return;
        }
        let mut err = io::stderr().lock();
        let _ = write!(err, "\r {percent:3}% ({detail})   ");
        let _ = err.flush();
    }

    fn is_cancellation_requested(&self) -> bool {
        self.poll_keys();
        self.cancelled.get()
    }

    fn finish(&self) {
        if self.last_percent.take().is_some() {
            let _ = write!(io::stderr(), "{}", self.line_end());
        }
    }
}

fn is_cancel_key(key: KeyEvent) -> bool {
    if key.kind != KeyEventKind::Press {
        return false;
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => true,
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_keys() {
        let press = |code, modifiers| KeyEvent::new(code, modifiers);
        assert!(is_cancel_key(press(KeyCode::Char('q'), KeyModifiers::NONE)));
        assert!(is_cancel_key(press(KeyCode::Esc, KeyModifiers::NONE)));
        assert!(is_cancel_key(press(KeyCode::Char('c'), KeyModifiers::CONTROL)));
        assert!(!is_cancel_key(press(KeyCode::Char('c'), KeyModifiers::NONE)));
        assert!(!is_cancel_key(press(KeyCode::Enter, KeyModifiers::NONE)));
    }
}
