//! Background lookup of build summaries.
//!
//! Summaries are only used for display, so they are fetched on a worker
//! thread while the caller carries on. The worker hands its result back over
//! a channel once; a caller that never collects it simply drops it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::BuildInfo;
use crate::extract::SummaryExtractor;
use crate::http::Transport;

pub type Summaries = HashMap<String, BuildInfo>;

pub struct SummaryHandle {
    rx: Option<Receiver<Summaries>>,
}

impl SummaryHandle {
    /// A handle that yields no summaries.
    pub fn empty() -> Self {
        Self { rx: None }
    }

    /// The summaries, if the worker has finished.
    pub fn try_take(&mut self) -> Option<Summaries> {
        let rx = self.rx.as_ref()?;
        match rx.try_recv() {
            Ok(summaries) => {
                self.rx = None;
                Some(summaries)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.rx = None;
                None
            }
        }
    }

    /// Block for at most `timeout` for the summaries.
    pub fn wait(mut self, timeout: Duration) -> Summaries {
        let Some(rx) = self.rx.take() else {
            return Summaries::new();
        };
        match rx.recv_timeout(timeout) {
            Ok(summaries) => summaries,
            Err(RecvTimeoutError::Timeout) => {
                debug!("build summaries not ready, continuing without them");
                Summaries::new()
            }
            Err(RecvTimeoutError::Disconnected) => Summaries::new(),
        }
    }
}

/// Run every enricher on a worker thread. Failing enrichers are logged and
/// skipped; later enrichers win when keys collide.
pub fn spawn(enrichers: Vec<Arc<dyn SummaryExtractor>>, transport: Arc<dyn Transport>) -> SummaryHandle {
    if enrichers.is_empty() {
        return SummaryHandle::empty();
    }
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut summaries = Summaries::new();
        for enricher in &enrichers {
            match enricher.summaries(transport.as_ref()) {
                Ok(found) => summaries.extend(found),
                Err(err) => warn!(enricher = ?enricher, error = %err, "build summaries unavailable"),
            }
        }
        debug!(count = summaries.len(), "build summaries ready");
        let _ = tx.send(summaries);
    });
    SummaryHandle { rx: Some(rx) }
}
