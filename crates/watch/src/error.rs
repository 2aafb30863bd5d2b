//! Errors reported to subscribers, and the queue that carries them.

use std::fmt;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;
use vink_api::TransportError;
use vink_core::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The list-watch stream failed or could not be opened.
    Transport,
    /// A cascade point lookup failed.
    Lookup,
    /// One stream item could not be decoded; the rest of the envelope was applied.
    Malformed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Lookup => "lookup",
            ErrorKind::Malformed => "malformed",
        })
    }
}

/// One reported failure, attributed to the resource type it concerns.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{resource} {kind} error: {message}")]
pub struct WatchError {
    /// Resource label (`VirtualMachine`, `Node`, ...).
    pub resource: &'static str,
    pub kind: ErrorKind,
    pub message: String,
    pub session: Uuid,
}

impl WatchError {
    pub fn transport(resource: &'static str, session: Uuid, err: &TransportError) -> Self {
        Self { resource, kind: ErrorKind::Transport, message: err.to_string(), session }
    }

    pub fn lookup(resource: &'static str, session: Uuid, err: &TransportError) -> Self {
        Self { resource, kind: ErrorKind::Lookup, message: err.to_string(), session }
    }

    pub fn malformed(resource: &'static str, session: Uuid, err: &DecodeError) -> Self {
        Self { resource, kind: ErrorKind::Malformed, message: err.to_string(), session }
    }
}

/// Receiving end of a subscription's error queue.
#[derive(Debug)]
pub struct ErrorQueue {
    rx: mpsc::Receiver<WatchError>,
}

impl ErrorQueue {
    pub(crate) fn channel(cap: usize) -> (mpsc::Sender<WatchError>, ErrorQueue) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        (tx, ErrorQueue { rx })
    }

    /// Wait for the next error. `None` once every session is gone and the queue is empty.
    pub async fn recv(&mut self) -> Option<WatchError> { self.rx.recv().await }

    pub fn try_recv(&mut self) -> Option<WatchError> { self.rx.try_recv().ok() }

    /// Take everything queued right now.
    pub fn drain(&mut self) -> Vec<WatchError> {
        let mut out = Vec::new();
        while let Ok(e) = self.rx.try_recv() { out.push(e); }
        out
    }
}

/// Non-blocking report; a full queue drops the error (counted).
pub(crate) fn report(tx: &mpsc::Sender<WatchError>, err: WatchError) {
    if let Err(mpsc::error::TrySendError::Full(e)) = tx.try_send(err) {
        counter!("watch_errors_dropped_total", 1u64, "resource" => e.resource);
        warn!(resource = %e.resource, kind = %e.kind, "error queue full; dropping error");
    }
}
