//! Units of work and the messages workers send back to the event loop

use crate::connection::Connection;
use mio::{Interest, Waker};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use tracing::warn;

/// What a readiness event means for the connection it arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Read and handle control frames
    ControlMessage,
    /// Pull more raw upload bytes
    ContinueUpload,
    /// Push more raw download bytes
    ContinueDownload,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub kind: TaskKind,
    pub conn: Arc<Connection>,
}

impl Task {
    pub fn new(kind: TaskKind, conn: Arc<Connection>) -> Self {
        Self { kind, conn }
    }
}

/// How the event loop should proceed once a task is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Keep the connection registered with this interest. `rerun` asks for
    /// another task right away, for work that no readiness edge will announce.
    Watch { interest: Interest, rerun: bool },
    /// Deregister and close
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The task for `id` returned
    Done { id: u64, next: Next },
    /// Another connection posted to `id`'s mailbox
    Notify { id: u64 },
}

/// Worker side of the channel into the event loop
#[derive(Clone)]
pub struct Notifier {
    tx: Sender<Signal>,
    waker: Arc<Waker>,
}

impl Notifier {
    pub fn new(tx: Sender<Signal>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    pub fn send(&self, signal: Signal) {
        if self.tx.send(signal).is_err() {
            // Event loop already gone; nothing left to tell
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!(event = "waker_failed", error = %e, "Failed to wake event loop");
        }
    }
}
