//! Per-connection transfer state machines
//!
//! A session survives across readiness events: each `advance` call moves as
//! many bytes as the socket allows, records where it stopped and returns.
//! Would-block is never an error here; it is how a call ends early.

pub mod download;
pub mod upload;

pub use download::{DownloadProgress, DownloadSession};
pub use upload::{UploadProgress, UploadSession};

use std::io;
use thiserror::Error;

/// Failure of a transfer step
#[derive(Error, Debug)]
pub enum SessionError {
    /// Peer closed the connection mid-transfer
    #[error("peer disconnected")]
    Disconnected,

    /// Socket failed with something other than would-block
    #[error("network error: {0}")]
    Network(#[source] io::Error),

    /// Opening, reading or writing the local file failed
    #[error("filesystem error: {0}")]
    Filesystem(#[source] io::Error),
}

/// Which transfer, if any, owns the connection's byte stream
#[derive(Debug, Default)]
pub enum Transfer {
    #[default]
    Idle,
    Upload(UploadSession),
    Download(DownloadSession),
}

impl Transfer {
    pub fn is_idle(&self) -> bool {
        matches!(self, Transfer::Idle)
    }
}
