use super::SessionError;
use crate::byte_queue::ByteQueue;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Outcome of a download step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadProgress {
    /// The socket stopped accepting bytes; wait for the next writable event
    Blocked,
    /// Every byte of the file has been handed to the socket
    Complete,
}

/// Streams a file to a non-blocking socket across many writable events.
///
/// Invariant between calls: `offset == total_sent + remainder.len()`. The
/// file position has moved past every byte in the remainder, so the
/// remainder always goes out before anything new is read.
#[derive(Debug)]
pub struct DownloadSession {
    path: PathBuf,
    /// Opened lazily on the first step
    file: Option<File>,
    total: u64,
    offset: u64,
    total_sent: u64,
    remainder: ByteQueue,
    scratch: Vec<u8>,
    announced: bool,
}

impl DownloadSession {
    /// Prepare to send `total` bytes of `path` in chunks of `chunk_size`
    pub fn new(path: &Path, total: u64, chunk_size: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
            total,
            offset: 0,
            total_sent: 0,
            remainder: ByteQueue::with_limit(chunk_size),
            scratch: vec![0u8; chunk_size],
            announced: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    pub fn pending_len(&self) -> usize {
        self.remainder.len()
    }

    pub fn is_complete(&self) -> bool {
        self.total_sent >= self.total && self.remainder.is_empty()
    }

    /// Whether `ready_to_send` has been queued for this session
    pub fn is_announced(&self) -> bool {
        self.announced
    }

    pub fn mark_announced(&mut self) {
        self.announced = true;
    }

    /// Open the file at `offset` unless it is already open.
    ///
    /// A file that has shrunk below the announced size since `download_meta`
    /// is reported here, before any raw byte can be sent.
    pub fn open(&mut self) -> Result<(), SessionError> {
        if self.file.is_some() {
            return Ok(());
        }
        let mut file = File::open(&self.path).map_err(SessionError::Filesystem)?;
        let len = file.metadata().map_err(SessionError::Filesystem)?.len();
        if len < self.total {
            return Err(SessionError::Filesystem(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file is {} bytes, {} were announced", len, self.total),
            )));
        }
        file.seek(SeekFrom::Start(self.offset))
            .map_err(SessionError::Filesystem)?;
        self.file = Some(file);
        Ok(())
    }

    /// Send until the socket would block or the file is exhausted
    pub fn advance<W: Write>(&mut self, writer: &mut W) -> Result<DownloadProgress, SessionError> {
        self.open()?;

        // Finish the chunk interrupted by the last would-block first
        if !self.remainder.is_empty() {
            let drain = self
                .remainder
                .drain_into(writer)
                .map_err(|e| self.abort(SessionError::Network(e)))?;
            self.total_sent += drain.written as u64;
            if !drain.complete {
                return Ok(DownloadProgress::Blocked);
            }
        }

        while self.total_sent < self.total {
            let want = (self.total - self.offset).min(self.scratch.len() as u64) as usize;
            let Some(file) = self.file.as_mut() else {
                break;
            };
            let read_len = match file.read(&mut self.scratch[..want]) {
                Ok(0) => {
                    let err = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "file ended at {} of {} bytes",
                            self.offset, self.total
                        ),
                    );
                    return Err(self.abort(SessionError::Filesystem(err)));
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.abort(SessionError::Filesystem(e))),
            };
            self.offset += read_len as u64;

            let mut written = 0;
            while written < read_len {
                match writer.write(&self.scratch[written..read_len]) {
                    Ok(0) => {
                        let err = io::Error::new(
                            io::ErrorKind::WriteZero,
                            "peer stopped accepting data",
                        );
                        return Err(self.abort(SessionError::Network(err)));
                    }
                    Ok(n) => {
                        // A partial send is not backpressure; retry the rest at once
                        written += n;
                        self.total_sent += n as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if let Err(e) = self.remainder.push(&self.scratch[written..read_len]) {
                            return Err(self.abort(SessionError::Network(e)));
                        }
                        return Ok(DownloadProgress::Blocked);
                    }
                    Err(e) => return Err(self.abort(SessionError::Network(e))),
                }
            }
        }

        self.file = None;
        Ok(DownloadProgress::Complete)
    }

    /// Close the file and drop unsent bytes
    fn abort(&mut self, err: SessionError) -> SessionError {
        self.file = None;
        self.remainder.clear();
        err
    }
}
