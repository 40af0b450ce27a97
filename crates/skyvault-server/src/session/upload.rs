use super::SessionError;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Outcome of an upload step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadProgress {
    /// Socket drained, more bytes expected
    Pending,
    /// `received == filesize`
    Complete,
}

/// Receives exactly `filesize` raw bytes into the destination file.
///
/// The size is the one the client declared when starting the upload; the
/// destination file is freshly truncated, so nothing derived from it could
/// be more authoritative.
#[derive(Debug)]
pub struct UploadSession {
    path: PathBuf,
    /// `None` once closed, after completion or failure
    file: Option<File>,
    filesize: u64,
    received: u64,
    /// A write failed; the rest of the declared size is read and dropped
    failed: bool,
}

impl UploadSession {
    /// Create or truncate `path` and expect `filesize` bytes
    pub fn create(path: &Path, filesize: u64) -> io::Result<Self> {
        let file = open_destination(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            filesize,
            received: 0,
            failed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filesize(&self) -> u64 {
        self.filesize
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn remaining(&self) -> u64 {
        self.filesize - self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.filesize
    }

    /// `true` once a write failed and the rest of the stream is being dropped
    pub fn is_discarding(&self) -> bool {
        self.failed
    }

    /// Accept bytes that were already read off the socket.
    ///
    /// # Returns
    ///
    /// How many bytes were consumed; never more than [`remaining`](Self::remaining).
    pub fn ingest(&mut self, data: &[u8]) -> Result<usize, SessionError> {
        let take = data.len().min(usize::try_from(self.remaining()).unwrap_or(usize::MAX));
        if take == 0 {
            return Ok(0);
        }
        self.store(&data[..take])?;
        Ok(take)
    }

    /// Read from a non-blocking socket until it would block or the upload is complete.
    ///
    /// Reads are capped at the remaining size so bytes belonging to the next
    /// control frame stay in the socket.
    pub fn advance<R: Read>(
        &mut self,
        reader: &mut R,
        buf: &mut [u8],
    ) -> Result<UploadProgress, SessionError> {
        loop {
            if self.is_complete() {
                self.finish();
                return Ok(UploadProgress::Complete);
            }

            let want = buf
                .len()
                .min(usize::try_from(self.remaining()).unwrap_or(usize::MAX));
            match reader.read(&mut buf[..want]) {
                Ok(0) => {
                    self.file = None;
                    return Err(SessionError::Disconnected);
                }
                Ok(n) => self.store(&buf[..n])?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(UploadProgress::Pending);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.file = None;
                    return Err(SessionError::Network(e));
                }
            }
        }
    }

    /// Write one received chunk; a short write is fatal for the file
    fn store(&mut self, chunk: &[u8]) -> Result<(), SessionError> {
        // Count first: the bytes left the socket whether or not they reach disk
        self.received += chunk.len() as u64;

        if self.failed {
            return Ok(());
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let error = match file.write(chunk) {
            Ok(n) if n == chunk.len() => return Ok(()),
            Ok(n) => io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", n, chunk.len()),
            ),
            Err(e) => e,
        };
        self.file = None;
        self.failed = true;
        Err(SessionError::Filesystem(error))
    }

    /// Flush and close the destination
    fn finish(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }
}

#[cfg(unix)]
fn open_destination(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_destination(path: &Path) -> io::Result<File> {
    File::create(path)
}
