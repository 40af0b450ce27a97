//! Bounded FIFO of bytes waiting to be written to a socket
//!
//! Used for the per-connection outbox of control frames and for the unsent
//! tail of a download chunk that hit backpressure.

use bytes::{Buf, BytesMut};
use std::io::{self, Write};

/// Result of draining a queue into a non-blocking writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drain {
    /// Bytes accepted by the writer during this call
    pub written: usize,
    /// `true` when the queue is now empty
    pub complete: bool,
}

#[derive(Debug)]
pub struct ByteQueue {
    buf: BytesMut,
    limit: usize,
}

impl ByteQueue {
    /// Create a queue that refuses to hold more than `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit.min(64 * 1024)),
            limit,
        }
    }

    /// Append bytes, failing without modification if the limit would be exceeded
    pub fn push(&mut self, data: &[u8]) -> io::Result<()> {
        if self.buf.len() + data.len() > self.limit {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!(
                    "byte queue limit exceeded: {} queued + {} new > {}",
                    self.buf.len(),
                    data.len(),
                    self.limit
                ),
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Write as much as the writer accepts without blocking.
    ///
    /// `WouldBlock` ends the call with `complete: false`; `Interrupted` is
    /// retried. Any other error is returned and the unsent bytes stay queued.
    pub fn drain_into<W: Write>(&mut self, writer: &mut W) -> io::Result<Drain> {
        let mut written = 0;
        while !self.buf.is_empty() {
            match writer.write(&self.buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "peer stopped accepting data",
                    ));
                }
                Ok(n) => {
                    self.buf.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Drain {
                        written,
                        complete: false,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Drain {
            written,
            complete: true,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_io::*;
    use super::*;

    #[test]
    fn test_push_respects_limit() {
        let mut queue = ByteQueue::with_limit(8);
        queue.push(b"12345").unwrap();
        assert!(queue.push(b"6789").is_err());
        assert_eq!(queue.len(), 5);
        queue.push(b"678").unwrap();
        assert_eq!(queue.len(), 8);

        let mut writer = ScriptedWriter::default();
        queue.drain_into(&mut writer).unwrap();
        assert_eq!(writer.written, b"12345678");
    }

    #[test]
    fn test_drain_stops_on_would_block_and_resumes() {
        let mut queue = ByteQueue::with_limit(64);
        queue.push(b"hello world").unwrap();

        let mut writer = ScriptedWriter::new([
            WriteStep::Accept(3),
            WriteStep::Interrupted,
            WriteStep::Accept(2),
            WriteStep::WouldBlock,
        ]);
        let drain = queue.drain_into(&mut writer).unwrap();
        assert_eq!(drain, Drain { written: 5, complete: false });
        assert_eq!(queue.len(), 6);
        assert_eq!(writer.written, b"hello");

        let drain = queue.drain_into(&mut writer).unwrap();
        assert_eq!(drain, Drain { written: 6, complete: true });
        assert_eq!(writer.written, b"hello world");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_propagates_hard_errors() {
        let mut queue = ByteQueue::with_limit(64);
        queue.push(b"data").unwrap();
        let mut writer = ScriptedWriter::new([WriteStep::Fail(io::ErrorKind::BrokenPipe)]);
        let err = queue.drain_into(&mut writer).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(queue.len(), 4);
    }
}
