//! Blocking protocol client
//!
//! Speaks the same framing as the server over a plain `std` socket. Used by
//! the `skyvault-client` binary and by the integration tests.

use crate::protocol::codec::{FrameDecoder, encode_frame};
use crate::protocol::{FileEntry, HEADER_LEN, HistoryEntry, Request, Response, ShareAction};
use crate::{Error, Result};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const READ_CHUNK: usize = 64 * 1024;
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// `success` and `message` of a `*_result` reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub success: bool,
    pub message: String,
}

/// Everything the server said about one upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// `(received, total, percent)` for every progress frame, in order
    pub progress: Vec<(u64, u64, u64)>,
    pub result: Reply,
}

/// Bytes and verdict of one download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub size: u64,
    pub data: Vec<u8>,
    pub result: Reply,
}

pub struct Client {
    stream: TcpStream,
    decoder: FrameDecoder,
    buf: Vec<u8>,
    /// Unsolicited frames seen while waiting for replies
    notifications: Vec<Response>,
}

impl Client {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        info!(peer = ?stream.peer_addr().ok(), "Connected");
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(MAX_FRAME),
            buf: vec![0u8; READ_CHUNK],
            notifications: Vec::new(),
        })
    }

    /// Bound every blocking read; `None` waits forever
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn send(&mut self, request: &Request) -> Result<()> {
        let frame = encode_frame(request)?;
        self.stream.write_all(&frame)?;
        Ok(())
    }

    /// Frame arbitrary bytes as a payload
    pub fn send_payload(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::protocol("Payload too large to frame"))?;
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(payload)?;
        Ok(())
    }

    /// Write bytes as they are, outside any frame
    pub fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data)?;
        Ok(())
    }

    /// Next frame from the server, notifications included
    pub fn recv(&mut self) -> Result<Response> {
        loop {
            if let Some(payload) = self.decoder.next_frame()? {
                return serde_json::from_slice(&payload)
                    .map_err(|e| Error::protocol(format!("Bad response frame: {e}")));
            }
            let n = self.stream.read(&mut self.buf)?;
            if n == 0 {
                return Err(Error::Connection("Server closed the connection".into()));
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }

    /// Next frame that is not a notification
    pub fn recv_reply(&mut self) -> Result<Response> {
        loop {
            let response = self.recv()?;
            if response.is_notification() {
                debug!(notification = ?response, "Notification received");
                self.notifications.push(response);
                continue;
            }
            return Ok(response);
        }
    }

    /// Send one request and wait for its reply
    pub fn request(&mut self, request: &Request) -> Result<Response> {
        self.send(request)?;
        self.recv_reply()
    }

    /// Notifications collected so far
    pub fn take_notifications(&mut self) -> Vec<Response> {
        std::mem::take(&mut self.notifications)
    }

    /// Block until a notification arrives, returning collected ones first
    pub fn wait_notification(&mut self) -> Result<Response> {
        if !self.notifications.is_empty() {
            return Ok(self.notifications.remove(0));
        }
        loop {
            let response = self.recv()?;
            if response.is_notification() {
                return Ok(response);
            }
            debug!(response = ?response, "Ignoring reply while waiting for a notification");
        }
    }

    pub fn register(&mut self, username: &str, password: &str) -> Result<Reply> {
        let response = self.request(&Request::Register {
            username: username.to_string(),
            password: password.to_string(),
        })?;
        match response {
            Response::RegisterResult { success, message } => Ok(Reply { success, message }),
            other => Err(unexpected("register_result", &other)),
        }
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<Reply> {
        let response = self.request(&Request::Login {
            username: username.to_string(),
            password: password.to_string(),
        })?;
        match response {
            Response::LoginResult { success, message } => Ok(Reply { success, message }),
            other => Err(unexpected("login_result", &other)),
        }
    }

    pub fn list(&mut self, path: &str) -> Result<Vec<FileEntry>> {
        let response = self.request(&Request::List {
            path: path.to_string(),
        })?;
        match response {
            Response::FileList {
                success: true,
                files,
                ..
            } => Ok(files),
            Response::FileList { message, .. } => Err(Error::Other(
                message.unwrap_or_else(|| "List failed".to_string()),
            )),
            other => Err(unexpected("file_list", &other)),
        }
    }

    /// Upload `data` as `<path>/<filename>`
    pub fn upload(&mut self, path: &str, filename: &str, data: &[u8]) -> Result<UploadReport> {
        let response = self.request(&Request::Upload {
            filename: filename.to_string(),
            size: data.len() as u64,
            path: path.to_string(),
        })?;
        match response {
            Response::ReadyToReceive => {}
            Response::UploadResult { success, message } => {
                return Ok(UploadReport {
                    progress: Vec::new(),
                    result: Reply { success, message },
                });
            }
            other => return Err(unexpected("ready_to_receive", &other)),
        }

        self.stream.write_all(data)?;

        let mut progress = Vec::new();
        loop {
            match self.recv_reply()? {
                Response::UploadProgress {
                    success: true,
                    progress: percent,
                    received,
                    total,
                } => progress.push((received, total, percent)),
                Response::UploadProgress { success: false, .. } => {
                    return Err(Error::Connection("Upload aborted by the server".into()));
                }
                Response::UploadResult { success, message } => {
                    return Ok(UploadReport {
                        progress,
                        result: Reply { success, message },
                    });
                }
                other => return Err(unexpected("upload_progress", &other)),
            }
        }
    }

    /// Upload a local file under its own name
    pub fn upload_file(&mut self, local: &Path, remote_dir: &str) -> Result<UploadReport> {
        let filename = local
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Other(format!("{} has no file name", local.display())))?;
        let data = std::fs::read(local)?;
        self.upload(remote_dir, &filename, &data)
    }

    pub fn download(&mut self, path: &str, filename: &str) -> Result<DownloadReport> {
        let response = self.request(&Request::Download {
            filename: filename.to_string(),
            path: path.to_string(),
        })?;
        let size = match response {
            Response::DownloadMeta { size, .. } => size,
            Response::DownloadResult { success, message } => {
                return Ok(DownloadReport {
                    size: 0,
                    data: Vec::new(),
                    result: Reply { success, message },
                });
            }
            other => return Err(unexpected("download_meta", &other)),
        };

        match self.request(&Request::ReadyToReceive)? {
            Response::ReadyToSend => {}
            Response::DownloadResult { success, message } => {
                return Ok(DownloadReport {
                    size,
                    data: Vec::new(),
                    result: Reply { success, message },
                });
            }
            other => return Err(unexpected("ready_to_send", &other)),
        }

        if let Some(result) = self.result_in_place_of_data(size)? {
            return Ok(DownloadReport {
                size,
                data: Vec::new(),
                result,
            });
        }
        let data = self.read_raw(size)?;
        match self.recv_reply()? {
            Response::DownloadResult { success, message } => Ok(DownloadReport {
                size,
                data,
                result: Reply { success, message },
            }),
            other => Err(unexpected("download_result", &other)),
        }
    }

    pub fn delete(&mut self, path: &str, filename: &str) -> Result<Reply> {
        let response = self.request(&Request::Delete {
            filename: filename.to_string(),
            path: path.to_string(),
        })?;
        match response {
            Response::DeleteResult { success, message } => Ok(Reply { success, message }),
            other => Err(unexpected("delete_result", &other)),
        }
    }

    pub fn share(&mut self, recipient: &str, path: &str, filename: &str) -> Result<Reply> {
        let response = self.request(&Request::Share {
            recipient: recipient.to_string(),
            filename: filename.to_string(),
            path: path.to_string(),
        })?;
        share_reply(response)
    }

    pub fn respond_share(&mut self, share_id: i64, action: ShareAction) -> Result<Reply> {
        let response = self.request(&Request::ShareResponse { share_id, action })?;
        share_reply(response)
    }

    pub fn history(&mut self) -> Result<Vec<HistoryEntry>> {
        match self.request(&Request::HistoryQuery)? {
            Response::HistoryResult {
                success: true,
                records,
                ..
            } => Ok(records),
            Response::HistoryResult { message, .. } => Err(Error::Other(
                message.unwrap_or_else(|| "History query failed".to_string()),
            )),
            other => Err(unexpected("history_result", &other)),
        }
    }

    pub fn disconnect(self) -> Result<()> {
        self.stream.shutdown(Shutdown::Both)?;
        Ok(())
    }

    /// A `download_result` frame sent where `size` raw bytes were expected.
    ///
    /// The next bytes count as that frame only if they parse as one. Reads
    /// stop at what is certain to arrive either way: the frame itself, or the
    /// data followed by the closing frame.
    fn result_in_place_of_data(&mut self, size: u64) -> Result<Option<Reply>> {
        if size == 0 {
            return Ok(None);
        }
        let closing = encode_frame(&Response::DownloadResult {
            success: true,
            message: String::new(),
        })?
        .len();
        let guaranteed = usize::try_from(size)
            .unwrap_or(usize::MAX)
            .saturating_add(closing);

        self.fill(HEADER_LEN)?;
        let Some(len) = self.decoder.peek_len() else {
            return Ok(None);
        };
        let needed = HEADER_LEN.saturating_add(len);
        if len == 0 || len > MAX_FRAME || needed > guaranteed {
            return Ok(None);
        }
        self.fill(needed)?;

        let parsed = self
            .decoder
            .peek_frame()
            .and_then(|payload| serde_json::from_slice::<Response>(payload).ok());
        match parsed {
            Some(Response::DownloadResult { success, message }) => {
                self.decoder.next_frame()?;
                Ok(Some(Reply { success, message }))
            }
            _ => Ok(None),
        }
    }

    /// Read until at least `n` bytes are buffered
    fn fill(&mut self, n: usize) -> Result<()> {
        while self.decoder.buffered() < n {
            let want = (n - self.decoder.buffered()).min(self.buf.len());
            let read = self.stream.read(&mut self.buf[..want])?;
            if read == 0 {
                return Err(Error::Connection("Server closed the connection".into()));
            }
            self.decoder.extend(&self.buf[..read]);
        }
        Ok(())
    }

    /// Exactly `size` raw bytes, starting with any already buffered
    fn read_raw(&mut self, size: u64) -> Result<Vec<u8>> {
        let size = usize::try_from(size).map_err(|_| Error::protocol("Download too large"))?;
        let mut data = Vec::with_capacity(size);
        data.extend_from_slice(&self.decoder.take_raw(size));

        while data.len() < size {
            let want = (size - data.len()).min(self.buf.len());
            let n = self.stream.read(&mut self.buf[..want])?;
            if n == 0 {
                return Err(Error::Connection(format!(
                    "Connection closed after {} of {} bytes",
                    data.len(),
                    size
                )));
            }
            data.extend_from_slice(&self.buf[..n]);
        }
        Ok(data)
    }
}

fn share_reply(response: Response) -> Result<Reply> {
    match response {
        Response::ShareResult { success, message } => Ok(Reply { success, message }),
        other => Err(unexpected("share_result", &other)),
    }
}

fn unexpected(expected: &str, got: &Response) -> Error {
    Error::protocol(format!("Expected {expected}, got {got:?}"))
}
