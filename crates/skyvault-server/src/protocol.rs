//! Wire protocol
//!
//! Every control message in either direction is a frame:
//!
//! ```text
//! [u32 big-endian payload length N][N bytes of UTF-8 JSON]
//! ```
//!
//! The JSON object carries a `type` field naming the message. File contents
//! travel outside this framing: after `ready_to_receive` the client streams
//! exactly `size` raw bytes, and after `ready_to_send` the server does.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Length of the frame header
pub const HEADER_LEN: usize = 4;

/// Client to server messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Login {
        username: String,
        password: String,
    },
    Register {
        username: String,
        password: String,
    },
    List {
        #[serde(default = "root_path")]
        path: String,
    },
    Upload {
        filename: String,
        #[serde(deserialize_with = "lenient_size")]
        size: u64,
        #[serde(default = "root_path")]
        path: String,
    },
    Download {
        filename: String,
        #[serde(default = "root_path")]
        path: String,
    },
    /// Client is ready for the raw bytes of the prepared download
    ReadyToReceive,
    Delete {
        filename: String,
        #[serde(default = "root_path")]
        path: String,
    },
    Share {
        recipient: String,
        filename: String,
        #[serde(default = "root_path")]
        path: String,
    },
    ShareResponse {
        share_id: i64,
        action: ShareAction,
    },
    HistoryQuery,
}

fn root_path() -> String {
    "/".to_string()
}

/// Sizes arrive as JSON numbers; some clients emit integral floats
fn lenient_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = Value::deserialize(deserializer)?;
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    match value.as_f64() {
        Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
        _ => Err(D::Error::custom(format!(
            "size must be a non-negative integer, got {value}"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareAction {
    Accept,
    Reject,
}

/// Request kinds, known independently of whether their fields parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Login,
    Register,
    List,
    Upload,
    Download,
    ReadyToReceive,
    Delete,
    Share,
    ShareResponse,
    HistoryQuery,
}

impl RequestKind {
    pub fn from_type(name: &str) -> Option<Self> {
        Some(match name {
            "login" => RequestKind::Login,
            "register" => RequestKind::Register,
            "list" => RequestKind::List,
            "upload" => RequestKind::Upload,
            "download" => RequestKind::Download,
            "ready_to_receive" => RequestKind::ReadyToReceive,
            "delete" => RequestKind::Delete,
            "share" => RequestKind::Share,
            "share_response" => RequestKind::ShareResponse,
            "history_query" => RequestKind::HistoryQuery,
            _ => return None,
        })
    }

    /// The `success:false` reply a client expects for this kind of request
    pub fn failure(self, message: impl Into<String>) -> Response {
        let message = message.into();
        match self {
            RequestKind::Login => Response::LoginResult {
                success: false,
                message,
            },
            RequestKind::Register => Response::RegisterResult {
                success: false,
                message,
            },
            RequestKind::List => Response::FileList {
                success: false,
                files: Vec::new(),
                message: Some(message),
            },
            RequestKind::Upload => Response::UploadResult {
                success: false,
                message,
            },
            RequestKind::Download | RequestKind::ReadyToReceive => Response::DownloadResult {
                success: false,
                message,
            },
            RequestKind::Delete => Response::DeleteResult {
                success: false,
                message,
            },
            RequestKind::Share | RequestKind::ShareResponse => Response::ShareResult {
                success: false,
                message,
            },
            RequestKind::HistoryQuery => Response::HistoryResult {
                success: false,
                records: Vec::new(),
                message: Some(message),
            },
        }
    }
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Login { .. } => RequestKind::Login,
            Request::Register { .. } => RequestKind::Register,
            Request::List { .. } => RequestKind::List,
            Request::Upload { .. } => RequestKind::Upload,
            Request::Download { .. } => RequestKind::Download,
            Request::ReadyToReceive => RequestKind::ReadyToReceive,
            Request::Delete { .. } => RequestKind::Delete,
            Request::Share { .. } => RequestKind::Share,
            Request::ShareResponse { .. } => RequestKind::ShareResponse,
            Request::HistoryQuery => RequestKind::HistoryQuery,
        }
    }
}

/// Why a complete frame could not become a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Not JSON, not an object, or no string `type`
    Malformed(String),
    /// `type` names nothing this server handles
    UnknownType(String),
    /// A known request with missing or mistyped fields
    InvalidFields { kind: RequestKind, message: String },
}

impl RequestError {
    /// Reply owed to the client for this failure
    pub fn response(&self) -> Response {
        match self {
            RequestError::Malformed(message) => Response::Error {
                message: format!("Malformed request: {message}"),
            },
            RequestError::UnknownType(name) => Response::Error {
                message: format!("Unknown request type: {name}"),
            },
            RequestError::InvalidFields { kind, message } => {
                kind.failure(format!("Invalid request: {message}"))
            }
        }
    }
}

/// Decode one frame payload
pub fn parse_request(payload: &[u8]) -> Result<Request, RequestError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| RequestError::Malformed(e.to_string()))?;

    let type_name = value
        .as_object()
        .ok_or_else(|| RequestError::Malformed("expected a JSON object".to_string()))?
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| RequestError::Malformed("missing type field".to_string()))?
        .to_string();

    let kind = RequestKind::from_type(&type_name)
        .ok_or_else(|| RequestError::UnknownType(type_name.clone()))?;

    serde_json::from_value(value).map_err(|e| RequestError::InvalidFields {
        kind,
        message: e.to_string(),
    })
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
}

/// One row of a history reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub filename: String,
    pub operation: String,
    /// `%Y-%m-%d %H:%M:%S`, UTC
    pub time: String,
    pub status: String,
}

/// A share awaiting the recipient's decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareNotice {
    pub id: i64,
    pub owner: String,
    pub filename: String,
}

/// Server to client messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    LoginResult {
        success: bool,
        message: String,
    },
    RegisterResult {
        success: bool,
        message: String,
    },
    FileList {
        success: bool,
        #[serde(default)]
        files: Vec<FileEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ReadyToReceive,
    UploadProgress {
        success: bool,
        /// Whole percent, 100 only when complete
        progress: u64,
        received: u64,
        total: u64,
    },
    UploadResult {
        success: bool,
        message: String,
    },
    DownloadMeta {
        filename: String,
        size: u64,
        is_directory: bool,
    },
    ReadyToSend,
    DownloadResult {
        success: bool,
        message: String,
    },
    DeleteResult {
        success: bool,
        message: String,
    },
    ShareResult {
        success: bool,
        message: String,
    },
    /// Pushed to an online recipient when a share is created
    ShareRequest {
        id: i64,
        owner: String,
        filename: String,
    },
    /// Pushed after login when shares are waiting
    PendingShares {
        shares: Vec<ShareNotice>,
    },
    HistoryResult {
        success: bool,
        #[serde(default)]
        records: Vec<HistoryEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
    },
}

impl Response {
    /// Unsolicited messages a client may see between request and reply
    pub fn is_notification(&self) -> bool {
        matches!(
            self,
            Response::ShareRequest { .. } | Response::PendingShares { .. }
        )
    }
}

/// Integer progress percentage; exactly 100 only when `received == total`
pub fn progress_percent(received: u64, total: u64) -> u64 {
    if received >= total {
        return 100;
    }
    let pct = (received as u128 * 100) / total as u128;
    // Never report completion early
    (pct as u64).min(99)
}

/// Framing and incremental decoding
pub mod codec {
    use bytes::{Buf, BufMut, Bytes, BytesMut};
    use serde::Serialize;

    use super::HEADER_LEN;

    /// Serialize `message` and wrap it in a frame
    pub fn encode_frame<T: Serialize>(message: &T) -> crate::Result<Vec<u8>> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| crate::Error::Protocol(format!("Failed to encode message: {e}")))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| crate::Error::Protocol("Message too large to frame".into()))?;

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.put_u32(len);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Accumulates socket bytes and yields complete frame payloads.
    ///
    /// Tolerates frames split across reads and several frames in one read.
    #[derive(Debug)]
    pub struct FrameDecoder {
        buf: BytesMut,
        max_frame: usize,
    }

    impl FrameDecoder {
        pub fn new(max_frame: usize) -> Self {
            Self {
                buf: BytesMut::with_capacity(4096),
                max_frame,
            }
        }

        pub fn extend(&mut self, data: &[u8]) {
            self.buf.extend_from_slice(data);
        }

        /// Next complete payload, or `None` until `4 + len` bytes are buffered.
        ///
        /// An oversized length prefix is fatal: the stream can no longer be
        /// split into frames.
        pub fn next_frame(&mut self) -> crate::Result<Option<Bytes>> {
            if self.buf.len() < HEADER_LEN {
                return Ok(None);
            }

            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if len > self.max_frame {
                return Err(crate::Error::Protocol(format!(
                    "Frame of {} bytes exceeds limit of {}",
                    len, self.max_frame
                )));
            }
            if self.buf.len() < HEADER_LEN + len {
                return Ok(None);
            }

            self.buf.advance(HEADER_LEN);
            Ok(Some(self.buf.split_to(len).freeze()))
        }

        /// Remove up to `max` buffered bytes that are not framed (upload data
        /// that arrived in the same read as its control frame)
        pub fn take_raw(&mut self, max: usize) -> Bytes {
            let n = max.min(self.buf.len());
            self.buf.split_to(n).freeze()
        }

        pub fn buffered(&self) -> usize {
            self.buf.len()
        }

        /// Length announced by the bytes at the head of the buffer
        pub fn peek_len(&self) -> Option<usize> {
            let header = self.buf.get(..HEADER_LEN)?;
            Some(u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize)
        }

        /// Payload of the frame at the head of the buffer, left in place
        pub fn peek_frame(&self) -> Option<&[u8]> {
            let len = self.peek_len()?;
            if len == 0 || len > self.max_frame {
                return None;
            }
            self.buf.get(HEADER_LEN..HEADER_LEN + len)
        }
    }
}
