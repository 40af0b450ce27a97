//! Per-client connection state
//!
//! A [`Connection`] is shared between the event loop (which owns its
//! registration) and whichever worker is running a task for it. The event
//! loop never runs two tasks for one connection at a time, so the state
//! mutex is uncontended in practice; it exists to make the hand-off between
//! workers explicit.

use crate::byte_queue::ByteQueue;
use crate::config::Config;
use crate::protocol::Response;
use crate::protocol::codec::FrameDecoder;
use crate::session::{DownloadSession, Transfer};
use mio::Interest;
use mio::net::TcpStream;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;
use tracing::debug;

/// What the byte stream of a connection currently carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Control frames in both directions
    Idle = 0,
    /// Raw upload bytes from the client
    Receiving = 1,
    /// Raw download bytes to the client
    Sending = 2,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Receiving,
            2 => Phase::Sending,
            _ => Phase::Idle,
        }
    }
}

/// State touched only by the worker currently serving the connection
#[derive(Debug)]
pub struct ConnectionState {
    pub decoder: FrameDecoder,
    /// Encoded control frames not yet accepted by the socket
    pub outbox: ByteQueue,
    pub transfer: Transfer,
    /// Set by `download`, consumed by `ready_to_receive`
    pub pending_download: Option<DownloadSession>,
}

impl ConnectionState {
    fn new(config: &Config) -> Self {
        Self {
            decoder: FrameDecoder::new(config.max_frame_size),
            outbox: ByteQueue::with_limit(config.outbox_limit),
            transfer: Transfer::Idle,
            pending_download: None,
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    opened_at: Instant,
    stream: TcpStream,
    phase: AtomicU8,
    state: Mutex<ConnectionState>,
    /// Messages from other connections, delivered at the next frame boundary
    mailbox: Mutex<Vec<Response>>,
    username: RwLock<Option<String>>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(id: u64, stream: TcpStream, peer: SocketAddr, config: &Config) -> Self {
        Self {
            id,
            peer,
            opened_at: Instant::now(),
            stream,
            phase: AtomicU8::new(Phase::Idle as u8),
            state: Mutex::new(ConnectionState::new(config)),
            mailbox: Mutex::new(Vec::new()),
            username: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// `true` for the first caller only
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_ip(&self) -> Option<IpAddr> {
        Some(self.peer.ip())
    }

    /// Seconds since accept
    pub fn age_secs(&self) -> i64 {
        i64::try_from(self.opened_at.elapsed().as_secs()).unwrap_or(i64::MAX)
    }

    /// Shared socket handle; `&TcpStream` implements `Read` and `Write`
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock()
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.username.read().is_some()
    }

    /// Queue a message for delivery by this connection's next task
    pub fn post(&self, message: Response) {
        self.mailbox.lock().push(message);
    }

    pub fn take_mail(&self) -> Vec<Response> {
        std::mem::take(&mut *self.mailbox.lock())
    }

    /// Readiness the event loop should wait for next
    pub fn desired_interest(&self, state: &ConnectionState) -> Interest {
        interest_for(self.phase(), !state.outbox.is_empty())
    }
}

/// Sending waits for writability only; otherwise wait for input and, while
/// control bytes are queued, for room to flush them
pub fn interest_for(phase: Phase, outbox_pending: bool) -> Interest {
    match phase {
        Phase::Sending => Interest::WRITABLE,
        _ if outbox_pending => Interest::READABLE | Interest::WRITABLE,
        _ => Interest::READABLE,
    }
}

/// Every open connection, indexed by id and by logged-in user
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
    /// Maps username to the ids of its connections
    users: RwLock<HashMap<String, Vec<u64>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.connections.write().insert(conn.id(), conn);
    }

    /// Forget a connection and its user binding
    pub fn remove(&self, id: u64) -> Option<Arc<Connection>> {
        let conn = self.connections.write().remove(&id)?;
        if let Some(username) = conn.username() {
            self.unindex(&username, id);
        }
        Some(conn)
    }

    /// Attach `username` to the connection, replacing an earlier login
    pub fn bind_user(&self, conn: &Connection, username: &str) {
        let previous = conn.username.write().replace(username.to_string());
        if let Some(previous) = previous {
            self.unindex(&previous, conn.id());
        }
        let mut users = self.users.write();
        let ids = users.entry(username.to_string()).or_default();
        if !ids.contains(&conn.id()) {
            ids.push(conn.id());
        }
        debug!(
            conn_id = conn.id(),
            username,
            sessions = ids.len(),
            "Bound user to connection"
        );
    }

    /// Open connections logged in as `username`
    pub fn connections_for(&self, username: &str) -> Vec<Arc<Connection>> {
        let ids = match self.users.read().get(username) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        let connections = self.connections.read();
        ids.iter()
            .filter_map(|id| connections.get(id).cloned())
            .collect()
    }

    /// `(users online, open connections)`
    pub fn stats(&self) -> (usize, usize) {
        (self.users.read().len(), self.connections.read().len())
    }

    fn unindex(&self, username: &str, id: u64) {
        let mut users = self.users.write();
        if let Some(ids) = users.get_mut(username) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                users.remove(username);
            }
        }
    }
}
