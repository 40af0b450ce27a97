//! Event multiplexer
//!
//! One thread owns the poll instance, the listener and the registration of
//! every client socket. It never reads or writes client data: readiness
//! becomes a [`Task`] on the bounded queue and a worker does the I/O.
//!
//! Registrations are edge-triggered. A connection has at most one task in
//! flight; readiness that arrives meanwhile is remembered in its slot and
//! replayed when the worker reports back, so no edge is lost between the
//! worker's last would-block and the re-arm.

use crate::audit::AuditEvent;
use crate::config::Config;
use crate::connection::{Connection, ConnectionRegistry, Phase};
use crate::error::{Error, Result};
use crate::handlers::Handler;
use crate::task::{Next, Notifier, Signal, Task, TaskKind};
use crate::task_queue::TaskQueue;
use crate::worker_pool::WorkerPool;
use chrono::Utc;
use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use skyvault_core::Store;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, channel};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
/// Connection ids double as tokens and start after the reserved ones
const FIRST_CONNECTION_ID: u64 = 2;

/// Upper bound on how long a shutdown request can go unnoticed
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Multiplexer counters, logged at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    pub tasks_queued: u64,
    pub tasks_dropped: u64,
}

/// Stops a running [`Server`] from any thread
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(event = "waker_failed", error = %e, "Failed to wake event loop");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Multiplexer bookkeeping for one connection
struct Slot {
    conn: Arc<Connection>,
    in_flight: bool,
    /// Readiness or mail arrived while a task was in flight
    pending: bool,
    interest: Interest,
}

pub struct Server {
    config: Arc<Config>,
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    signals: Receiver<Signal>,
    queue: Arc<TaskQueue<Task>>,
    registry: Arc<ConnectionRegistry>,
    handler: Arc<Handler>,
    slots: HashMap<u64, Slot>,
    next_id: u64,
    stats: ServerStats,
}

impl Server {
    /// Validate the configuration, prepare the storage root and bind the listener
    pub fn bind(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage_root).map_err(|e| {
            Error::Config(format!(
                "Cannot create storage root {}: {}",
                config.storage_root.display(),
                e
            ))
        })?;

        let addr = resolve_address(&config.listen_address())?;
        let mut listener = bind_listener(addr, config.listen_backlog)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let (tx, signals) = channel();
        let config = Arc::new(config);
        let registry = Arc::new(ConnectionRegistry::new());
        let handler = Arc::new(Handler::new(
            config.clone(),
            store,
            registry.clone(),
            Notifier::new(tx, waker.clone()),
        ));

        info!(
            event = "server_bound",
            address = %local_addr,
            storage_root = %config.storage_root.display(),
            "Listening"
        );

        Ok(Self {
            queue: Arc::new(TaskQueue::new(config.queue_capacity)),
            config,
            poll,
            listener,
            local_addr,
            waker,
            running: Arc::new(AtomicBool::new(true)),
            signals,
            registry,
            handler,
            slots: HashMap::new(),
            next_id: FIRST_CONNECTION_ID,
            stats: ServerStats::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: self.running.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Serve until a [`ShutdownHandle`] fires
    pub fn run(mut self) -> Result<ServerStats> {
        let handler = self.handler.clone();
        let pool = WorkerPool::start(self.config.worker_count, self.queue.clone(), move |task| {
            handler.run(task)
        })?;
        let mut events = Events::with_capacity(self.config.max_events);

        info!(
            event = "server_started",
            address = %self.local_addr,
            workers = pool.worker_count(),
            queue_capacity = self.queue.capacity(),
            "Server running"
        );

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(event = "poll_failed", error = %e, "Event loop failed");
                pool.shutdown();
                return Err(Error::Io(e));
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    // Signals are drained below on every iteration
                    WAKER => {}
                    token => self.ready(token.0 as u64),
                }
            }
            self.drain_signals();
        }

        info!(event = "server_stopping", "Shutting down");
        pool.shutdown();
        self.close_all();

        let (users, connections) = self.registry.stats();
        info!(
            event = "server_stats",
            accepted = self.stats.accepted,
            tasks_queued = self.stats.tasks_queued,
            tasks_dropped = self.stats.tasks_dropped,
            users_online = users,
            connections_open = connections,
            "Server stopped"
        );
        Ok(self.stats)
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let id = self.next_id;
                    self.next_id += 1;

                    let conn = Arc::new(Connection::new(id, stream, peer, &self.config));
                    let fd = conn.stream().as_raw_fd();
                    if let Err(e) = self.poll.registry().register(
                        &mut SourceFd(&fd),
                        token_for(id),
                        Interest::READABLE,
                    ) {
                        warn!(
                            event = "register_failed",
                            peer = %peer,
                            error = %e,
                            "Dropping accepted connection"
                        );
                        continue;
                    }

                    self.registry.insert(conn.clone());
                    self.slots.insert(
                        id,
                        Slot {
                            conn,
                            in_flight: false,
                            pending: false,
                            interest: Interest::READABLE,
                        },
                    );
                    self.stats.accepted += 1;
                    self.handler.auditor().emit(AuditEvent::ConnectionEstablished {
                        conn_id: id,
                        client_ip: Some(peer.ip()),
                        timestamp: Utc::now(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(event = "accept_failed", error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn ready(&mut self, id: u64) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        if slot.in_flight {
            slot.pending = true;
            return;
        }
        self.dispatch(id);
    }

    /// Queue the task matching the connection's phase
    fn dispatch(&mut self, id: u64) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let kind = match slot.conn.phase() {
            Phase::Idle => TaskKind::ControlMessage,
            Phase::Receiving => TaskKind::ContinueUpload,
            Phase::Sending => TaskKind::ContinueDownload,
        };

        match self.queue.try_push(Task::new(kind, slot.conn.clone())) {
            Ok(()) => {
                slot.in_flight = true;
                slot.pending = false;
                self.stats.tasks_queued += 1;
            }
            Err(_) => {
                // Not retried: the next readiness edge will dispatch again
                self.stats.tasks_dropped += 1;
                warn!(
                    event = "task_dropped",
                    conn_id = id,
                    task = ?kind,
                    queue_capacity = self.queue.capacity(),
                    dropped = self.stats.tasks_dropped,
                    "Task queue full, readiness event dropped"
                );
                self.handler.auditor().emit(AuditEvent::TaskDropped {
                    conn_id: id,
                    client_ip: slot.conn.client_ip(),
                    queue_capacity: self.queue.capacity(),
                    timestamp: Utc::now(),
                });
            }
        }
    }

    fn drain_signals(&mut self) {
        while let Ok(signal) = self.signals.try_recv() {
            match signal {
                Signal::Done { id, next } => self.complete(id, next),
                Signal::Notify { id } => self.ready(id),
            }
        }
    }

    fn complete(&mut self, id: u64, next: Next) {
        let (interest, rerun) = match next {
            Next::Close => {
                self.close(id);
                return;
            }
            Next::Watch { interest, rerun } => (interest, rerun),
        };

        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        slot.in_flight = false;

        if slot.interest != interest {
            let fd = slot.conn.stream().as_raw_fd();
            if let Err(e) =
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), token_for(id), interest)
            {
                warn!(
                    event = "reregister_failed",
                    conn_id = id,
                    error = %e,
                    "Closing connection"
                );
                self.close(id);
                return;
            }
            slot.interest = interest;
        }

        if slot.pending || rerun {
            self.dispatch(id);
        }
    }

    fn close(&mut self, id: u64) {
        if let Some(slot) = self.slots.remove(&id) {
            let fd = slot.conn.stream().as_raw_fd();
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                debug!(conn_id = id, error = %e, "Deregister failed");
            }
            // The descriptor itself closes with the last reference
            let _ = slot.conn.stream().shutdown(Shutdown::Both);
        }
        self.registry.remove(id);
        debug!(event = "connection_removed", conn_id = id, "Connection removed");
    }

    /// Close every connection still open at shutdown
    fn close_all(&mut self) {
        let ids: Vec<u64> = self.slots.keys().copied().collect();
        for id in ids {
            if let Some(slot) = self.slots.get(&id) {
                self.handler.teardown(&slot.conn);
            }
            self.close(id);
        }
    }
}

fn token_for(id: u64) -> Token {
    Token(id as usize)
}

fn resolve_address(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("Invalid listen address {address}: {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("Listen address {address} resolved to nothing")))
}

/// Non-blocking listener with address reuse and the configured backlog
fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::protocol::{Request, Response};
    use skyvault_core::MemoryStore;
    use std::time::Instant;
    use tempfile::TempDir;

    fn test_config(root: &TempDir) -> Config {
        Config {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            storage_root: root.path().to_path_buf(),
            worker_count: 2,
            ..Config::default()
        }
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let dir = TempDir::new().unwrap();
        let server = Server::bind(test_config(&dir), Arc::new(MemoryStore::new())).unwrap();
        assert!(server.local_addr().port() > 0);
        assert!(server.local_addr().ip().is_loopback());
    }

    #[test]
    fn test_bind_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            worker_count: 0,
            ..test_config(&dir)
        };
        assert!(matches!(
            Server::bind(config, Arc::new(MemoryStore::new())),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_shutdown_handle_stops_run() {
        let dir = TempDir::new().unwrap();
        let server = Server::bind(test_config(&dir), Arc::new(MemoryStore::new())).unwrap();
        let handle = server.shutdown_handle();
        let addr = server.local_addr();
        let thread = std::thread::spawn(move || server.run());

        let _client = std::net::TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        handle.shutdown();
        assert!(!handle.is_running());

        let stats = thread.join().unwrap().unwrap();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.tasks_dropped, 0);
    }

    /// One pass of the event loop, without workers
    fn turn(server: &mut Server, events: &mut Events) {
        server
            .poll
            .poll(events, Some(Duration::from_millis(50)))
            .unwrap();
        for event in events.iter() {
            match event.token() {
                LISTENER => server.accept(),
                WAKER => {}
                token => server.ready(token.0 as u64),
            }
        }
        server.drain_signals();
    }

    fn turn_until(server: &mut Server, events: &mut Events, done: impl Fn(&Server) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(&*server) {
            assert!(Instant::now() < deadline, "event loop made no progress");
            turn(server, events);
        }
    }

    fn history_failure(response: Response) {
        assert!(matches!(
            response,
            Response::HistoryResult { success: false, .. }
        ));
    }

    #[test]
    fn test_queue_overflow_drops_task_and_next_edge_recovers() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            queue_capacity: 1,
            ..test_config(&dir)
        };
        let mut server = Server::bind(config, Arc::new(MemoryStore::new())).unwrap();
        let mut events = Events::with_capacity(16);

        let mut first = Client::connect(server.local_addr()).unwrap();
        let mut second = Client::connect(server.local_addr()).unwrap();
        first.send(&Request::HistoryQuery).unwrap();
        second.send(&Request::HistoryQuery).unwrap();

        // Nothing consumes the queue yet, so the second readiness event overflows it
        turn_until(&mut server, &mut events, |s| {
            s.stats.tasks_queued + s.stats.tasks_dropped >= 2
        });
        assert_eq!(server.stats.tasks_queued, 1);
        assert_eq!(server.stats.tasks_dropped, 1);
        assert_eq!(server.queue.len(), 1);

        let task = server.queue.pop().unwrap();
        server.handler.run(task).unwrap();
        turn(&mut server, &mut events);
        assert!(server.queue.is_empty());

        // The reply is already in the served client's socket
        first.set_timeout(Some(Duration::from_millis(200))).unwrap();
        second.set_timeout(Some(Duration::from_secs(5))).unwrap();
        let (_served, mut starved) = match first.recv() {
            Ok(reply) => {
                history_failure(reply);
                (first, second)
            }
            Err(_) => {
                history_failure(second.recv().unwrap());
                (second, first)
            }
        };
        starved.set_timeout(Some(Duration::from_secs(5))).unwrap();

        // The dropped request sits unread until the connection sees a new edge
        starved.send(&Request::HistoryQuery).unwrap();
        turn_until(&mut server, &mut events, |s| s.queue.len() == 1);
        let task = server.queue.pop().unwrap();
        server.handler.run(task).unwrap();
        turn(&mut server, &mut events);

        history_failure(starved.recv().unwrap());
        history_failure(starved.recv().unwrap());
        assert_eq!(server.stats.tasks_dropped, 1);
        assert_eq!(server.stats.tasks_queued, 2);
    }
}
