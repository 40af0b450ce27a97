//! Shared fixture: a live server on an ephemeral loopback port

#![allow(dead_code)]

use skyvault_core::MemoryStore;
use skyvault_server::protocol::HistoryEntry;
use skyvault_server::{Client, Config, Server, ServerStats, ShutdownHandle};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const PASSWORD: &str = "correct horse";

pub struct TestServer {
    pub addr: SocketAddr,
    pub root: TempDir,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<skyvault_server::Result<ServerStats>>>,
}

impl TestServer {
    pub fn start() -> Self {
        Self::start_with(|_| {})
    }

    pub fn start_with(adjust: impl FnOnce(&mut Config)) -> Self {
        let root = TempDir::new().unwrap();
        let mut config = Config {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            storage_root: root.path().to_path_buf(),
            worker_count: 4,
            ..Config::default()
        };
        adjust(&mut config);

        let server = Server::bind(config, Arc::new(MemoryStore::new())).unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let thread = std::thread::spawn(move || server.run());

        Self {
            addr,
            root,
            handle,
            thread: Some(thread),
        }
    }

    /// A connected, anonymous client
    pub fn client(&self) -> Client {
        let client = Client::connect(self.addr).unwrap();
        client.set_timeout(Some(Duration::from_secs(10))).unwrap();
        client
    }

    /// A client registered and logged in as `username`
    pub fn user(&self, username: &str) -> Client {
        let mut client = self.client();
        let reply = client.register(username, PASSWORD).unwrap();
        assert!(reply.success, "register {username}: {}", reply.message);
        let reply = client.login(username, PASSWORD).unwrap();
        assert!(reply.success, "login {username}: {}", reply.message);
        client
    }

    /// Where `username`'s files live on disk
    pub fn user_root(&self, username: &str) -> PathBuf {
        self.root.path().join(username)
    }

    pub fn stop(mut self) -> ServerStats {
        self.handle.shutdown();
        self.thread.take().unwrap().join().unwrap().unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Deterministic, non-repeating-looking test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Poll `client`'s history until `done` holds; teardown of other
/// connections is asynchronous
pub fn wait_for_history(
    client: &mut Client,
    done: impl Fn(&[HistoryEntry]) -> bool,
) -> Vec<HistoryEntry> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let history = client.history().unwrap();
        if done(&history) {
            return history;
        }
        assert!(Instant::now() < deadline, "history never settled: {history:?}");
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Whether `history` holds `operation` with `status`
pub fn has_record(history: &[HistoryEntry], operation: &str, status: &str) -> bool {
    history
        .iter()
        .any(|record| record.operation == operation && record.status == status)
}
