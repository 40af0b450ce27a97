//! Server backed by SQLite, configured from a TOML file

use skyvault_db::SqliteStore;
use skyvault_server::{Client, Config, Server, StoreConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn load_config(dir: &TempDir) -> Config {
    let path = dir.path().join("skyvault.toml");
    let storage = dir.path().join("storage");
    std::fs::write(
        &path,
        format!(
            r#"
bind_address = "127.0.0.1"
port = 0
storage_root = "{}"
worker_count = 2

[database]
kind = "sqlite"
path = "accounts.db"
"#,
            storage.display()
        ),
    )
    .unwrap();
    Config::from_file(&path).unwrap()
}

/// Run one session against a fresh server over the configured database
fn with_server<T>(config: &Config, session: impl FnOnce(&mut Client) -> T) -> T {
    let db_path = config.database_path().unwrap();
    std::fs::create_dir_all(&config.storage_root).unwrap();
    let store = Arc::new(SqliteStore::open(&db_path).unwrap());

    let server = Server::bind(config.clone(), store).unwrap();
    let addr = server.local_addr();
    let handle = server.shutdown_handle();
    let thread = std::thread::spawn(move || server.run());

    let mut client = Client::connect(addr).unwrap();
    client.set_timeout(Some(Duration::from_secs(10))).unwrap();
    let result = session(&mut client);
    client.disconnect().unwrap();

    handle.shutdown();
    thread.join().unwrap().unwrap();
    result
}

#[test]
fn test_config_file_selects_sqlite() {
    let dir = TempDir::new().unwrap();
    let config = load_config(&dir);

    assert_eq!(config.worker_count, 2);
    assert!(matches!(config.database, StoreConfig::Sqlite { .. }));
    assert_eq!(
        config.database_path().unwrap(),
        dir.path().join("storage").join("accounts.db")
    );
}

#[test]
fn test_accounts_and_history_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = load_config(&dir);

    with_server(&config, |client| {
        assert!(client.register("alice", "pw").unwrap().success);
        assert!(client.login("alice", "pw").unwrap().success);
        assert!(client.upload("/", "kept.txt", b"persisted").unwrap().result.success);
    });

    let (history, download) = with_server(&config, |client| {
        assert!(client.login("alice", "pw").unwrap().success);
        let duplicate = client.register("alice", "other").unwrap();
        assert!(!duplicate.success);
        (
            client.history().unwrap(),
            client.download("/", "kept.txt").unwrap(),
        )
    });

    assert_eq!(download.data, b"persisted");
    let operations: Vec<&str> = history.iter().map(|r| r.operation.as_str()).collect();
    assert_eq!(operations[0], "login");
    assert!(operations.contains(&"upload"));
    assert!(operations.contains(&"logout"));
}
