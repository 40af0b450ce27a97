//! skyvault server binary
//!
//! Run with: cargo run --bin skyvault-server -- --root ./data --memory-store

use anyhow::Context;
use clap::Parser;
use skyvault_core::{MemoryStore, Store};
use skyvault_db::SqliteStore;
use skyvault_server::{Config, LogFormat, Server, StoreConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8000")]
    port: u16,

    /// Parent directory of the per-user storage roots
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format (json or text)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path, rotated daily
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Keep users and history in memory only
    #[arg(long)]
    memory_store: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => {
            let mut config = Config::default();
            config.bind_address = args.bind.clone();
            config.port = args.port;
            if let Some(root) = &args.root {
                config.storage_root = root.clone();
            }
            if let Some(workers) = args.workers {
                config.worker_count = workers;
            }
            if let Some(format) = args.log_format {
                config.logging.format = format;
            }
            if let Some(file) = &args.log_file {
                config.logging.file = Some(file.clone());
            }
            if args.verbose {
                config.logging.level = "debug".to_string();
            }
            config
        }
    };
    if args.memory_store {
        config.database = StoreConfig::Memory;
    }

    let _log_guard = init_logging(&mut config);

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting skyvault server"
    );
    info!(
        event = "server_configuration",
        bind_address = %config.bind_address,
        port = config.port,
        storage_root = %config.storage_root.display(),
        workers = config.worker_count,
        queue_capacity = config.queue_capacity,
        database = ?config.database,
        log_format = ?config.logging.format,
        log_file = ?config.logging.file,
        audit_enabled = config.logging.audit_enabled,
        "Server configuration"
    );

    if let Err(e) = config.validate() {
        error!(
            event = "configuration_validation_failed",
            error = %e,
            "Configuration validation failed"
        );
        return Err(e.into());
    }

    std::fs::create_dir_all(&config.storage_root).with_context(|| {
        format!(
            "Failed to create storage root {}",
            config.storage_root.display()
        )
    })?;

    let store: Arc<dyn Store> = match config.database_path() {
        Some(path) => {
            info!(event = "store_opening", path = %path.display(), "Opening SQLite store");
            Arc::new(SqliteStore::open(&path).context("Failed to open database")?)
        }
        None => {
            warn!(
                event = "memory_store",
                "Using in-memory store; accounts and history are lost at shutdown"
            );
            Arc::new(MemoryStore::new())
        }
    };

    let server = Server::bind(config, store).context("Failed to start server")?;
    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!(event = "shutdown_requested", "Shutdown signal received");
        handle.shutdown();
    })
    .context("Failed to install signal handler")?;

    info!(
        event = "server_running",
        address = %server.local_addr(),
        "Accepting connections"
    );

    match server.run() {
        Ok(stats) => {
            info!(
                event = "server_shutdown",
                accepted = stats.accepted,
                tasks_dropped = stats.tasks_dropped,
                "Server shutdown complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(event = "server_error", error = %e, "Server encountered an error");
            Err(e.into())
        }
    }
}

/// Install the global subscriber, to a daily-rolling file when configured
fn init_logging(config: &mut skyvault_server::Config) -> Option<WorkerGuard> {
    let logging = config.logging.clone();
    let filter = || logging.env_filter();

    if let Some(log_file) = config.logging.file.clone() {
        let directory = log_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = log_file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());

        match (std::fs::create_dir_all(&directory), file_name) {
            (Ok(()), Some(file_name)) => {
                let appender = tracing_appender::rolling::daily(directory, file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                match config.logging.format {
                    LogFormat::Json => tracing_subscriber::fmt()
                        .json()
                        .with_env_filter(filter())
                        .with_writer(writer)
                        .with_current_span(true)
                        .with_span_list(true)
                        .init(),
                    LogFormat::Text => tracing_subscriber::fmt()
                        .with_env_filter(filter())
                        .with_writer(writer)
                        .with_ansi(false)
                        .init(),
                }
                return Some(guard);
            }
            (Err(e), _) => {
                eprintln!("Warning: Failed to create log directory: {e}");
                eprintln!("Falling back to stderr logging");
            }
            (_, None) => eprintln!("Warning: Log file path has no file name, using stderr"),
        }
        config.logging.file = None;
    }

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter()).init(),
    }
    None
}
