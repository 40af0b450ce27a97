//! # skyvault server
//!
//! Multi-user network file storage over a length-prefixed JSON protocol.
//!
//! ## Architecture
//!
//! - [`server::Server`]: edge-triggered `mio` event loop that accepts clients
//!   and turns readiness into tasks
//! - [`task_queue::TaskQueue`] and [`worker_pool::WorkerPool`]: bounded ring
//!   of tasks drained by a fixed set of worker threads
//! - [`handlers::Handler`]: control-frame dispatch and the upload/download
//!   continuations that survive socket backpressure
//! - [`sandbox`]: confines every client path to the user's root
//!
//! Persistence goes through [`skyvault_core::Store`].

pub mod audit;
pub mod byte_queue;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod roots;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod task;
pub mod task_queue;
pub mod worker_pool;

pub use client::Client;
pub use config::{Config, LogFormat, LoggingConfig, StoreConfig};
pub use error::{Error, Result};
pub use server::{Server, ServerStats, ShutdownHandle};
