//! Records and persistence contract shared by the skyvault crates.

pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::{MemoryStore, Store};
pub use types::*;
