//! Per-user storage roots
//!
//! Every user gets `<storage_root>/<username>/`, created on first login and
//! remembered both in the store and in this cache.

use crate::error::{Error, Result};
use crate::sandbox;
use parking_lot::RwLock;
use skyvault_core::Store;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug)]
pub struct RootCache {
    storage_root: PathBuf,
    roots: RwLock<HashMap<String, PathBuf>>,
}

impl RootCache {
    pub fn new(storage_root: &Path) -> Self {
        Self {
            storage_root: storage_root.to_path_buf(),
            roots: RwLock::new(HashMap::new()),
        }
    }

    /// Root directory of `username`, creating it if needed
    pub fn ensure(&self, store: &dyn Store, username: &str) -> Result<PathBuf> {
        if let Some(root) = self.roots.read().get(username) {
            if root.is_dir() {
                return Ok(root.clone());
            }
        }

        // Usernames become a single path component
        sandbox::validate_filename(username)?;

        let root = self.storage_root.join(username);
        if !root.is_dir() {
            create_private_dir(&root)?;
            info!(
                event = "user_root_created",
                username,
                root = %root.display(),
                "Created user storage root"
            );
        }
        let root = root.canonicalize()?;
        store.set_root_dir(username, &root)?;

        self.roots
            .write()
            .insert(username.to_string(), root.clone());
        Ok(root)
    }

    /// Cached root, if the user has logged in since startup
    pub fn get(&self, username: &str) -> Option<PathBuf> {
        self.roots.read().get(username).cloned()
    }

    /// Root of a user who may never have logged in, such as a share recipient
    pub fn resolve(&self, store: &dyn Store, username: &str) -> Result<PathBuf> {
        match self.get(username) {
            Some(root) => Ok(root),
            None => self.ensure(store, username),
        }
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .map_err(Error::Io)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(Error::Io)
}
