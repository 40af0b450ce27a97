use crate::error::{Result, StoreError};
use crate::types::*;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;

/// Persistence contract used by the server.
///
/// Calls are synchronous because they are made from worker threads that
/// already own a unit of blocking work. Implementations must be safe to
/// share across every worker.
pub trait Store: Send + Sync {
    fn find_user(&self, username: &str) -> Result<Option<UserRecord>>;

    /// Fails with [`StoreError::Duplicate`] when the username is taken
    fn create_user(&self, username: &str, password_digest: &str) -> Result<()>;

    fn set_root_dir(&self, username: &str, root_dir: &Path) -> Result<()>;

    fn record_operation(&self, record: &OperationRecord) -> Result<()>;

    /// Most recent operations first
    fn history(&self, username: &str, limit: usize) -> Result<Vec<OperationRecord>>;

    /// Returns the id of the new pending share
    fn create_share(&self, owner: &str, recipient: &str, path: &str, filename: &str)
    -> Result<i64>;

    fn pending_shares(&self, recipient: &str) -> Result<Vec<ShareRecord>>;

    /// A share that is still pending and addressed to `recipient`
    fn find_pending_share(&self, id: i64, recipient: &str) -> Result<Option<ShareRecord>>;

    fn resolve_share(&self, id: i64, status: ShareStatus) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, UserRecord>,
    operations: Vec<OperationRecord>,
    shares: Vec<ShareRecord>,
    next_share_id: i64,
}

/// In-process store for tests and throwaway servers
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn find_user(&self, username: &str) -> Result<Option<UserRecord>> {
        Ok(self.state.read().users.get(username).cloned())
    }

    fn create_user(&self, username: &str, password_digest: &str) -> Result<()> {
        let mut state = self.state.write();
        if state.users.contains_key(username) {
            return Err(StoreError::Duplicate(username.to_string()));
        }
        state
            .users
            .insert(username.to_string(), UserRecord::new(username, password_digest));
        Ok(())
    }

    fn set_root_dir(&self, username: &str, root_dir: &Path) -> Result<()> {
        let mut state = self.state.write();
        let user = state
            .users
            .get_mut(username)
            .ok_or_else(|| StoreError::NotFound(username.to_string()))?;
        user.root_dir = Some(root_dir.to_path_buf());
        Ok(())
    }

    fn record_operation(&self, record: &OperationRecord) -> Result<()> {
        self.state.write().operations.push(record.clone());
        Ok(())
    }

    fn history(&self, username: &str, limit: usize) -> Result<Vec<OperationRecord>> {
        // Insertion order breaks timestamp ties so the newest push wins
        let state = self.state.read();
        Ok(state
            .operations
            .iter()
            .rev()
            .filter(|op| op.username == username)
            .take(limit)
            .cloned()
            .collect())
    }

    fn create_share(
        &self,
        owner: &str,
        recipient: &str,
        path: &str,
        filename: &str,
    ) -> Result<i64> {
        let mut state = self.state.write();
        state.next_share_id += 1;
        let id = state.next_share_id;
        state.shares.push(ShareRecord {
            id,
            owner: owner.to_string(),
            recipient: recipient.to_string(),
            path: path.to_string(),
            filename: filename.to_string(),
            status: ShareStatus::Pending,
            shared_at: Utc::now(),
            resolved_at: None,
        });
        Ok(id)
    }

    fn pending_shares(&self, recipient: &str) -> Result<Vec<ShareRecord>> {
        Ok(self
            .state
            .read()
            .shares
            .iter()
            .filter(|s| s.recipient == recipient && s.status == ShareStatus::Pending)
            .cloned()
            .collect())
    }

    fn find_pending_share(&self, id: i64, recipient: &str) -> Result<Option<ShareRecord>> {
        Ok(self
            .state
            .read()
            .shares
            .iter()
            .find(|s| s.id == id && s.recipient == recipient && s.status == ShareStatus::Pending)
            .cloned())
    }

    fn resolve_share(&self, id: i64, status: ShareStatus) -> Result<()> {
        let mut state = self.state.write();
        let share = state
            .shares
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("share {id}")))?;
        share.status = status;
        share.resolved_at = Some(Utc::now());
        Ok(())
    }
}
