use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::path::PathBuf;

/// Registered account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub password_digest: String,
    /// Empty until the first successful login provisions the directory
    pub root_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn new(username: impl Into<String>, password_digest: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password_digest: password_digest.into(),
            root_dir: None,
            created_at: Utc::now(),
        }
    }

    /// Check a plaintext password against the stored digest
    pub fn verify_password(&self, password: &str) -> bool {
        password_digest(&self.username, password) == self.password_digest
    }
}

/// Digest stored in place of the password.
///
/// The username acts as a per-account salt so equal passwords do not share a digest.
pub fn password_digest(username: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Outcome recorded in the operation log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    Failure,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Success => "success",
            OperationStatus::Failure => "failure",
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = crate::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(OperationStatus::Success),
            "failure" => Ok(OperationStatus::Failure),
            other => Err(crate::StoreError::InvalidRecord(format!(
                "unknown operation status: {other}"
            ))),
        }
    }
}

/// One row of the per-user audit history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub username: String,
    pub client_ip: Option<IpAddr>,
    /// login, logout, upload, download, delete, share, accept_share, reject_share
    pub operation: String,
    pub filename: Option<String>,
    pub status: OperationStatus,
    pub timestamp: DateTime<Utc>,
}

impl OperationRecord {
    pub fn new(
        username: impl Into<String>,
        client_ip: Option<IpAddr>,
        operation: impl Into<String>,
        filename: Option<String>,
        status: OperationStatus,
    ) -> Self {
        Self {
            username: username.into(),
            client_ip,
            operation: operation.into(),
            filename,
            status,
            timestamp: Utc::now(),
        }
    }
}

/// Share lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ShareStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareStatus::Pending => "pending",
            ShareStatus::Accepted => "accepted",
            ShareStatus::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for ShareStatus {
    type Err = crate::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ShareStatus::Pending),
            "accepted" => Ok(ShareStatus::Accepted),
            "rejected" => Ok(ShareStatus::Rejected),
            other => Err(crate::StoreError::InvalidRecord(format!(
                "unknown share status: {other}"
            ))),
        }
    }
}

/// A file offered by one user to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub id: i64,
    pub owner: String,
    pub recipient: String,
    /// Directory inside the owner's root, as the owner supplied it
    pub path: String,
    pub filename: String,
    pub status: ShareStatus,
    pub shared_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
