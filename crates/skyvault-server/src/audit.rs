//! Audit trail
//!
//! Two sinks: structured [`AuditEvent`]s emitted through tracing, and the
//! per-user operation log kept by the [`Store`] that backs `history_query`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skyvault_core::{OperationRecord, OperationStatus, Store};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    /// Connection accepted by the multiplexer
    ConnectionEstablished {
        conn_id: u64,
        client_ip: Option<IpAddr>,
        timestamp: DateTime<Utc>,
    },
    /// Connection closed
    ConnectionClosed {
        conn_id: u64,
        client_ip: Option<IpAddr>,
        /// Authenticated username
        username: Option<String>,
        timestamp: DateTime<Utc>,
        /// Session duration in seconds
        duration_secs: i64,
    },
    /// Login attempt
    AuthAttempt {
        client_ip: Option<IpAddr>,
        /// Username attempted
        username: String,
        timestamp: DateTime<Utc>,
        success: bool,
        /// Failure reason if applicable
        reason: Option<String>,
    },
    /// Upload, download, delete, share
    FileOperation {
        client_ip: Option<IpAddr>,
        username: Option<String>,
        operation: String,
        /// Path relative to the user root
        path: String,
        timestamp: DateTime<Utc>,
        success: bool,
        /// Bytes transferred if applicable
        bytes_transferred: Option<u64>,
        error: Option<String>,
    },
    /// Path traversal and other rejected access
    SecurityEvent {
        client_ip: Option<IpAddr>,
        username: Option<String>,
        event: String,
        details: String,
        timestamp: DateTime<Utc>,
    },
    /// Readiness event lost because the task queue was full
    TaskDropped {
        conn_id: u64,
        client_ip: Option<IpAddr>,
        queue_capacity: usize,
        timestamp: DateTime<Utc>,
    },
}

impl AuditEvent {
    /// Log the audit event
    pub fn log(&self) {
        match self {
            AuditEvent::ConnectionEstablished {
                conn_id, client_ip, ..
            } => {
                info!(
                    event = "connection_established",
                    conn_id,
                    client_ip = ?client_ip,
                    audit = ?self,
                    "New connection established"
                );
            }
            AuditEvent::ConnectionClosed {
                conn_id,
                username,
                duration_secs,
                ..
            } => {
                info!(
                    event = "connection_closed",
                    conn_id,
                    username = ?username,
                    duration_secs,
                    audit = ?self,
                    "Connection closed"
                );
            }
            AuditEvent::AuthAttempt {
                username,
                success,
                reason,
                ..
            } => {
                if *success {
                    info!(
                        event = "auth_success",
                        username,
                        audit = ?self,
                        "Authentication successful"
                    );
                } else {
                    warn!(
                        event = "auth_failure",
                        username,
                        reason = ?reason,
                        audit = ?self,
                        "Authentication failed"
                    );
                }
            }
            AuditEvent::FileOperation {
                username,
                operation,
                path,
                success,
                bytes_transferred,
                error,
                ..
            } => {
                if *success {
                    info!(
                        event = "file_operation",
                        username = ?username,
                        operation,
                        path,
                        bytes = ?bytes_transferred,
                        audit = ?self,
                        "File operation completed"
                    );
                } else {
                    warn!(
                        event = "file_operation_failed",
                        username = ?username,
                        operation,
                        path,
                        error = ?error,
                        audit = ?self,
                        "File operation failed"
                    );
                }
            }
            AuditEvent::SecurityEvent {
                username,
                event,
                details,
                ..
            } => {
                warn!(
                    event = "security_event",
                    username = ?username,
                    security_event = event,
                    details,
                    audit = ?self,
                    "Security event detected"
                );
            }
            AuditEvent::TaskDropped {
                conn_id,
                queue_capacity,
                ..
            } => {
                warn!(
                    event = "task_dropped",
                    conn_id,
                    queue_capacity,
                    audit = ?self,
                    "Task queue full, readiness event dropped"
                );
            }
        }
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Writes audit events and the persistent operation log
#[derive(Clone)]
pub struct Auditor {
    store: Arc<dyn Store>,
    enabled: bool,
}

impl Auditor {
    pub fn new(store: Arc<dyn Store>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// Emit a structured event if audit logging is on
    pub fn emit(&self, event: AuditEvent) {
        if self.enabled {
            event.log();
        }
    }

    /// Append to the user's operation history.
    ///
    /// A store failure is logged and swallowed; losing a history row must not
    /// fail the request that produced it.
    pub fn record(
        &self,
        username: &str,
        client_ip: Option<IpAddr>,
        operation: &str,
        filename: Option<&str>,
        success: bool,
    ) {
        let status = if success {
            OperationStatus::Success
        } else {
            OperationStatus::Failure
        };
        let record = OperationRecord::new(
            username,
            client_ip,
            operation,
            filename.map(str::to_string),
            status,
        );
        if let Err(e) = self.store.record_operation(&record) {
            error!(
                event = "operation_log_failed",
                username,
                operation,
                error = %e,
                "Failed to record operation"
            );
        }
    }

    /// Record a file operation in both sinks
    #[allow(clippy::too_many_arguments)]
    pub fn file_operation(
        &self,
        username: &str,
        client_ip: Option<IpAddr>,
        operation: &str,
        path: &str,
        filename: &str,
        bytes: Option<u64>,
        error: Option<String>,
    ) {
        let success = error.is_none();
        self.record(username, client_ip, operation, Some(filename), success);
        self.emit(AuditEvent::FileOperation {
            client_ip,
            username: Some(username.to_string()),
            operation: operation.to_string(),
            path: path.to_string(),
            timestamp: Utc::now(),
            success,
            bytes_transferred: bytes,
            error,
        });
    }

    pub fn security_event(
        &self,
        client_ip: Option<IpAddr>,
        username: Option<String>,
        event: &str,
        details: String,
    ) {
        // Security events are logged regardless of the audit switch
        AuditEvent::SecurityEvent {
            client_ip,
            username,
            event: event.to_string(),
            details,
            timestamp: Utc::now(),
        }
        .log();
    }
}
