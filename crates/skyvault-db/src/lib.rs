use chrono::{DateTime, Utc};
use skyvault_core::*;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tokio::runtime::Runtime;

/// SQLite-backed [`Store`].
///
/// The server's workers are plain threads, so the store owns a small tokio
/// runtime and drives each query to completion on the calling thread.
pub struct SqliteStore {
    pool: SqlitePool,
    runtime: Runtime,
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRecord(format!("bad timestamp {value}: {e}")))
}

impl SqliteStore {
    pub fn open(database_path: &Path) -> Result<Self> {
        match database_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Backend(format!("{}: {e}", parent.display())))?;
            }
            _ => {}
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("skyvault-db")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);

        let pool = runtime
            .block_on(
                SqlitePoolOptions::new()
                    .max_connections(5)
                    .connect_with(options),
            )
            .map_err(backend)?;

        let store = Self { pool, runtime };
        store.runtime.block_on(store.run_migrations())?;

        tracing::info!(
            event = "store_opened",
            path = %database_path.display(),
            "SQLite store ready"
        );
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                password_digest TEXT NOT NULL,
                root_dir TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operation_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                client_ip TEXT,
                operation TEXT NOT NULL,
                filename TEXT,
                status TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_operation_log_user ON operation_log (username, id)",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_shares (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                recipient TEXT NOT NULL,
                path TEXT NOT NULL,
                filename TEXT NOT NULL,
                status TEXT NOT NULL,
                shared_at TEXT NOT NULL,
                resolved_at TEXT,
                FOREIGN KEY (owner) REFERENCES users(username),
                FOREIGN KEY (recipient) REFERENCES users(username)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }
}

impl Store for SqliteStore {
    fn find_user(&self, username: &str) -> Result<Option<UserRecord>> {
        let row = self
            .runtime
            .block_on(
                sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE username = ?")
                    .bind(username)
                    .fetch_optional(&self.pool),
            )
            .map_err(backend)?;

        row.map(UserRecord::try_from).transpose()
    }

    fn create_user(&self, username: &str, password_digest: &str) -> Result<()> {
        let result = self.runtime.block_on(
            sqlx::query(
                "INSERT INTO users (username, password_digest, root_dir, created_at) VALUES (?, ?, NULL, ?)",
            )
            .bind(username)
            .bind(password_digest)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool),
        );

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Duplicate(username.to_string()))
            }
            Err(e) => Err(backend(e)),
        }
    }

    fn set_root_dir(&self, username: &str, root_dir: &Path) -> Result<()> {
        let done = self
            .runtime
            .block_on(
                sqlx::query("UPDATE users SET root_dir = ? WHERE username = ?")
                    .bind(root_dir.to_string_lossy().to_string())
                    .bind(username)
                    .execute(&self.pool),
            )
            .map_err(backend)?;

        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(username.to_string()));
        }
        Ok(())
    }

    fn record_operation(&self, record: &OperationRecord) -> Result<()> {
        self.runtime
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO operation_log (username, client_ip, operation, filename, status, timestamp)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&record.username)
                .bind(record.client_ip.map(|ip| ip.to_string()))
                .bind(&record.operation)
                .bind(&record.filename)
                .bind(record.status.as_str())
                .bind(record.timestamp.to_rfc3339())
                .execute(&self.pool),
            )
            .map_err(backend)?;
        Ok(())
    }

    fn history(&self, username: &str, limit: usize) -> Result<Vec<OperationRecord>> {
        let rows = self
            .runtime
            .block_on(
                sqlx::query_as::<_, OperationRow>(
                    r#"
                    SELECT * FROM operation_log
                    WHERE username = ?
                    ORDER BY id DESC
                    LIMIT ?
                    "#,
                )
                .bind(username)
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .fetch_all(&self.pool),
            )
            .map_err(backend)?;

        rows.into_iter().map(OperationRecord::try_from).collect()
    }

    fn create_share(
        &self,
        owner: &str,
        recipient: &str,
        path: &str,
        filename: &str,
    ) -> Result<i64> {
        let done = self
            .runtime
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO file_shares (owner, recipient, path, filename, status, shared_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(owner)
                .bind(recipient)
                .bind(path)
                .bind(filename)
                .bind(ShareStatus::Pending.as_str())
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool),
            )
            .map_err(backend)?;

        Ok(done.last_insert_rowid())
    }

    fn pending_shares(&self, recipient: &str) -> Result<Vec<ShareRecord>> {
        let rows = self
            .runtime
            .block_on(
                sqlx::query_as::<_, ShareRow>(
                    "SELECT * FROM file_shares WHERE recipient = ? AND status = ? ORDER BY id",
                )
                .bind(recipient)
                .bind(ShareStatus::Pending.as_str())
                .fetch_all(&self.pool),
            )
            .map_err(backend)?;

        rows.into_iter().map(ShareRecord::try_from).collect()
    }

    fn find_pending_share(&self, id: i64, recipient: &str) -> Result<Option<ShareRecord>> {
        let row = self
            .runtime
            .block_on(
                sqlx::query_as::<_, ShareRow>(
                    "SELECT * FROM file_shares WHERE id = ? AND recipient = ? AND status = ?",
                )
                .bind(id)
                .bind(recipient)
                .bind(ShareStatus::Pending.as_str())
                .fetch_optional(&self.pool),
            )
            .map_err(backend)?;

        row.map(ShareRecord::try_from).transpose()
    }

    fn resolve_share(&self, id: i64, status: ShareStatus) -> Result<()> {
        let done = self
            .runtime
            .block_on(
                sqlx::query("UPDATE file_shares SET status = ?, resolved_at = ? WHERE id = ?")
                    .bind(status.as_str())
                    .bind(Utc::now().to_rfc3339())
                    .bind(id)
                    .execute(&self.pool),
            )
            .map_err(backend)?;

        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("share {id}")));
        }
        Ok(())
    }
}

// Row structures for SQLite
#[derive(sqlx::FromRow)]
struct UserRow {
    username: String,
    password_digest: String,
    root_dir: Option<String>,
    created_at: String,
}

impl TryFrom<UserRow> for UserRecord {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(UserRecord {
            username: row.username,
            password_digest: row.password_digest,
            root_dir: row.root_dir.filter(|d| !d.is_empty()).map(Into::into),
            created_at: parse_time(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    username: String,
    client_ip: Option<String>,
    operation: String,
    filename: Option<String>,
    status: String,
    timestamp: String,
}

impl TryFrom<OperationRow> for OperationRecord {
    type Error = StoreError;

    fn try_from(row: OperationRow) -> Result<Self> {
        Ok(OperationRecord {
            username: row.username,
            client_ip: row.client_ip.and_then(|ip| ip.parse().ok()),
            operation: row.operation,
            filename: row.filename,
            status: row.status.parse()?,
            timestamp: parse_time(&row.timestamp)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ShareRow {
    id: i64,
    owner: String,
    recipient: String,
    path: String,
    filename: String,
    status: String,
    shared_at: String,
    resolved_at: Option<String>,
}

impl TryFrom<ShareRow> for ShareRecord {
    type Error = StoreError;

    fn try_from(row: ShareRow) -> Result<Self> {
        Ok(ShareRecord {
            id: row.id,
            owner: row.owner,
            recipient: row.recipient,
            path: row.path,
            filename: row.filename,
            status: row.status.parse()?,
            shared_at: parse_time(&row.shared_at)?,
            resolved_at: row.resolved_at.as_deref().map(parse_time).transpose()?,
        })
    }
}
