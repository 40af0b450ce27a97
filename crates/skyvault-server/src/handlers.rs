//! Task execution and request handling
//!
//! Workers call [`Handler::run`] once per dequeued task. A task does as much
//! non-blocking work as the socket allows, leaves its progress in the
//! connection state and reports back to the event loop with a [`Signal`].

use crate::audit::{AuditEvent, Auditor};
use crate::byte_queue::ByteQueue;
use crate::config::Config;
use crate::connection::{Connection, ConnectionRegistry, ConnectionState, Phase};
use crate::error::{Error, Result};
use crate::protocol::codec::{FrameDecoder, encode_frame};
use crate::protocol::{
    FileEntry, HistoryEntry, Request, Response, ShareAction, ShareNotice, parse_request,
    progress_percent,
};
use crate::roots::RootCache;
use crate::sandbox;
use crate::session::{
    DownloadProgress, DownloadSession, SessionError, Transfer, UploadProgress, UploadSession,
};
use crate::task::{Next, Notifier, Signal, Task, TaskKind};
use chrono::Utc;
use mio::Interest;
use mio::net::TcpStream;
use skyvault_core::{ShareStatus, Store, StoreError, password_digest};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where an upload stands after pumping it
enum Pump {
    /// Waiting for more bytes
    Pending,
    /// Transfer over, connection back to control frames
    Finished,
    /// Peer is gone
    Close,
}

/// Shared state every worker needs to serve a task
pub struct Handler {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    auditor: Auditor,
    registry: Arc<ConnectionRegistry>,
    roots: RootCache,
    notifier: Notifier,
}

impl Handler {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        notifier: Notifier,
    ) -> Self {
        let auditor = Auditor::new(store.clone(), config.logging.audit_enabled);
        let roots = RootCache::new(&config.storage_root);
        Self {
            config,
            store,
            auditor,
            registry,
            roots,
            notifier,
        }
    }

    pub fn auditor(&self) -> &Auditor {
        &self.auditor
    }

    /// Execute one task and tell the event loop what to do next
    pub fn run(&self, task: Task) -> Result<()> {
        let Task { kind, conn } = task;
        let outcome = match kind {
            TaskKind::ControlMessage => self.control(&conn),
            TaskKind::ContinueUpload => self.continue_upload(&conn),
            TaskKind::ContinueDownload => self.continue_download(&conn),
        };

        let next = match &outcome {
            Ok(next) => *next,
            Err(e) => {
                debug!(
                    event = "task_failed",
                    conn_id = conn.id(),
                    task = ?kind,
                    error = %e,
                    "Closing connection after task failure"
                );
                Next::Close
            }
        };
        if next == Next::Close {
            self.teardown(&conn);
        }
        self.notifier.send(Signal::Done { id: conn.id(), next });

        outcome.map(|_| ())
    }

    /// Read, decode and answer control frames until the socket runs dry
    fn control(&self, conn: &Connection) -> Result<Next> {
        let mut guard = conn.lock_state();
        let state = &mut *guard;
        let mut stream = conn.stream();
        let mut buf = vec![0u8; self.config.transfer_buffer_size];
        let mut rerun = false;

        if state.transfer.is_idle() {
            self.deliver_mail(conn, state)?;
        }

        loop {
            while state.transfer.is_idle() {
                let payload = match state.decoder.next_frame() {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break,
                    Err(e) => {
                        // Framing is lost; nothing after this can be trusted
                        warn!(
                            event = "framing_error",
                            conn_id = conn.id(),
                            error = %e,
                            "Dropping connection"
                        );
                        return Ok(Next::Close);
                    }
                };
                self.dispatch(conn, state, &payload)?;
            }

            if matches!(state.transfer, Transfer::Upload(_)) {
                match self.pump_upload(conn, state, &mut buf)? {
                    Pump::Pending => break,
                    Pump::Finished => continue,
                    Pump::Close => return Ok(Next::Close),
                }
            }
            if matches!(state.transfer, Transfer::Download(_)) {
                // The download starts in its own task
                rerun = true;
                break;
            }

            match stream.read(&mut buf) {
                Ok(0) => {
                    debug!(event = "peer_closed", conn_id = conn.id(), "Peer closed connection");
                    return Ok(Next::Close);
                }
                Ok(n) => state.decoder.extend(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        self.finish(conn, state, rerun)
    }

    fn continue_upload(&self, conn: &Connection) -> Result<Next> {
        let mut guard = conn.lock_state();
        let state = &mut *guard;
        if !matches!(state.transfer, Transfer::Upload(_)) {
            return self.finish(conn, state, true);
        }

        let mut buf = vec![0u8; self.config.transfer_buffer_size];
        match self.pump_upload(conn, state, &mut buf)? {
            Pump::Pending => self.finish(conn, state, false),
            // Frames pipelined behind the upload may already be buffered
            Pump::Finished => self.finish(conn, state, true),
            Pump::Close => Ok(Next::Close),
        }
    }

    fn continue_download(&self, conn: &Connection) -> Result<Next> {
        let mut guard = conn.lock_state();
        let state = &mut *guard;
        let Transfer::Download(download) = &mut state.transfer else {
            return self.finish(conn, state, true);
        };

        if !download.is_announced() {
            // Failures are still reportable as frames until `ready_to_send` is queued
            if let Err(e) = download.open() {
                let path = download.path().to_path_buf();
                warn!(
                    event = "download_failed",
                    conn_id = conn.id(),
                    path = %path.display(),
                    error = %e,
                    "Download aborted before any data was sent"
                );
                self.end_transfer(conn, state);
                queue(
                    &mut state.outbox,
                    &Response::DownloadResult {
                        success: false,
                        message: "Filesystem error".to_string(),
                    },
                )?;
                self.audit_transfer(conn, "download", &path, Some(0), Some(e.to_string()));
                self.deliver_mail(conn, state)?;
                return self.finish(conn, state, true);
            }
            download.mark_announced();
            queue(&mut state.outbox, &Response::ReadyToSend)?;
        }

        // Raw bytes may not start until every queued frame is out
        let mut stream = conn.stream();
        if !state.outbox.drain_into(&mut stream)?.complete {
            return Ok(watch(Interest::WRITABLE, false));
        }

        let result = download.advance(&mut stream);
        let sent = download.total_sent();
        let total = download.total();
        let path = download.path().to_path_buf();

        match result {
            Ok(DownloadProgress::Blocked) => Ok(watch(Interest::WRITABLE, false)),
            Ok(DownloadProgress::Complete) => {
                self.end_transfer(conn, state);
                queue(
                    &mut state.outbox,
                    &Response::DownloadResult {
                        success: true,
                        message: "Download complete".to_string(),
                    },
                )?;
                self.audit_transfer(conn, "download", &path, Some(total), None);
                self.deliver_mail(conn, state)?;
                self.finish(conn, state, true)
            }
            Err(e) => {
                // The client is reading raw bytes; a frame now would be taken as data
                warn!(
                    event = "download_failed",
                    conn_id = conn.id(),
                    path = %path.display(),
                    sent,
                    total,
                    error = %e,
                    "Download aborted mid-stream"
                );
                self.audit_transfer(conn, "download", &path, Some(sent), Some(e.to_string()));
                Err(Error::Connection(e.to_string()))
            }
        }
    }

    /// Move upload bytes from the decoder and the socket into the file
    fn pump_upload(
        &self,
        conn: &Connection,
        state: &mut ConnectionState,
        buf: &mut [u8],
    ) -> Result<Pump> {
        loop {
            let Transfer::Upload(upload) = &mut state.transfer else {
                return Ok(Pump::Finished);
            };
            let before = upload.received();
            let result = feed_upload(upload, &mut state.decoder, conn.stream(), buf);
            let received = upload.received();
            let total = upload.filesize();
            let discarding = upload.is_discarding();
            let path = upload.path().to_path_buf();

            match result {
                Ok(UploadProgress::Pending) => {
                    if received > before && !discarding {
                        queue(&mut state.outbox, &upload_progress(true, received, total))?;
                    }
                    return Ok(Pump::Pending);
                }
                Ok(UploadProgress::Complete) => {
                    self.end_transfer(conn, state);
                    if !discarding {
                        queue(&mut state.outbox, &upload_progress(true, received, total))?;
                        queue(
                            &mut state.outbox,
                            &Response::UploadResult {
                                success: true,
                                message: "Upload complete".to_string(),
                            },
                        )?;
                        self.audit_transfer(conn, "upload", &path, Some(total), None);
                    }
                    self.deliver_mail(conn, state)?;
                    return Ok(Pump::Finished);
                }
                Err(SessionError::Filesystem(e)) => {
                    // Keep consuming the declared size so framing survives
                    warn!(
                        event = "upload_write_failed",
                        conn_id = conn.id(),
                        path = %path.display(),
                        received,
                        total,
                        error = %e,
                        "Discarding rest of upload"
                    );
                    queue(
                        &mut state.outbox,
                        &Response::UploadResult {
                            success: false,
                            message: "Filesystem error".to_string(),
                        },
                    )?;
                    self.audit_transfer(conn, "upload", &path, Some(received), Some(e.to_string()));
                }
                Err(SessionError::Disconnected) => {
                    info!(
                        event = "upload_interrupted",
                        conn_id = conn.id(),
                        received,
                        total,
                        "Peer closed connection during upload"
                    );
                    self.audit_transfer(
                        conn,
                        "upload",
                        &path,
                        Some(received),
                        Some("connection closed".to_string()),
                    );
                    return Ok(Pump::Close);
                }
                Err(SessionError::Network(e)) => {
                    // Best effort; the socket is probably unusable
                    let _ = queue(&mut state.outbox, &upload_progress(false, received, total));
                    let _ = state.outbox.drain_into(&mut conn.stream());
                    self.audit_transfer(conn, "upload", &path, Some(received), Some(e.to_string()));
                    return Err(Error::Io(e));
                }
            }
        }
    }

    /// Return the connection to control frames
    fn end_transfer(&self, conn: &Connection, state: &mut ConnectionState) {
        state.transfer = Transfer::Idle;
        conn.set_phase(Phase::Idle);
    }

    /// Flush what the socket takes and pick the next interest
    fn finish(&self, conn: &Connection, state: &mut ConnectionState, rerun: bool) -> Result<Next> {
        state.outbox.drain_into(&mut conn.stream())?;
        Ok(watch(conn.desired_interest(state), rerun))
    }

    /// Move mail from other connections into the outbox
    fn deliver_mail(&self, conn: &Connection, state: &mut ConnectionState) -> Result<()> {
        if !state.transfer.is_idle() {
            return Ok(());
        }
        for message in conn.take_mail() {
            queue(&mut state.outbox, &message)?;
        }
        Ok(())
    }

    /// Record the end of a session before its socket is closed
    pub(crate) fn teardown(&self, conn: &Connection) {
        if !conn.mark_closed() {
            return;
        }
        let username = conn.username();
        if let Some(username) = &username {
            self.auditor
                .record(username, conn.client_ip(), "logout", None, true);
        }
        self.auditor.emit(AuditEvent::ConnectionClosed {
            conn_id: conn.id(),
            client_ip: conn.client_ip(),
            username,
            timestamp: Utc::now(),
            duration_secs: conn.age_secs(),
        });
    }

    /// Decode one frame, run the request and queue the replies
    fn dispatch(&self, conn: &Connection, state: &mut ConnectionState, payload: &[u8]) -> Result<()> {
        let request = match parse_request(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(
                    event = "bad_request",
                    conn_id = conn.id(),
                    error = ?err,
                    "Rejected request"
                );
                return queue(&mut state.outbox, &err.response());
            }
        };

        let kind = request.kind();
        debug!(event = "request", conn_id = conn.id(), kind = ?kind, "Handling request");

        let replies = match self.handle(conn, state, request) {
            Ok(replies) => replies,
            Err(e) => {
                self.report(conn, &e);
                vec![kind.failure(e.sanitized_message())]
            }
        };
        for reply in &replies {
            queue(&mut state.outbox, reply)?;
        }
        Ok(())
    }

    fn report(&self, conn: &Connection, err: &Error) {
        if err.is_security_event() {
            self.auditor.security_event(
                conn.client_ip(),
                conn.username(),
                "request_rejected",
                err.to_string(),
            );
        } else if err.is_client_error() {
            debug!(conn_id = conn.id(), error = %err, "Request failed");
        } else {
            warn!(
                event = "request_failed",
                conn_id = conn.id(),
                error = %err,
                "Request failed"
            );
        }
    }

    fn handle(
        &self,
        conn: &Connection,
        state: &mut ConnectionState,
        request: Request,
    ) -> Result<Vec<Response>> {
        match request {
            Request::Login { username, password } => self.login(conn, &username, &password),
            Request::Register { username, password } => {
                self.register(conn, &username, &password).map(|r| vec![r])
            }
            Request::List { path } => self.list(conn, &path).map(|r| vec![r]),
            Request::Upload {
                filename,
                size,
                path,
            } => self
                .start_upload(conn, state, &path, &filename, size)
                .map(|r| vec![r]),
            Request::Download { filename, path } => self
                .prepare_download(conn, state, &path, &filename)
                .map(|r| vec![r]),
            Request::ReadyToReceive => self.start_download(conn, state),
            Request::Delete { filename, path } => {
                self.delete(conn, &path, &filename).map(|r| vec![r])
            }
            Request::Share {
                recipient,
                filename,
                path,
            } => self.share(conn, &recipient, &path, &filename).map(|r| vec![r]),
            Request::ShareResponse { share_id, action } => {
                self.share_response(conn, share_id, action).map(|r| vec![r])
            }
            Request::HistoryQuery => self.history(conn).map(|r| vec![r]),
        }
    }

    /// Logged-in username and storage root
    fn session(&self, conn: &Connection) -> Result<(String, PathBuf)> {
        let username = conn.username().ok_or_else(Error::not_logged_in)?;
        let root = self.roots.resolve(self.store.as_ref(), &username)?;
        Ok((username, root))
    }

    fn login(&self, conn: &Connection, username: &str, password: &str) -> Result<Vec<Response>> {
        let client_ip = conn.client_ip();
        if username.is_empty() || password.is_empty() {
            return Ok(vec![Response::LoginResult {
                success: false,
                message: "Username and password are required".to_string(),
            }]);
        }

        let user = self.store.find_user(username)?;
        let verified = user
            .as_ref()
            .is_some_and(|user| user.verify_password(password));
        if !verified {
            let reason = if user.is_some() {
                self.auditor.record(username, client_ip, "login", None, false);
                "wrong password"
            } else {
                "unknown user"
            };
            self.auditor.emit(AuditEvent::AuthAttempt {
                client_ip,
                username: username.to_string(),
                timestamp: Utc::now(),
                success: false,
                reason: Some(reason.to_string()),
            });
            return Ok(vec![Response::LoginResult {
                success: false,
                message: "Invalid username or password".to_string(),
            }]);
        }

        self.roots.ensure(self.store.as_ref(), username)?;
        self.registry.bind_user(conn, username);
        self.auditor.emit(AuditEvent::AuthAttempt {
            client_ip,
            username: username.to_string(),
            timestamp: Utc::now(),
            success: true,
            reason: None,
        });
        self.auditor.record(username, client_ip, "login", None, true);

        let mut replies = vec![Response::LoginResult {
            success: true,
            message: "Login successful".to_string(),
        }];
        let pending = self.store.pending_shares(username)?;
        if !pending.is_empty() {
            replies.push(Response::PendingShares {
                shares: pending
                    .into_iter()
                    .map(|share| ShareNotice {
                        id: share.id,
                        owner: share.owner,
                        filename: share.filename,
                    })
                    .collect(),
            });
        }
        Ok(replies)
    }

    fn register(&self, conn: &Connection, username: &str, password: &str) -> Result<Response> {
        let failure = |message: &str| Response::RegisterResult {
            success: false,
            message: message.to_string(),
        };

        if username.is_empty() || password.is_empty() {
            return Ok(failure("Username and password are required"));
        }
        if sandbox::validate_filename(username).is_err() {
            return Ok(failure("Invalid username"));
        }

        match self
            .store
            .create_user(username, &password_digest(username, password))
        {
            Ok(()) => {
                info!(
                    event = "user_registered",
                    username,
                    client_ip = ?conn.client_ip(),
                    "Registered new user"
                );
                Ok(Response::RegisterResult {
                    success: true,
                    message: "Registration successful".to_string(),
                })
            }
            Err(StoreError::Duplicate(_)) => Ok(failure("Username already exists")),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, conn: &Connection, user_path: &str) -> Result<Response> {
        let (_, root) = self.session(conn)?;
        let dir = sandbox::resolve_existing(&root, user_path, "")?;
        if !dir.is_dir() {
            return Err(Error::protocol("Not a directory"));
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "." || name == ".." {
                continue;
            }
            // Follow symlinks for the listing, fall back to the link itself
            let metadata = match entry.path().metadata() {
                Ok(metadata) => metadata,
                Err(_) => entry.metadata()?,
            };
            let is_directory = metadata.is_dir();
            files.push(FileEntry {
                name,
                is_directory,
                size: if is_directory { 0 } else { metadata.len() },
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Response::FileList {
            success: true,
            files,
            message: None,
        })
    }

    fn start_upload(
        &self,
        conn: &Connection,
        state: &mut ConnectionState,
        user_path: &str,
        filename: &str,
        size: u64,
    ) -> Result<Response> {
        let (username, root) = self.session(conn)?;
        let target = sandbox::resolve_for_create(&root, user_path, filename)?;
        let upload = UploadSession::create(&target, size)?;

        info!(
            event = "upload_started",
            conn_id = conn.id(),
            username,
            path = %sandbox::display_name(user_path, filename),
            size,
            "Receiving upload"
        );
        state.transfer = Transfer::Upload(upload);
        conn.set_phase(Phase::Receiving);
        Ok(Response::ReadyToReceive)
    }

    fn prepare_download(
        &self,
        conn: &Connection,
        state: &mut ConnectionState,
        user_path: &str,
        filename: &str,
    ) -> Result<Response> {
        let (_, root) = self.session(conn)?;
        sandbox::validate_filename(filename)?;
        let source = sandbox::resolve_existing(&root, user_path, filename)?;
        let metadata = std::fs::metadata(&source)?;
        if metadata.is_dir() {
            return Err(Error::protocol("Downloading directories is not supported"));
        }

        let size = metadata.len();
        state.pending_download = Some(DownloadSession::new(
            &source,
            size,
            self.config.transfer_buffer_size,
        ));
        Ok(Response::DownloadMeta {
            filename: filename.to_string(),
            size,
            is_directory: false,
        })
    }

    fn start_download(&self, conn: &Connection, state: &mut ConnectionState) -> Result<Vec<Response>> {
        if !conn.is_authenticated() {
            return Err(Error::not_logged_in());
        }
        let Some(download) = state.pending_download.take() else {
            return Ok(vec![Response::DownloadResult {
                success: false,
                message: "No download prepared".to_string(),
            }]);
        };

        info!(
            event = "download_started",
            conn_id = conn.id(),
            path = %download.path().display(),
            size = download.total(),
            "Sending download"
        );
        state.transfer = Transfer::Download(download);
        conn.set_phase(Phase::Sending);
        // `ready_to_send` is queued by the download task itself
        Ok(Vec::new())
    }

    fn delete(&self, conn: &Connection, user_path: &str, filename: &str) -> Result<Response> {
        let (username, root) = self.session(conn)?;
        let client_ip = conn.client_ip();
        let shown = sandbox::display_name(user_path, filename);

        let target = match sandbox::resolve_existing(&root, user_path, filename) {
            Ok(target) => target,
            Err(e) => {
                self.auditor
                    .record(&username, client_ip, "delete", Some(filename), false);
                return Err(e);
            }
        };
        if target == root.canonicalize()? {
            self.auditor
                .record(&username, client_ip, "delete", Some(filename), false);
            return Err(Error::invalid_path("refusing to delete the user root"));
        }

        let removed = if target.is_dir() {
            std::fs::remove_dir_all(&target)
        } else {
            std::fs::remove_file(&target)
        };
        let error = removed.as_ref().err().map(ToString::to_string);
        self.auditor.file_operation(
            &username,
            client_ip,
            "delete",
            &shown,
            filename,
            None,
            error,
        );

        Ok(match removed {
            Ok(()) => Response::DeleteResult {
                success: true,
                message: "Deleted".to_string(),
            },
            Err(e) => {
                warn!(
                    event = "delete_failed",
                    conn_id = conn.id(),
                    path = %shown,
                    error = %e,
                    "Delete failed"
                );
                Response::DeleteResult {
                    success: false,
                    message: "Delete failed".to_string(),
                }
            }
        })
    }

    fn share(
        &self,
        conn: &Connection,
        recipient: &str,
        user_path: &str,
        filename: &str,
    ) -> Result<Response> {
        let (owner, root) = self.session(conn)?;
        let client_ip = conn.client_ip();
        let failure = |message: &str| Response::ShareResult {
            success: false,
            message: message.to_string(),
        };

        if recipient == owner {
            return Ok(failure("Cannot share a file with yourself"));
        }
        if self.store.find_user(recipient)?.is_none() {
            return Ok(failure("Recipient does not exist"));
        }
        sandbox::validate_filename(filename)?;
        let source = sandbox::resolve_existing(&root, user_path, filename)?;
        if !source.is_file() {
            return Ok(failure("Only regular files can be shared"));
        }

        let id = self
            .store
            .create_share(&owner, recipient, user_path, filename)?;
        self.auditor
            .record(&owner, client_ip, "share", Some(filename), true);

        let notice = Response::ShareRequest {
            id,
            owner: owner.clone(),
            filename: filename.to_string(),
        };
        let online = self.registry.connections_for(recipient);
        for target in &online {
            target.post(notice.clone());
            self.notifier.send(Signal::Notify { id: target.id() });
        }
        info!(
            event = "share_created",
            share_id = id,
            owner,
            recipient,
            filename,
            delivered = online.len(),
            "Share created"
        );

        Ok(Response::ShareResult {
            success: true,
            message: "Share sent, waiting for the recipient".to_string(),
        })
    }

    fn share_response(
        &self,
        conn: &Connection,
        share_id: i64,
        action: ShareAction,
    ) -> Result<Response> {
        let (username, root) = self.session(conn)?;
        let client_ip = conn.client_ip();

        let Some(share) = self.store.find_pending_share(share_id, &username)? else {
            return Ok(Response::ShareResult {
                success: false,
                message: "Share not found or already handled".to_string(),
            });
        };

        let (operation, status, message) = match action {
            ShareAction::Accept => ("accept_share", ShareStatus::Accepted, "Share accepted"),
            ShareAction::Reject => ("reject_share", ShareStatus::Rejected, "Share rejected"),
        };

        if action == ShareAction::Accept {
            if let Err(e) = self.copy_shared(&share.owner, &share.path, &share.filename, &root) {
                warn!(
                    event = "share_copy_failed",
                    share_id,
                    owner = %share.owner,
                    recipient = %username,
                    error = %e,
                    "Failed to copy shared file"
                );
                self.auditor
                    .record(&username, client_ip, operation, Some(&share.filename), false);
                return Ok(Response::ShareResult {
                    success: false,
                    message: "Failed to receive the shared file".to_string(),
                });
            }
        }

        self.store.resolve_share(share_id, status)?;
        self.auditor
            .record(&username, client_ip, operation, Some(&share.filename), true);
        Ok(Response::ShareResult {
            success: true,
            message: message.to_string(),
        })
    }

    /// Copy `<owner root>/<path>/<filename>` to `<recipient root>/shared/<filename>`
    fn copy_shared(
        &self,
        owner: &str,
        user_path: &str,
        filename: &str,
        recipient_root: &Path,
    ) -> Result<u64> {
        let owner_root = self.roots.resolve(self.store.as_ref(), owner)?;
        let source = sandbox::resolve_existing(&owner_root, user_path, filename)?;

        let shared = recipient_root.join("shared");
        std::fs::create_dir_all(&shared)?;
        let destination = sandbox::resolve_for_create(recipient_root, "/shared", filename)?;
        Ok(std::fs::copy(source, destination)?)
    }

    fn history(&self, conn: &Connection) -> Result<Response> {
        let (username, _) = self.session(conn)?;
        let records = self
            .store
            .history(&username, self.config.history_limit)?
            .into_iter()
            .map(|record| HistoryEntry {
                filename: record.filename.unwrap_or_default(),
                operation: record.operation,
                time: record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                status: record.status.as_str().to_string(),
            })
            .collect();

        Ok(Response::HistoryResult {
            success: true,
            records,
            message: None,
        })
    }

    /// Log a finished or failed transfer with the path as the user sees it
    fn audit_transfer(
        &self,
        conn: &Connection,
        operation: &str,
        path: &Path,
        bytes: Option<u64>,
        error: Option<String>,
    ) {
        let Some(username) = conn.username() else {
            return;
        };
        let shown = match self.roots.get(&username) {
            Some(root) => path
                .strip_prefix(&root)
                .map(|rel| format!("/{}", rel.display()))
                .unwrap_or_else(|_| path.display().to_string()),
            None => path.display().to_string(),
        };
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.auditor.file_operation(
            &username,
            conn.client_ip(),
            operation,
            &shown,
            &filename,
            bytes,
            error,
        );
    }
}

/// Hand buffered bytes to the upload first, then read the socket
fn feed_upload(
    upload: &mut UploadSession,
    decoder: &mut FrameDecoder,
    mut stream: &TcpStream,
    buf: &mut [u8],
) -> std::result::Result<UploadProgress, SessionError> {
    let remaining = usize::try_from(upload.remaining()).unwrap_or(usize::MAX);
    let buffered = decoder.take_raw(remaining);
    if !buffered.is_empty() {
        upload.ingest(&buffered)?;
    }
    upload.advance(&mut stream, buf)
}

/// Append one encoded frame; an overflowing outbox means the peer stopped reading
fn queue(outbox: &mut ByteQueue, message: &Response) -> Result<()> {
    let frame = encode_frame(message)?;
    outbox.push(&frame).map_err(Error::Io)
}

fn upload_progress(success: bool, received: u64, total: u64) -> Response {
    Response::UploadProgress {
        success,
        progress: progress_percent(received, total),
        received,
        total,
    }
}

fn watch(interest: Interest, rerun: bool) -> Next {
    Next::Watch { interest, rerun }
}
