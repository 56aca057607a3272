//! File manager session: one tunnel, its pipelines, and the dispatch between them
//!
//! [`FileManager`] is synchronous and owns no timers or tasks. The owner feeds it
//! [`TransportEvent`]s through [`FileManager::handle_event`] and wakes it at
//! [`FileManager::next_deadline`] through [`FileManager::on_deadline`]; every
//! call takes the current instant so behaviour is deterministic under test.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::classify::{self, ErrorLog, FileError, FileErrorKind};
use crate::config::ManagerConfig;
use crate::correlator::{Correlator, Reply, ReplyReceiver, RequestKind};
use crate::download::{DownloadOutcome, DownloadReceiver, DownloadTask, Downloader};
use crate::error::{OperationError, Result};
use crate::events::{Direction, FileManagerEvents};
use crate::journal::{JournalEntry, TransferJournal, TransferStatus};
use crate::message::{
    ctrl_message, decode_text, decode_value, parse_entries, CtrlMessage, DirectoryListing,
    DownloadControl, ErrorMessage, FileEntry, OperationResponse, Request, ServerMessage,
    UploadControl,
};
use crate::ops;
use crate::protocol::ctrl_type;
use crate::protocol_core::{looks_like_json, split_chunk_message, FrameDecoder};
use crate::transport::{Link, Transport, TransportEvent, TunnelState};
use crate::upload::{
    HashJob, HashedSource, UploadReceiver, UploadSource, UploadStatus, UploadTask, Uploader,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ConnectedToServer,
    ConnectedEndToEnd,
    Failed,
}

impl From<TunnelState> for ConnectionState {
    fn from(state: TunnelState) -> Self {
        match state {
            TunnelState::Disconnected => ConnectionState::Disconnected,
            TunnelState::Connecting => ConnectionState::Connecting,
            TunnelState::ConnectedToServer => ConnectionState::ConnectedToServer,
            TunnelState::EndToEnd => ConnectionState::ConnectedEndToEnd,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ConnectedToServer => "connected to server",
            ConnectionState::ConnectedEndToEnd => "connected end-to-end",
            ConnectionState::Failed => "failed",
        })
    }
}

/// Content of a `get` reply
pub fn file_content(reply: Reply) -> Result<Vec<u8>> {
    match reply {
        Reply::Response(body) => match body.get("data").and_then(Value::as_str) {
            Some(data) => ops::decode_file_content(data),
            None => Ok(Vec::new()),
        },
        Reply::Listing(_) => Err(OperationError::Server("Unexpected listing reply".to_string())),
    }
}

/// Entries of a `findfile` reply
pub fn search_results(reply: Reply) -> Vec<FileEntry> {
    match reply {
        Reply::Response(body) => parse_entries(body.get("files")),
        Reply::Listing(entries) => entries,
    }
}

pub struct FileManager {
    transport: Box<dyn Transport>,
    config: ManagerConfig,
    events: Arc<dyn FileManagerEvents>,
    journal: Option<TransferJournal>,
    state: ConnectionState,

    correlator: Correlator,
    uploader: Uploader,
    downloader: Downloader,
    decoder: FrameDecoder,
    errors: ErrorLog,

    current_path: String,
    current_files: Vec<FileEntry>,
    // (normalized path, reqid) of the listing in flight for the view
    loading: Option<(String, String)>,
    listing_paths: HashMap<String, String>,

    options_sent: bool,
    initial_listing_requested: bool,
}

impl FileManager {
    pub fn new(
        transport: Box<dyn Transport>,
        config: ManagerConfig,
        events: Arc<dyn FileManagerEvents>,
    ) -> Self {
        let state = ConnectionState::from(transport.state());
        Self {
            journal: config.journal.as_ref().map(TransferJournal::new),
            uploader: Uploader::new(config.chunk_size, config.hash_check_limit, config.send_retry()),
            downloader: Downloader::new(config.download_dir.clone()),
            transport,
            config,
            events,
            state,
            correlator: Correlator::new(),
            decoder: FrameDecoder::new(),
            errors: ErrorLog::default(),
            current_path: String::new(),
            current_files: Vec::new(),
            loading: None,
            listing_paths: HashMap::new(),
            options_sent: false,
            initial_listing_requested: false,
        }
    }

    // ---- connection lifecycle ----

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::ConnectedEndToEnd
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "Connection state");
            self.state = state;
            self.events.state_changed(state);
        }
    }

    pub fn connect(&mut self) -> Result<()> {
        self.options_sent = false;
        self.initial_listing_requested = false;
        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.transport.start() {
            self.report_error(&format!("Connection lost: {}", e), None);
            self.set_state(ConnectionState::Failed);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.transport.stop();
        self.teardown();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Full teardown and rebuild; only evicted terminal tasks survive
    pub fn reconnect(&mut self) -> Result<()> {
        tracing::info!("Reconnecting tunnel");
        self.disconnect();
        self.connect()
    }

    fn teardown(&mut self) {
        let failed = self.correlator.fail_all(OperationError::Disconnected);
        for task in self.uploader.interrupt_all() {
            self.journal_upload(&task, TransferStatus::Interrupted);
        }
        for task in self.downloader.interrupt_all() {
            self.journal_download(&task, TransferStatus::Interrupted);
        }
        self.decoder.reset();
        self.options_sent = false;
        self.initial_listing_requested = false;
        self.loading = None;
        self.listing_paths.clear();
        if failed > 0 {
            tracing::info!(failed, "Pending operations failed on disconnect");
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::State(state) => self.on_tunnel_state(state, now),
            TransportEvent::Text(text) => self.on_text(&text, now),
            TransportEvent::Binary(data) => self.on_binary(&data, now),
            TransportEvent::Ctrl(value) => self.on_ctrl(CtrlMessage::from_value(value)),
            TransportEvent::Console(msg) => tracing::info!(msg = %msg, "Agent console"),
            TransportEvent::PairingRequested(relay_id) => self.events.pairing_requested(&relay_id),
            TransportEvent::Failed(reason) => {
                self.report_error(&reason, None);
                self.teardown();
                self.set_state(ConnectionState::Failed);
            }
        }
    }

    fn on_tunnel_state(&mut self, tunnel: TunnelState, now: Instant) {
        match tunnel {
            TunnelState::Disconnected => {
                self.teardown();
                // A failure already reported keeps its state until the next connect
                if self.state != ConnectionState::Failed {
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            TunnelState::Connecting => self.set_state(ConnectionState::Connecting),
            TunnelState::ConnectedToServer => {
                self.set_state(ConnectionState::ConnectedToServer);
                self.send_options();
            }
            TunnelState::EndToEnd => self.on_end_to_end(now, false),
        }
    }

    fn send_options(&mut self) {
        if self.options_sent {
            return;
        }
        let options = ctrl_message(ctrl_type::OPTIONS, json!({"consent": self.config.consent}));
        match self.transport.send_ctrl(&options) {
            Ok(()) => self.options_sent = true,
            Err(e) => tracing::warn!("Failed to send relay options: {}", e),
        }
    }

    fn on_end_to_end(&mut self, now: Instant, relist: bool) {
        self.set_state(ConnectionState::ConnectedEndToEnd);
        if relist || !self.initial_listing_requested {
            self.initial_listing_requested = true;
            let path = self.current_path.clone();
            if let Err(e) = self.list_directory(&path, now) {
                tracing::warn!(path = %path, "Initial listing failed: {}", e);
            }
        }
    }

    // ---- timers ----

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.correlator.next_deadline(), self.uploader.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_deadline(&mut self, now: Instant) {
        for reqid in self.correlator.expire(now) {
            self.listing_paths.remove(&reqid);
            if self.loading.as_ref().is_some_and(|(_, id)| *id == reqid) {
                self.loading = None;
            }
        }
        let failed = {
            let mut link = Link::new(Some(&mut *self.transport));
            self.uploader.poll_retries(&mut link, now)
        };
        for task in failed {
            self.upload_settled(task, now);
        }
    }

    // ---- inbound dispatch ----

    fn on_text(&mut self, text: &str, now: Instant) {
        match decode_text(text) {
            Ok(message) => self.dispatch(message, now),
            Err(_) if text.contains('\0') || text.chars().next().is_some_and(|c| !c.is_ascii()) => {
                tracing::trace!(len = text.len(), "Non-JSON text routed as binary");
                self.on_binary(text.as_bytes(), now);
            }
            Err(_) if text.starts_with('{') => {
                tracing::debug!(len = text.len(), "Dropping truncated JSON message");
            }
            Err(_) => tracing::debug!(text = %text, "Ignoring non-JSON text"),
        }
    }

    fn on_binary(&mut self, data: &[u8], now: Instant) {
        if looks_like_json(data) {
            if let Ok(value) = serde_json::from_slice::<Value>(data) {
                self.dispatch(decode_value(value), now);
                return;
            }
        }

        if self.transport.preserves_message_boundaries() {
            match split_chunk_message(data) {
                Some((payload, is_final)) => self.on_chunk(payload, is_final),
                None => tracing::debug!(len = data.len(), "Runt binary message dropped"),
            }
            return;
        }

        let mut chunks = Vec::new();
        if let Err(e) = self
            .decoder
            .push(data, |payload, is_final| chunks.push((payload.to_vec(), is_final)))
        {
            tracing::warn!("Frame decoder reset: {}", e);
        }
        for (payload, is_final) in chunks {
            self.on_chunk(&payload, is_final);
        }
    }

    fn on_chunk(&mut self, payload: &[u8], is_final: bool) {
        if !self.downloader.has_active() {
            tracing::debug!(len = payload.len(), "Binary data with no active download");
            return;
        }
        let outcome = {
            let mut link = Link::new(Some(&mut *self.transport));
            self.downloader
                .handle_chunk(payload, is_final, &mut link, self.events.as_ref())
        };
        if let Some(outcome) = outcome {
            self.download_settled(outcome);
        }
    }

    fn dispatch(&mut self, message: ServerMessage, now: Instant) {
        match message {
            ServerMessage::Ctrl(ctrl) => self.on_ctrl(ctrl),
            ServerMessage::Listing(listing) => self.on_listing(listing, now),
            ServerMessage::Upload(control) => self.on_upload(control, now),
            ServerMessage::Download(control) => self.on_download(control),
            ServerMessage::Dialog(msg) => {
                tracing::info!(msg = msg.as_deref().unwrap_or(""), "Agent dialog message")
            }
            ServerMessage::Error(error) => self.on_error_message(error, now),
            ServerMessage::Connected => self.on_end_to_end(now, true),
            ServerMessage::Response(response) => self.on_response(response, now),
            ServerMessage::Ignored => tracing::trace!("Ignoring message without action"),
        }
    }

    fn on_ctrl(&mut self, ctrl: CtrlMessage) {
        match ctrl {
            CtrlMessage::Ping => {
                let pong = ctrl_message(ctrl_type::PONG, json!({}));
                if let Err(e) = self.transport.send_ctrl(&pong) {
                    tracing::debug!("Failed to answer ping: {}", e);
                }
            }
            CtrlMessage::Pong => tracing::trace!("Relay pong"),
            CtrlMessage::Close { reason } => {
                tracing::info!(reason = reason.as_deref().unwrap_or(""), "Agent closed the session")
            }
            CtrlMessage::Console { msg } => {
                tracing::info!(msg = msg.as_deref().unwrap_or(""), "Agent console")
            }
            CtrlMessage::Options(v) | CtrlMessage::Other(v) => {
                tracing::debug!(ctrl = %v, "Control message")
            }
        }
    }

    fn on_listing(&mut self, listing: DirectoryListing, now: Instant) {
        let reqid = listing
            .reqid
            .clone()
            .or_else(|| self.correlator.oldest_pending_listing());
        let path = reqid
            .as_ref()
            .and_then(|id| self.listing_paths.remove(id))
            .or(listing.path)
            .unwrap_or_else(|| self.current_path.clone());

        if self.loading.as_ref().is_some_and(|(p, id)| {
            Some(id) == reqid.as_ref() || *p == path
        }) {
            self.loading = None;
        }
        self.current_path = path;
        self.current_files = listing.entries;
        self.events
            .directory_changed(&self.current_path, &self.current_files);

        if let Some(reqid) = reqid {
            self.correlator
                .resolve(&reqid, Reply::Listing(self.current_files.clone()), now);
        }
    }

    fn on_upload(&mut self, control: UploadControl, now: Instant) {
        let settled = {
            let mut link = Link::new(Some(&mut *self.transport));
            let events = self.events.as_ref();
            match control {
                UploadControl::Hash {
                    reqid,
                    exists,
                    offset,
                } => self
                    .uploader
                    .handle_hash(&reqid, exists, offset, &mut link, events),
                UploadControl::Start { reqid, offset } => {
                    self.uploader.handle_start(&reqid, offset, &mut link, now)
                }
                UploadControl::Ack { reqid, offset } => {
                    self.uploader
                        .handle_ack(&reqid, offset, &mut link, events, now)
                }
                UploadControl::Done { reqid } => self.uploader.handle_done(&reqid, events),
                UploadControl::Error { reqid, error } => self.uploader.handle_error(&reqid, &error),
            }
        };
        if let Some(task) = settled {
            self.upload_settled(task, now);
        }
    }

    fn upload_settled(&mut self, task: UploadTask, now: Instant) {
        match task.status {
            UploadStatus::Completed => {
                self.journal_upload(&task, TransferStatus::Completed);
                if self.is_ready() {
                    let path = self.current_path.clone();
                    if let Err(e) = self.list_directory(&path, now) {
                        tracing::debug!("Refresh after upload failed: {}", e);
                    }
                }
            }
            UploadStatus::Failed => {
                let error = task.error.clone().unwrap_or_default();
                self.report_error(&error, Some(&task.file_name));
                self.journal_upload(&task, TransferStatus::Failed);
            }
            _ => {}
        }
    }

    fn on_download(&mut self, control: DownloadControl) {
        let outcome = {
            let mut link = Link::new(Some(&mut *self.transport));
            self.downloader
                .handle_control(control, &mut link, self.events.as_ref())
        };
        if let Some(outcome) = outcome {
            self.download_settled(outcome);
        }
    }

    fn download_settled(&mut self, outcome: DownloadOutcome) {
        match outcome {
            DownloadOutcome::Completed(done) => {
                if let Some(journal) = &self.journal {
                    let size = done.data.len() as u64;
                    journal.record(
                        JournalEntry::new(
                            &done.id,
                            Direction::Download,
                            &done.remote_path,
                            &done.name,
                            TransferStatus::Completed,
                        )
                        .bytes(size, size),
                    );
                }
            }
            DownloadOutcome::CancelledByServer(task) => {
                self.journal_download(&task, TransferStatus::Cancelled)
            }
            DownloadOutcome::Failed(task) => {
                let error = task.error.clone().unwrap_or_default();
                self.report_error(&error, Some(&task.file_name));
                self.journal_download(&task, TransferStatus::Failed);
            }
        }
    }

    fn on_error_message(&mut self, message: ErrorMessage, now: Instant) {
        let error = classify::parse_error(&message.raw)
            .unwrap_or_else(|| classify::create_error(&message.error, None));
        self.record_error(error);

        let Some(reqid) = message.reqid else {
            return;
        };
        if self.uploader.get(&reqid).is_some() {
            if let Some(task) = self.uploader.handle_error(&reqid, &message.error) {
                self.journal_upload(&task, TransferStatus::Failed);
            }
            return;
        }
        self.listing_paths.remove(&reqid);
        self.correlator
            .reject(&reqid, OperationError::Server(message.error), now);
    }

    fn on_response(&mut self, response: OperationResponse, now: Instant) {
        let Some(reqid) = response.reqid else {
            tracing::debug!(action = ?response.action, "Response without reqid ignored");
            return;
        };
        // an explicit "ok" or an action echo wins over an error field
        let succeeded = response.result.as_ref().and_then(|r| r.as_str()) == Some("ok")
            || response.action.is_some();
        match response.error {
            Some(error) if !succeeded => {
                self.report_error(&error, None);
                self.correlator
                    .reject(&reqid, OperationError::Server(error), now);
            }
            error => {
                if let Some(error) = error {
                    tracing::debug!(reqid = %reqid, "Error field on a successful reply: {}", error);
                }
                self.correlator
                    .resolve(&reqid, Reply::Response(response.body), now);
            }
        }
    }

    // ---- errors ----

    fn report_error(&mut self, error: &str, details: Option<&str>) {
        self.record_error(classify::create_error(error, details));
    }

    fn record_error(&mut self, error: FileError) {
        self.events.error(&error);
        self.errors.record(error);
    }

    pub fn error_history(&self) -> Vec<FileError> {
        self.errors.history()
    }

    pub fn last_error(&self) -> Option<&FileError> {
        self.errors.last()
    }

    pub fn error_counts(&self) -> HashMap<FileErrorKind, usize> {
        self.errors.counts()
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    // ---- journal ----

    fn journal_upload(&self, task: &UploadTask, status: TransferStatus) {
        if let Some(journal) = &self.journal {
            journal.record(
                JournalEntry::new(
                    &task.id,
                    Direction::Upload,
                    &task.remote_path,
                    &task.file_name,
                    status,
                )
                .bytes(task.bytes_uploaded, task.total_bytes)
                .hash(task.hash.as_deref())
                .error(task.error.as_deref()),
            );
        }
    }

    fn journal_download(&self, task: &DownloadTask, status: TransferStatus) {
        if let Some(journal) = &self.journal {
            journal.record(
                JournalEntry::new(
                    &task.id,
                    Direction::Download,
                    &task.remote_path,
                    &task.file_name,
                    status,
                )
                .bytes(task.received_size, task.total_size)
                .error(task.error.as_deref()),
            );
        }
    }

    pub fn journal(&self) -> Option<&TransferJournal> {
        self.journal.as_ref()
    }

    // ---- correlated operations ----

    /// Send `request` and track its reply; a failed send rejects immediately
    pub fn send_operation(&mut self, request: &Request, now: Instant) -> Result<ReplyReceiver> {
        let kind = if request.is_listing() {
            RequestKind::Listing
        } else {
            RequestKind::Operation
        };
        let reqid = request.reqid().to_string();
        let rx = self
            .correlator
            .register(&reqid, kind, self.config.operation_timeout(), now)?;
        let sent = Link::new(Some(&mut *self.transport)).send_request(request);
        if let Err(e) = sent {
            tracing::debug!(reqid = %reqid, "Request send failed: {}", e);
            self.correlator.abandon(&reqid, OperationError::SendFailed);
            return Err(OperationError::SendFailed);
        }
        Ok(rx)
    }

    fn send_uncorrelated(&mut self, request: &Request) -> Result<()> {
        Link::new(Some(&mut *self.transport))
            .send_request(request)
            .map_err(|e| {
                tracing::debug!(reqid = %request.reqid(), "Request send failed: {}", e);
                OperationError::SendFailed
            })
    }

    // ---- navigation ----

    /// Path of the directory in view; root is shown as `/`
    pub fn current_path(&self) -> &str {
        if self.current_path.is_empty() {
            "/"
        } else {
            &self.current_path
        }
    }

    pub fn current_files(&self) -> &[FileEntry] {
        &self.current_files
    }

    pub fn list_directory(&mut self, path: &str, now: Instant) -> Result<ReplyReceiver> {
        let path = ops::normalize_requested_path(path);
        if let Some((loading, reqid)) = &self.loading {
            if *loading == path && self.correlator.is_pending(reqid) {
                tracing::debug!(path = %path, "Listing already in flight");
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Ok(Reply::Listing(self.current_files.clone())));
                return Ok(rx);
            }
        }
        let request = ops::list_directory(&path)?;
        let rx = self.send_operation(&request, now)?;
        let reqid = request.reqid().to_string();
        self.listing_paths.insert(reqid.clone(), path.clone());
        self.loading = Some((path, reqid));
        Ok(rx)
    }

    pub fn refresh(&mut self, now: Instant) -> Result<ReplyReceiver> {
        let path = self.current_path.clone();
        self.list_directory(&path, now)
    }

    pub fn navigate_to(&mut self, path: &str, now: Instant) -> Result<ReplyReceiver> {
        self.list_directory(path, now)
    }

    pub fn navigate_up(&mut self, now: Instant) -> Result<ReplyReceiver> {
        let parent = ops::parent_path(self.current_path());
        self.list_directory(&parent, now)
    }

    pub fn navigate_into(&mut self, name: &str, now: Instant) -> Result<ReplyReceiver> {
        ops::validate_path(name)?;
        let target = ops::join_path(&self.current_path, name);
        self.list_directory(&target, now)
    }

    // ---- mutations (observed through the re-list that follows) ----

    fn mutate(&mut self, request: Request, now: Instant) -> Result<ReplyReceiver> {
        self.send_uncorrelated(&request)?;
        tracing::debug!(reqid = %request.reqid(), "Mutation sent, refreshing");
        self.refresh(now)
    }

    pub fn make_dir(&mut self, name: &str, now: Instant) -> Result<ReplyReceiver> {
        let request = ops::make_dir(&self.current_path, name)?;
        self.mutate(request, now)
    }

    pub fn rename(&mut self, old_name: &str, new_name: &str, now: Instant) -> Result<ReplyReceiver> {
        let request = ops::rename(&self.current_path, old_name, new_name)?;
        self.mutate(request, now)
    }

    pub fn delete(&mut self, items: &[String], recursive: bool, now: Instant) -> Result<ReplyReceiver> {
        let request = ops::delete(&self.current_path, items, recursive)?;
        self.mutate(request, now)
    }

    /// Copy `items` from the current directory into `destination`
    pub fn copy_files(&mut self, items: &[String], destination: &str, now: Instant) -> Result<ReplyReceiver> {
        let request = ops::copy(&self.current_path, destination, items)?;
        self.mutate(request, now)
    }

    /// Copy `items` from `source` into the current directory
    pub fn copy_from(&mut self, source: &str, items: &[String], now: Instant) -> Result<ReplyReceiver> {
        let request = ops::copy(source, &self.current_path, items)?;
        self.mutate(request, now)
    }

    pub fn move_files(&mut self, items: &[String], destination: &str, now: Instant) -> Result<ReplyReceiver> {
        let request = ops::move_items(&self.current_path, destination, items)?;
        self.mutate(request, now)
    }

    pub fn move_from(&mut self, source: &str, items: &[String], now: Instant) -> Result<ReplyReceiver> {
        let request = ops::move_items(source, &self.current_path, items)?;
        self.mutate(request, now)
    }

    pub fn zip(&mut self, files: &[String], zip_name: &str, now: Instant) -> Result<ReplyReceiver> {
        let request = ops::zip(&self.current_path, files, zip_name)?;
        self.mutate(request, now)
    }

    pub fn unzip(&mut self, zip_file: &str, now: Instant) -> Result<ReplyReceiver> {
        let request = ops::unzip(&self.current_path, zip_file)?;
        self.mutate(request, now)
    }

    // ---- content and search ----

    /// Reply decodes with [`file_content`]
    pub fn get_file(&mut self, name: &str, now: Instant) -> Result<ReplyReceiver> {
        let request = ops::get_file(&self.current_path, name)?;
        self.send_operation(&request, now)
    }

    pub fn set_file(&mut self, name: &str, content: &[u8], now: Instant) -> Result<ReplyReceiver> {
        let request = ops::set_file(&self.current_path, name, content)?;
        self.send_operation(&request, now)
    }

    /// Reply decodes with [`search_results`]
    pub fn search(&mut self, filter: &str, now: Instant) -> Result<ReplyReceiver> {
        let request = ops::search(&self.current_path, filter)?;
        self.send_operation(&request, now)
    }

    // ---- uploads ----

    /// Upload into the current directory
    pub fn upload(
        &mut self,
        source: Box<dyn UploadSource>,
        check_hash: bool,
        now: Instant,
    ) -> Result<(String, UploadReceiver)> {
        let path = self.current_path.clone();
        self.upload_to(source, &path, check_hash, now)
    }

    /// Hashes inline when a precheck is requested; async owners use
    /// [`FileManager::start_upload`] and run the [`HashJob`] off-thread.
    pub fn upload_to(
        &mut self,
        source: Box<dyn UploadSource>,
        remote_path: &str,
        check_hash: bool,
        now: Instant,
    ) -> Result<(String, UploadReceiver)> {
        let (id, rx, job) = self.start_upload(source, remote_path, check_hash)?;
        if let Some(job) = job {
            self.finish_hash(job.run(), now);
        }
        Ok((id, rx))
    }

    /// Register an upload. A returned [`HashJob`] blocks on reads; its result
    /// goes back through [`FileManager::finish_hash`].
    pub fn start_upload(
        &mut self,
        source: Box<dyn UploadSource>,
        remote_path: &str,
        check_hash: bool,
    ) -> Result<(String, UploadReceiver, Option<HashJob>)> {
        self.uploader.clear_completed();
        let mut link = Link::new(Some(&mut *self.transport));
        self.uploader.start(source, remote_path, check_hash, &mut link)
    }

    pub fn finish_hash(&mut self, hashed: HashedSource, now: Instant) {
        let failed = {
            let mut link = Link::new(Some(&mut *self.transport));
            self.uploader.hash_ready(hashed, &mut link)
        };
        if let Some(task) = failed {
            self.upload_settled(task, now);
        }
    }

    pub fn cancel_upload(&mut self, id: &str) -> bool {
        match self.uploader.cancel(id) {
            Some(task) => {
                self.journal_upload(&task, TransferStatus::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn retry_upload(&mut self, id: &str) -> Result<UploadReceiver> {
        let mut link = Link::new(Some(&mut *self.transport));
        self.uploader.retry(id, &mut link)
    }

    pub fn clear_completed_uploads(&mut self) {
        self.uploader.clear_completed();
    }

    pub fn has_active_upload(&self) -> bool {
        self.uploader.has_active()
    }

    pub fn active_upload_id(&self) -> Option<String> {
        self.uploader.active_id()
    }

    pub fn upload_task(&self, id: &str) -> Option<UploadTask> {
        self.uploader.get(id)
    }

    pub fn uploads(&self) -> Vec<UploadTask> {
        self.uploader.all()
    }

    // ---- downloads ----

    pub fn download(
        &mut self,
        remote_path: &str,
        name: Option<&str>,
        size: Option<u64>,
    ) -> Result<(String, DownloadReceiver)> {
        let (id, rx, evicted) = {
            let mut link = Link::new(Some(&mut *self.transport));
            self.downloader.start(remote_path, name, size, &mut link)?
        };
        if let Some(task) = evicted {
            self.journal_download(&task, TransferStatus::Failed);
        }
        Ok((id, rx))
    }

    /// Download a file from the current listing, using its listed size
    pub fn download_entry(&mut self, name: &str) -> Result<(String, DownloadReceiver)> {
        let entry = self
            .current_files
            .iter()
            .find(|e| e.name == name && !e.is_container())
            .cloned()
            .ok_or_else(|| OperationError::InvalidName(name.to_string()))?;
        let path = entry
            .path
            .clone()
            .unwrap_or_else(|| ops::join_path(&self.current_path, &entry.name));
        self.download(&path, Some(&entry.name), Some(entry.size))
    }

    pub fn cancel_download(&mut self, id: &str) -> bool {
        let cancelled = {
            let mut link = Link::new(Some(&mut *self.transport));
            self.downloader.cancel(id, &mut link)
        };
        match cancelled {
            Some(task) => {
                self.journal_download(&task, TransferStatus::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn has_active_download(&self) -> bool {
        self.downloader.has_active()
    }

    pub fn active_download_id(&self) -> Option<&str> {
        self.downloader.active_id()
    }

    pub fn download_task(&self, id: &str) -> Option<&DownloadTask> {
        self.downloader.get(id)
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEvents;
    use crate::transport::memory::MemoryTransport;
    use crate::upload::MemorySource;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct States(Mutex<Vec<ConnectionState>>);

    impl FileManagerEvents for States {
        fn state_changed(&self, state: ConnectionState) {
            self.0.lock().push(state);
        }
    }

    fn manager(state: TunnelState) -> (FileManager, MemoryTransport) {
        let t = MemoryTransport::new(state);
        let m = FileManager::new(
            Box::new(t.clone()),
            ManagerConfig::default(),
            Arc::new(NoopEvents),
        );
        (m, t)
    }

    fn actions(t: &MemoryTransport) -> Vec<String> {
        t.json_sent()
            .iter()
            .filter_map(|v| v["action"].as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_options_once_and_initial_listing_once() {
        let (mut m, t) = manager(TunnelState::Connecting);
        let now = Instant::now();
        m.connect().unwrap();
        m.handle_event(TransportEvent::State(TunnelState::ConnectedToServer), now);
        m.handle_event(TransportEvent::State(TunnelState::ConnectedToServer), now);
        assert_eq!(t.ctrl_sent().len(), 1);
        assert_eq!(t.ctrl_sent()[0]["type"], "options");

        t.set_state(TunnelState::EndToEnd);
        m.handle_event(TransportEvent::State(TunnelState::EndToEnd), now);
        m.handle_event(TransportEvent::State(TunnelState::ConnectedToServer), now);
        m.handle_event(TransportEvent::State(TunnelState::EndToEnd), now);
        assert_eq!(actions(&t), vec!["ls"]);
        assert_eq!(t.json_sent()[0]["path"], "");
    }

    #[test]
    fn test_disconnect_fails_pending_and_resets_flags() {
        let (mut m, t) = manager(TunnelState::EndToEnd);
        let now = Instant::now();
        let mut rx = m.list_directory("/tmp", now).unwrap();
        m.handle_event(TransportEvent::State(TunnelState::Disconnected), now);
        assert_eq!(rx.try_recv().unwrap(), Err(OperationError::Disconnected));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.pending_requests(), 0);

        m.handle_event(TransportEvent::State(TunnelState::ConnectedToServer), now);
        m.handle_event(TransportEvent::State(TunnelState::EndToEnd), now);
        assert_eq!(t.ctrl_sent().len(), 1);
        assert_eq!(actions(&t), vec!["ls", "ls"]);
    }

    #[test]
    fn test_listing_resolves_and_updates_view() {
        let (mut m, t) = manager(TunnelState::EndToEnd);
        let now = Instant::now();
        let mut rx = m.list_directory("/home", now).unwrap();
        let reqid = t.json_sent()[0]["reqid"].as_str().unwrap().to_string();
        m.handle_event(
            TransportEvent::Text(format!(
                r#"{{"action":"ls","reqid":"{}","dir":[{{"n":"a.txt","t":3,"s":5}}]}}"#,
                reqid
            )),
            now,
        );
        match rx.try_recv().unwrap().unwrap() {
            Reply::Listing(entries) => assert_eq!(entries[0].name, "a.txt"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(m.current_path(), "/home");
        assert_eq!(m.current_files().len(), 1);
    }

    #[test]
    fn test_listing_without_reqid_uses_oldest_pending() {
        let (mut m, _t) = manager(TunnelState::EndToEnd);
        let now = Instant::now();
        let mut rx = m.list_directory("C:", now).unwrap();
        m.handle_event(TransportEvent::Text(r#"{"dir":[]}"#.into()), now);
        assert!(matches!(rx.try_recv().unwrap(), Ok(Reply::Listing(_))));
        assert_eq!(m.current_path(), "C:\\");
    }

    #[test]
    fn test_duplicate_listing_is_served_from_view() {
        let (mut m, t) = manager(TunnelState::EndToEnd);
        let now = Instant::now();
        let _first = m.list_directory("/a", now).unwrap();
        let mut second = m.list_directory("/a", now).unwrap();
        assert_eq!(actions(&t), vec!["ls"]);
        assert!(matches!(second.try_recv().unwrap(), Ok(Reply::Listing(_))));
    }

    #[test]
    fn test_mutation_relists() {
        let (mut m, t) = manager(TunnelState::EndToEnd);
        let now = Instant::now();
        let _rx = m.make_dir("new", now).unwrap();
        assert_eq!(actions(&t), vec!["mkdir", "ls"]);
        assert!(m.delete(&["../x".to_string()], false, now).is_err());
    }

    #[test]
    fn test_send_failure_rejects_immediately() {
        let (mut m, _t) = manager(TunnelState::ConnectedToServer);
        let now = Instant::now();
        assert_eq!(m.search("*.log", now).unwrap_err(), OperationError::SendFailed);
        assert_eq!(m.pending_requests(), 0);
        assert_eq!(m.next_deadline(), None);
    }

    #[test]
    fn test_timeout_is_reported_and_late_reply_absorbed() {
        let (mut m, t) = manager(TunnelState::EndToEnd);
        let now = Instant::now();
        let mut rx = m.get_file("a.txt", now).unwrap();
        let reqid = t.json_sent()[0]["reqid"].as_str().unwrap().to_string();
        let later = now + m.config.operation_timeout();
        assert_eq!(m.next_deadline(), Some(later));
        m.on_deadline(later);
        assert_eq!(rx.try_recv().unwrap(), Err(OperationError::TimedOut));

        m.handle_event(
            TransportEvent::Text(format!(r#"{{"action":"get","reqid":"{}","data":"aGk="}}"#, reqid)),
            later,
        );
        assert_eq!(m.pending_requests(), 0);
    }

    #[test]
    fn test_get_and_search_replies() {
        let (mut m, t) = manager(TunnelState::EndToEnd);
        let now = Instant::now();
        let mut get = m.get_file("a.txt", now).unwrap();
        let mut find = m.search("*.txt", now).unwrap();
        let sent = t.json_sent();
        let (get_id, find_id) = (sent[0]["reqid"].as_str().unwrap(), sent[1]["reqid"].as_str().unwrap());
        m.handle_event(
            TransportEvent::Text(format!(r#"{{"action":"get","reqid":"{}","data":"aGk="}}"#, get_id)),
            now,
        );
        m.handle_event(
            TransportEvent::Text(format!(
                r#"{{"action":"findfile","reqid":"{}","files":[{{"n":"b.txt","t":3,"s":1}}]}}"#,
                find_id
            )),
            now,
        );
        assert_eq!(file_content(get.try_recv().unwrap().unwrap()).unwrap(), b"hi");
        assert_eq!(search_results(find.try_recv().unwrap().unwrap())[0].name, "b.txt");
    }

    #[test]
    fn test_error_response_rejects_and_records() {
        let (mut m, t) = manager(TunnelState::EndToEnd);
        let now = Instant::now();
        let mut rx = m.set_file("a.txt", b"x", now).unwrap();
        let reqid = t.json_sent()[0]["reqid"].as_str().unwrap().to_string();
        m.handle_event(
            TransportEvent::Text(format!(
                r#"{{"action":"error","reqid":"{}","error":"Access denied"}}"#,
                reqid
            )),
            now,
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(OperationError::Server("Access denied".into()))
        );
        assert_eq!(m.last_error().unwrap().kind, FileErrorKind::PermissionDenied);
        m.clear_errors();
        assert!(m.error_history().is_empty());
    }

    #[test]
    fn test_action_echo_resolves_despite_error_field() {
        let (mut m, t) = manager(TunnelState::EndToEnd);
        let now = Instant::now();
        let mut renamed = m.rename("a.txt", "b.txt", now).unwrap();
        let mut removed = m.delete(&["c.txt".to_string()], false, now).unwrap();
        let ids: Vec<String> = t
            .json_sent()
            .iter()
            .filter(|v| v["action"] != "ls")
            .map(|v| v["reqid"].as_str().unwrap().to_string())
            .collect();
        m.handle_event(
            TransportEvent::Text(format!(
                r#"{{"action":"rename","reqid":"{}","error":"partially applied"}}"#,
                ids[0]
            )),
            now,
        );
        m.handle_event(
            TransportEvent::Text(format!(r#"{{"reqid":"{}","result":"ok","error":"stale"}}"#, ids[1])),
            now,
        );
        assert!(matches!(renamed.try_recv().unwrap(), Ok(Reply::Response(_))));
        assert!(matches!(removed.try_recv().unwrap(), Ok(Reply::Response(_))));
        assert!(m.error_history().is_empty());
    }

    #[test]
    fn test_ping_is_answered() {
        let (mut m, t) = manager(TunnelState::EndToEnd);
        m.handle_event(
            TransportEvent::Ctrl(json!({"ctrlChannel": 102938, "type": "ping"})),
            Instant::now(),
        );
        assert_eq!(t.ctrl_sent()[0]["type"], "pong");
    }

    #[test]
    fn test_failed_event_sets_failed_state() {
        let t = MemoryTransport::new(TunnelState::Disconnected);
        let states = Arc::new(States::default());
        let mut m = FileManager::new(Box::new(t), ManagerConfig::default(), states.clone());
        let now = Instant::now();
        m.connect().unwrap();
        m.handle_event(TransportEvent::Failed("Connection lost: refused".into()), now);
        m.handle_event(TransportEvent::State(TunnelState::Disconnected), now);
        assert_eq!(m.state(), ConnectionState::Failed);
        assert_eq!(
            *states.0.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Failed]
        );
        assert_eq!(m.last_error().unwrap().kind, FileErrorKind::ConnectionError);
    }

    #[test]
    fn test_upload_from_current_directory_and_disconnect_interrupts() {
        let (mut m, t) = manager(TunnelState::EndToEnd);
        let now = Instant::now();
        let (id, mut rx) = m
            .upload(Box::new(MemorySource::new("a.bin", vec![1u8; 10])), false, now)
            .unwrap();
        assert_eq!(actions(&t), vec!["upload"]);
        assert!(m.has_active_upload());
        assert_eq!(m.active_upload_id().as_deref(), Some(id.as_str()));
        m.disconnect();
        assert_eq!(rx.try_recv().unwrap().unwrap_err(), OperationError::Disconnected);
        assert!(m.uploads().is_empty());
        assert_eq!(t.stops(), 1);
    }

    #[test]
    fn test_download_entry_uses_listing() {
        let (mut m, t) = manager(TunnelState::EndToEnd);
        let now = Instant::now();
        let _rx = m.list_directory("/srv", now).unwrap();
        m.handle_event(
            TransportEvent::Text(r#"{"action":"ls","path":"/srv","dir":[{"n":"d","t":2},{"n":"f.bin","t":3,"s":42}]}"#.into()),
            now,
        );
        assert!(m.download_entry("d").is_err());
        let (id, _rx) = m.download_entry("f.bin").unwrap();
        let last = t.json_sent().pop().unwrap();
        assert_eq!(last["path"], "/srv/f.bin");
        assert_eq!(m.download_task(&id).unwrap().total_size, 42);
        assert!(m.cancel_download(&id));
        assert!(!m.has_active_download());
    }

    #[test]
    fn test_navigation() {
        let (mut m, t) = manager(TunnelState::EndToEnd);
        let now = Instant::now();
        m.handle_event(
            TransportEvent::Text(r#"{"action":"ls","path":"/usr/local","dir":[]}"#.into()),
            now,
        );
        assert_eq!(m.current_path(), "/usr/local");
        let _ = m.navigate_up(now).unwrap();
        let _ = m.navigate_into("bin", now).unwrap();
        let paths: Vec<Value> = t.json_sent().iter().map(|v| v["path"].clone()).collect();
        assert_eq!(paths, vec![json!("/usr"), json!("/usr/local/bin")]);
        assert!(m.navigate_into("..", now).is_err());
    }
}
