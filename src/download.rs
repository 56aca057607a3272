//! Download pipeline: one active task, receiver-paced chunks
//!
//! The agent sends one chunk per `ack`. A chunk flagged final completes the
//! task regardless of the byte count, and the assembled content is handed to
//! the observer and, when a download directory is configured, written there.

use serde::Serialize;
use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;

use crate::error::{OperationError, Result};
use crate::events::{CompletedDownload, Direction, FileManagerEvents, TransferProgress};
use crate::message::{DownloadControl, DownloadSub};
use crate::ops;
use crate::transport::Link;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Requested,
    Negotiating,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DownloadStatus::Requested | DownloadStatus::Negotiating | DownloadStatus::Downloading
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadTask {
    pub id: String,
    pub remote_path: String,
    pub file_name: String,
    #[serde(skip)]
    pub chunks: Vec<Vec<u8>>,
    pub total_size: u64,
    pub received_size: u64,
    pub status: DownloadStatus,
    pub error: Option<String>,
}

/// Terminal transitions surfaced to the owner
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Completed(CompletedDownload),
    CancelledByServer(DownloadTask),
    Failed(DownloadTask),
}

pub type DownloadReceiver = oneshot::Receiver<Result<CompletedDownload>>;

const EVICTED: &str = "Download timeout or stuck";

pub struct Downloader {
    tasks: HashMap<String, DownloadTask>,
    waiters: HashMap<String, oneshot::Sender<Result<CompletedDownload>>>,
    active: Option<String>,
    download_dir: Option<PathBuf>,
}

fn file_name_from_path(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string()
}

/// Atomically write `data` under `dir` with a sanitized name
pub fn save_download(dir: &Path, name: &str, data: &[u8]) -> std::io::Result<PathBuf> {
    let mut clean = ops::sanitize_name(name);
    if clean.is_empty() || clean == "." || clean == ".." {
        clean = "download".to_string();
    }
    std::fs::create_dir_all(dir)?;
    let target = dir.join(clean);
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(&target).map_err(|e| e.error)?;
    Ok(target)
}

impl Downloader {
    pub fn new(download_dir: Option<PathBuf>) -> Self {
        Self {
            tasks: HashMap::new(),
            waiters: HashMap::new(),
            active: None,
            download_dir,
        }
    }

    fn settle(&mut self, id: &str, outcome: Result<CompletedDownload>) {
        if let Some(tx) = self.waiters.remove(id) {
            let _ = tx.send(outcome);
        }
    }

    fn send(link: &mut Link<'_>, sub: DownloadSub, id: &str, path: &str) -> Result<()> {
        let req = ops::download(sub, id, path)?;
        link.send_request(&req).map_err(|e| {
            tracing::debug!(id = %id, sub = ?sub, "download send failed: {}", e);
            OperationError::SendFailed
        })
    }

    /// Request `remote_path`. Any task still in flight is evicted first so at
    /// most one download is active.
    pub fn start(
        &mut self,
        remote_path: &str,
        name: Option<&str>,
        size: Option<u64>,
        link: &mut Link<'_>,
    ) -> Result<(String, DownloadReceiver, Option<DownloadTask>)> {
        ops::validate_path(remote_path)?;
        let evicted = self.reset_active();

        let id = ops::generate_prefixed_id("download");
        let file_name = name
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| file_name_from_path(remote_path));
        let mut task = DownloadTask {
            id: id.clone(),
            remote_path: remote_path.to_string(),
            file_name,
            chunks: Vec::new(),
            total_size: size.unwrap_or(0),
            received_size: 0,
            status: DownloadStatus::Requested,
            error: None,
        };

        Self::send(link, DownloadSub::Start, &id, remote_path)?;
        task.status = DownloadStatus::Negotiating;
        tracing::debug!(id = %id, path = %remote_path, "Download requested");

        let (tx, rx) = oneshot::channel();
        self.tasks.insert(id.clone(), task);
        self.waiters.insert(id.clone(), tx);
        self.active = Some(id.clone());
        Ok((id, rx, evicted))
    }

    pub fn handle_control(
        &mut self,
        control: DownloadControl,
        link: &mut Link<'_>,
        events: &dyn FileManagerEvents,
    ) -> Option<DownloadOutcome> {
        match control {
            DownloadControl::Start { id, size, name } => {
                let Some(task) = self.tasks.get_mut(&id) else {
                    tracing::debug!(id = %id, "Start for unknown download, cancelling");
                    let _ = Self::send(link, DownloadSub::Cancel, &id, "");
                    return None;
                };
                if !task.status.is_active() {
                    return None;
                }
                task.status = DownloadStatus::Downloading;
                if let Some(size) = size {
                    task.total_size = size;
                }
                if let Some(name) = name {
                    task.file_name = name;
                }
                let path = task.remote_path.clone();
                if let Err(e) = Self::send(link, DownloadSub::StartAck, &id, &path) {
                    tracing::warn!(id = %id, "Failed to acknowledge download start: {}", e);
                }
                None
            }
            DownloadControl::Cancel { id, reason } => {
                let mut task = self.tasks.remove(&id)?;
                let reason = reason.unwrap_or_default();
                task.status = DownloadStatus::Cancelled;
                task.error = (!reason.is_empty()).then(|| reason.clone());
                if self.active.as_deref() == Some(id.as_str()) {
                    self.active = None;
                }
                events.download_cancelled_by_server(&task.file_name, &reason);
                let msg = if reason.is_empty() {
                    "Download cancelled by agent".to_string()
                } else {
                    reason
                };
                self.settle(&id, Err(OperationError::Server(msg)));
                Some(DownloadOutcome::CancelledByServer(task))
            }
            DownloadControl::Error { id, error } => {
                let task = self.tasks.get_mut(&id)?;
                task.status = DownloadStatus::Failed;
                task.error = Some(error.clone());
                let snapshot = task.clone();
                if self.active.as_deref() == Some(id.as_str()) {
                    self.active = None;
                }
                tracing::warn!(id = %id, "Download failed: {}", error);
                self.settle(&id, Err(OperationError::Server(error)));
                Some(DownloadOutcome::Failed(snapshot))
            }
            DownloadControl::Other { id, sub } => {
                tracing::debug!(id = %id, sub = %sub, "Ignoring download message");
                None
            }
        }
    }

    /// One data chunk for the active download
    pub fn handle_chunk(
        &mut self,
        payload: &[u8],
        is_final: bool,
        link: &mut Link<'_>,
        events: &dyn FileManagerEvents,
    ) -> Option<DownloadOutcome> {
        let id = self.active.clone()?;
        let task = self.tasks.get_mut(&id)?;
        if task.status != DownloadStatus::Downloading {
            return None;
        }
        task.chunks.push(payload.to_vec());
        task.received_size += payload.len() as u64;

        if !is_final {
            let path = task.remote_path.clone();
            if let Err(e) = Self::send(link, DownloadSub::Ack, &id, &path) {
                tracing::warn!(id = %id, "Failed to ack download chunk: {}", e);
            }
        }

        let progress = if is_final {
            100
        } else {
            TransferProgress::percent(task.received_size, task.total_size)
        };
        events.transfer_progress(&TransferProgress {
            id: id.clone(),
            file: task.file_name.clone(),
            progress,
            bytes_transferred: task.received_size,
            total_bytes: task.total_size,
            direction: Direction::Download,
        });

        if !is_final {
            return None;
        }
        let task = self.tasks.remove(&id)?;
        Some(self.complete(task, events))
    }

    fn complete(&mut self, mut task: DownloadTask, events: &dyn FileManagerEvents) -> DownloadOutcome {
        self.active = None;
        let id = task.id.clone();
        task.status = DownloadStatus::Completed;
        if task.total_size > 0 && task.received_size < task.total_size {
            tracing::debug!(
                id = %id,
                received = task.received_size,
                expected = task.total_size,
                "Final chunk before declared size"
            );
        }

        let data = task.chunks.concat();
        let saved_to = self.download_dir.as_deref().and_then(|dir| {
            save_download(dir, &task.file_name, &data)
                .map_err(|e| {
                    tracing::error!(file = %task.file_name, "Failed to save download: {}", e);
                })
                .ok()
        });
        let done = CompletedDownload {
            id: task.id,
            name: task.file_name,
            remote_path: task.remote_path,
            data,
            saved_to,
        };
        events.download_complete(&done);
        self.settle(&id, Ok(done.clone()));
        DownloadOutcome::Completed(done)
    }

    /// Client-side cancel: tell the agent to stop and forget the task
    pub fn cancel(&mut self, id: &str, link: &mut Link<'_>) -> Option<DownloadTask> {
        let mut task = self.tasks.remove(id)?;
        task.status = DownloadStatus::Cancelled;
        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
        if let Err(e) = Self::send(link, DownloadSub::Cancel, id, &task.remote_path) {
            tracing::debug!(id = %id, "Cancel not delivered: {}", e);
        }
        self.settle(id, Err(OperationError::Cancelled));
        tracing::info!(id = %id, "Download cancelled");
        Some(task)
    }

    /// Evict the active task if it is still in flight
    pub fn reset_active(&mut self) -> Option<DownloadTask> {
        let id = self.active.take()?;
        if !self.tasks.get(&id).is_some_and(|t| t.status.is_active()) {
            return None;
        }
        let mut task = self.tasks.remove(&id)?;
        task.status = DownloadStatus::Failed;
        task.error = Some(EVICTED.to_string());
        tracing::warn!(id = %id, file = %task.file_name, "Evicting stuck download");
        self.settle(&id, Err(OperationError::Server(EVICTED.to_string())));
        Some(task)
    }

    /// Tunnel lost: every waiter sees `Disconnected`; returns tasks that were in flight
    pub fn interrupt_all(&mut self) -> Vec<DownloadTask> {
        self.active = None;
        for (_, tx) in self.waiters.drain() {
            let _ = tx.send(Err(OperationError::Disconnected));
        }
        self.tasks
            .drain()
            .map(|(_, t)| t)
            .filter(|t| t.status.is_active())
            .collect()
    }

    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn get(&self, id: &str) -> Option<&DownloadTask> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> Vec<&DownloadTask> {
        self.tasks.values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEvents;
    use crate::transport::memory::MemoryTransport;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        cancelled: Mutex<Vec<(String, String)>>,
        progress: Mutex<Vec<u8>>,
    }

    impl FileManagerEvents for Recorder {
        fn download_cancelled_by_server(&self, file: &str, reason: &str) {
            self.cancelled.lock().push((file.to_string(), reason.to_string()));
        }
        fn transfer_progress(&self, p: &TransferProgress) {
            self.progress.lock().push(p.progress);
        }
    }

    fn start(d: &mut Downloader, t: &mut MemoryTransport, path: &str) -> (String, DownloadReceiver) {
        let mut link = Link::new(Some(t));
        let (id, rx, _) = d.start(path, None, Some(100), &mut link).unwrap();
        (id, rx)
    }

    fn server_start(d: &mut Downloader, t: &mut MemoryTransport, id: &str) {
        let mut link = Link::new(Some(t));
        d.handle_control(
            DownloadControl::Start {
                id: id.to_string(),
                size: None,
                name: None,
            },
            &mut link,
            &NoopEvents,
        );
    }

    #[test]
    fn test_second_download_evicts_first() {
        let mut t = MemoryTransport::default();
        let mut d = Downloader::new(None);
        let (first, mut rx1) = start(&mut d, &mut t, "/a/one.bin");
        assert_eq!(d.active_id(), Some(first.as_str()));
        let mut link = Link::new(Some(&mut t));
        let (second, _rx2, evicted) = d.start("/a/two.bin", None, None, &mut link).unwrap();
        drop(link);
        assert_eq!(evicted.unwrap().status, DownloadStatus::Failed);
        assert!(rx1.try_recv().unwrap().is_err());
        assert_eq!(d.active_id(), Some(second.as_str()));
        let active: Vec<_> = d.tasks().into_iter().filter(|t| t.status.is_active()).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(d.get(&second).unwrap().file_name, "two.bin");
    }

    #[test]
    fn test_final_flag_completes_short_and_saves() {
        let dir = tempdir().unwrap();
        let mut t = MemoryTransport::default();
        let mut d = Downloader::new(Some(dir.path().to_path_buf()));
        let rec = Recorder::default();
        let (id, mut rx) = start(&mut d, &mut t, "C:\\logs\\app.log");
        server_start(&mut d, &mut t, &id);

        let mut link = Link::new(Some(&mut t));
        assert!(d.handle_chunk(b"hello ", false, &mut link, &rec).is_none());
        let out = d.handle_chunk(b"world", true, &mut link, &rec).unwrap();
        drop(link);

        let DownloadOutcome::Completed(done) = out else {
            panic!("expected completion");
        };
        assert_eq!(done.data, b"hello world");
        assert_eq!(done.name, "app.log");
        assert_eq!(*rec.progress.lock(), vec![6, 100]);
        assert!(!d.has_active());
        assert!(d.get(&id).is_none());
        let saved = done.saved_to.unwrap();
        assert_eq!(std::fs::read(saved).unwrap(), b"hello world");
        assert!(rx.try_recv().unwrap().is_ok());

        let subs: Vec<String> = t
            .json_sent()
            .iter()
            .map(|v| v["sub"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(subs, vec!["start", "startack", "ack"]);
    }

    #[test]
    fn test_server_cancel_and_error() {
        let mut t = MemoryTransport::default();
        let mut d = Downloader::new(None);
        let rec = Recorder::default();
        let (id, _rx) = start(&mut d, &mut t, "/x/secret");
        server_start(&mut d, &mut t, &id);
        let mut link = Link::new(Some(&mut t));
        let out = d.handle_control(
            DownloadControl::Cancel {
                id: id.clone(),
                reason: Some("access revoked".into()),
            },
            &mut link,
            &rec,
        );
        drop(link);
        assert!(matches!(out, Some(DownloadOutcome::CancelledByServer(_))));
        assert_eq!(
            *rec.cancelled.lock(),
            vec![("secret".to_string(), "access revoked".to_string())]
        );
        assert!(d.get(&id).is_none());

        let (id, _rx) = start(&mut d, &mut t, "/x/other");
        let mut link = Link::new(Some(&mut t));
        d.handle_control(
            DownloadControl::Error {
                id: id.clone(),
                error: "not found".into(),
            },
            &mut link,
            &NoopEvents,
        );
        drop(link);
        // kept for inspection
        assert_eq!(d.get(&id).unwrap().status, DownloadStatus::Failed);
        assert!(!d.has_active());
    }

    #[test]
    fn test_client_cancel_sends_cancel() {
        let mut t = MemoryTransport::default();
        let mut d = Downloader::new(None);
        let (id, mut rx) = start(&mut d, &mut t, "/x/f");
        let mut link = Link::new(Some(&mut t));
        assert_eq!(d.cancel(&id, &mut link).unwrap().status, DownloadStatus::Cancelled);
        drop(link);
        assert_eq!(rx.try_recv().unwrap(), Err(OperationError::Cancelled));
        assert_eq!(t.json_sent().last().unwrap()["sub"], "cancel");
        assert!(!d.has_active());
    }

    #[test]
    fn test_unknown_start_is_cancelled_and_chunks_ignored_without_active() {
        let mut t = MemoryTransport::default();
        let mut d = Downloader::new(None);
        server_start(&mut d, &mut t, "download-0-0");
        let sent = t.json_sent();
        assert_eq!(sent[0]["sub"], "cancel");
        assert_eq!(sent[0]["id"], "download-0-0");
        let mut link = Link::new(Some(&mut t));
        assert!(d.handle_chunk(b"x", true, &mut link, &NoopEvents).is_none());
    }

    #[test]
    fn test_save_download_sanitizes_name() {
        let dir = tempdir().unwrap();
        let p = save_download(dir.path(), "../evil:name", b"x").unwrap();
        assert_eq!(p.parent().unwrap(), dir.path());
        assert_eq!(p.file_name().unwrap(), "..evilname");
        let p = save_download(dir.path(), "..", b"y").unwrap();
        assert_eq!(p.file_name().unwrap(), "download");
    }
}
