//! Callbacks the manager raises toward its embedder, and the progress and
//! download payloads they carry

use std::path::PathBuf;

use serde::Serialize;

use crate::classify::FileError;
use crate::manager::ConnectionState;
use crate::message::FileEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferProgress {
    pub id: String,
    pub file: String,
    /// Whole percent, 0..=100
    pub progress: u8,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub direction: Direction,
}

impl TransferProgress {
    pub fn percent(done: u64, total: u64) -> u8 {
        if total == 0 {
            return 0;
        }
        ((done.min(total) as u128 * 100) / total as u128) as u8
    }
}

/// A finished download, assembled from its chunks
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedDownload {
    pub id: String,
    pub name: String,
    pub remote_path: String,
    pub data: Vec<u8>,
    /// Where the content was written, when a download directory is configured
    pub saved_to: Option<PathBuf>,
}

/// Observer for everything the embedding layer reacts to. All methods default
/// to no-ops so implementors only pick what they need.
pub trait FileManagerEvents: Send + Sync {
    fn state_changed(&self, _state: ConnectionState) {}
    fn directory_changed(&self, _path: &str, _entries: &[FileEntry]) {}
    fn transfer_progress(&self, _progress: &TransferProgress) {}
    fn download_complete(&self, _download: &CompletedDownload) {}
    fn download_cancelled_by_server(&self, _file: &str, _reason: &str) {}
    fn pairing_requested(&self, _relay_id: &str) {}
    fn error(&self, _error: &FileError) {}
}

pub struct NoopEvents;
impl FileManagerEvents for NoopEvents {}

/// Turns callbacks into log lines
pub struct TracingEvents;

impl FileManagerEvents for TracingEvents {
    fn state_changed(&self, state: ConnectionState) {
        tracing::info!(state = ?state, "Tunnel state changed");
    }
    fn directory_changed(&self, path: &str, entries: &[FileEntry]) {
        tracing::debug!(path = %path, entries = entries.len(), "Directory listed");
    }
    fn transfer_progress(&self, p: &TransferProgress) {
        tracing::trace!(
            id = %p.id,
            file = %p.file,
            direction = %p.direction,
            progress = p.progress,
            bytes = p.bytes_transferred,
            total = p.total_bytes,
            "Transfer progress"
        );
    }
    fn download_complete(&self, d: &CompletedDownload) {
        tracing::info!(id = %d.id, file = %d.name, bytes = d.data.len(), "Download complete");
    }
    fn download_cancelled_by_server(&self, file: &str, reason: &str) {
        tracing::warn!(file = %file, reason = %reason, "Download cancelled by agent");
    }
    fn pairing_requested(&self, relay_id: &str) {
        tracing::info!(relay_id = %relay_id, "Relay requested pairing");
    }
    fn error(&self, e: &FileError) {
        tracing::error!(kind = %e.kind, retryable = e.retryable, details = ?e.details, "{}", e.message);
    }
}
