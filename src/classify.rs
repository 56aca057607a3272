//! Classification of free-text agent errors into a closed taxonomy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

use crate::protocol::ERROR_HISTORY_LIMIT;

/// Stable error kinds shown to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileErrorKind {
    AuthError,
    SessionError,
    SessionTimeout,
    ConnectionError,
    PermissionDenied,
    FileNotFound,
    DiskFull,
    QuotaExceeded,
    UnzipError,
    UploadFailed,
    DownloadFailed,
    InvalidPath,
    InvalidName,
    OperationFailed,
    Unknown,
}

// Checked in order; earlier, more specific keys win ("file not found" before "not found")
const ERROR_TABLE: &[(&str, FileErrorKind)] = &[
    ("autherror", FileErrorKind::AuthError),
    ("authentication failed", FileErrorKind::AuthError),
    ("unauthorized", FileErrorKind::AuthError),
    ("sessionerror", FileErrorKind::SessionError),
    ("session expired", FileErrorKind::SessionError),
    ("sessiontimeout", FileErrorKind::SessionTimeout),
    ("timeout", FileErrorKind::SessionTimeout),
    ("connectionerror", FileErrorKind::ConnectionError),
    ("connection lost", FileErrorKind::ConnectionError),
    ("disconnected", FileErrorKind::ConnectionError),
    ("permission denied", FileErrorKind::PermissionDenied),
    ("access denied", FileErrorKind::PermissionDenied),
    ("file not found", FileErrorKind::FileNotFound),
    ("not found", FileErrorKind::FileNotFound),
    ("disk full", FileErrorKind::DiskFull),
    ("no space", FileErrorKind::DiskFull),
    ("quota exceeded", FileErrorKind::QuotaExceeded),
    ("over quota", FileErrorKind::QuotaExceeded),
    ("unzip error", FileErrorKind::UnzipError),
    ("extract failed", FileErrorKind::UnzipError),
    ("upload failed", FileErrorKind::UploadFailed),
    ("download failed", FileErrorKind::DownloadFailed),
    ("invalid path", FileErrorKind::InvalidPath),
    ("invalid name", FileErrorKind::InvalidName),
    ("operation failed", FileErrorKind::OperationFailed),
];

impl FileErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileErrorKind::AuthError => "autherror",
            FileErrorKind::SessionError => "sessionerror",
            FileErrorKind::SessionTimeout => "sessiontimeout",
            FileErrorKind::ConnectionError => "connectionerror",
            FileErrorKind::PermissionDenied => "permissiondenied",
            FileErrorKind::FileNotFound => "filenotfound",
            FileErrorKind::DiskFull => "diskfull",
            FileErrorKind::QuotaExceeded => "quotaexceeded",
            FileErrorKind::UnzipError => "unziperror",
            FileErrorKind::UploadFailed => "uploadfailed",
            FileErrorKind::DownloadFailed => "downloadfailed",
            FileErrorKind::InvalidPath => "invalidpath",
            FileErrorKind::InvalidName => "invalidname",
            FileErrorKind::OperationFailed => "operationfailed",
            FileErrorKind::Unknown => "unknown",
        }
    }

    /// Canonical user-facing text; `Unknown` has none and falls back to the raw error
    pub fn canonical_message(self) -> Option<&'static str> {
        Some(match self {
            FileErrorKind::AuthError => "Authentication failed. Please reconnect.",
            FileErrorKind::SessionError => "Session expired. Please login again.",
            FileErrorKind::SessionTimeout => "Session timed out.",
            FileErrorKind::ConnectionError => "Connection lost. Attempting to reconnect...",
            FileErrorKind::PermissionDenied => "Permission denied for this operation.",
            FileErrorKind::FileNotFound => "File or folder not found.",
            FileErrorKind::DiskFull => "Insufficient disk space.",
            FileErrorKind::QuotaExceeded => "Storage quota exceeded.",
            FileErrorKind::UnzipError => "Failed to extract archive.",
            FileErrorKind::UploadFailed => "Upload failed. Please try again.",
            FileErrorKind::DownloadFailed => "Download failed. Please try again.",
            FileErrorKind::InvalidPath => "Invalid file path.",
            FileErrorKind::InvalidName => "Invalid file or folder name.",
            FileErrorKind::OperationFailed => "Operation failed. Please try again.",
            FileErrorKind::Unknown => return None,
        })
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FileErrorKind::ConnectionError
                | FileErrorKind::SessionTimeout
                | FileErrorKind::UploadFailed
                | FileErrorKind::DownloadFailed
                | FileErrorKind::OperationFailed
        )
    }
}

impl std::fmt::Display for FileErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification output handed to observers; not an exception type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileError {
    pub kind: FileErrorKind,
    pub message: String,
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
}

/// Case-insensitive substring match against the lookup table
pub fn classify(error: &str) -> FileErrorKind {
    let lower = error.to_lowercase();
    ERROR_TABLE
        .iter()
        .find(|(key, _)| lower.contains(key))
        .map(|(_, kind)| *kind)
        .unwrap_or(FileErrorKind::Unknown)
}

pub fn create_error(error: &str, details: Option<&str>) -> FileError {
    let kind = classify(error);
    let message = match kind.canonical_message() {
        Some(m) => m.to_string(),
        None if error.is_empty() => "An unexpected error occurred.".to_string(),
        None => error.to_string(),
    };
    FileError {
        kind,
        message,
        details: Some(details.unwrap_or(error).to_string()),
        timestamp: Utc::now(),
        retryable: kind.is_retryable(),
    }
}

/// Classify an agent message carrying an `error` field (and optional `details`).
pub fn parse_error(message: &Value) -> Option<FileError> {
    let error = message.get("error")?.as_str()?;
    let details = message.get("details").and_then(Value::as_str);
    Some(create_error(error, details))
}

/// Bounded history of classified errors for diagnostics
#[derive(Debug)]
pub struct ErrorLog {
    history: VecDeque<FileError>,
    limit: usize,
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::with_limit(ERROR_HISTORY_LIMIT)
    }
}

impl ErrorLog {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(limit.min(ERROR_HISTORY_LIMIT)),
            limit: limit.max(1),
        }
    }

    pub fn record(&mut self, error: FileError) {
        if self.history.len() >= self.limit {
            self.history.pop_front();
        }
        self.history.push_back(error);
    }

    pub fn history(&self) -> Vec<FileError> {
        self.history.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&FileError> {
        self.history.back()
    }

    pub fn counts(&self) -> HashMap<FileErrorKind, usize> {
        let mut counts = HashMap::new();
        for e in &self.history {
            *counts.entry(e.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}
