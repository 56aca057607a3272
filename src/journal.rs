use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::events::Direction;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Failed,
    Cancelled,
    /// Tunnel dropped mid-transfer; uploads can resume from `bytes_confirmed`
    Interrupted,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub timestamp: String,
    pub transfer_id: String,
    pub direction: String,
    pub remote_path: String,
    pub file_name: String,
    pub status: TransferStatus,
    pub bytes_confirmed: u64,
    pub total_bytes: u64,
    pub hash: Option<String>,
    pub error: Option<String>,
}

impl JournalEntry {
    pub fn new(
        transfer_id: &str,
        direction: Direction,
        remote_path: &str,
        file_name: &str,
        status: TransferStatus,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            transfer_id: transfer_id.to_string(),
            direction: direction.to_string(),
            remote_path: remote_path.to_string(),
            file_name: file_name.to_string(),
            status,
            bytes_confirmed: 0,
            total_bytes: 0,
            hash: None,
            error: None,
        }
    }

    pub fn bytes(mut self, confirmed: u64, total: u64) -> Self {
        self.bytes_confirmed = confirmed;
        self.total_bytes = total;
        self
    }

    pub fn hash(mut self, hash: Option<&str>) -> Self {
        self.hash = hash.map(str::to_string);
        self
    }

    pub fn error(mut self, error: Option<&str>) -> Self {
        self.error = error.map(str::to_string);
        self
    }
}

/// Append-only JSONL record of terminal transfer transitions
#[derive(Debug, Clone)]
pub struct TransferJournal {
    path: PathBuf,
}

impl TransferJournal {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        TransferJournal {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_entry(&self, entry: &JournalEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open transfer journal")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Journal failures never interrupt a transfer; they are logged and dropped
    pub fn record(&self, entry: JournalEntry) {
        if let Err(e) = self.add_entry(&entry) {
            tracing::warn!(path = %self.path.display(), "Failed to write transfer journal: {:#}", e);
        }
    }

    pub fn read_log(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).context("Failed to open transfer journal for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(&line)
                .with_context(|| format!("Malformed journal line: {}", line))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Most recent interrupted upload of `file_name` into `remote_path`
    pub fn last_interrupted_upload(
        &self,
        remote_path: &str,
        file_name: &str,
    ) -> Result<Option<JournalEntry>> {
        Ok(self.read_log()?.into_iter().rev().find(|e| {
            e.status == TransferStatus::Interrupted
                && e.direction == Direction::Upload.to_string()
                && e.remote_path == remote_path
                && e.file_name == file_name
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_journal_appends_and_reads_back() {
        let dir = tempdir().unwrap();
        let journal = TransferJournal::new(dir.path().join("nested").join("transfers.jsonl"));
        assert!(journal.read_log().unwrap().is_empty());

        journal.record(
            JournalEntry::new("upload-1", Direction::Upload, "/docs", "a.bin", TransferStatus::Interrupted)
                .bytes(65536, 200000)
                .hash(Some("abc")),
        );
        journal.record(
            JournalEntry::new("download-2", Direction::Download, "/docs/b", "b", TransferStatus::Failed)
                .error(Some("Download failed")),
        );

        let entries = journal.read_log().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].bytes_confirmed, 65536);
        assert_eq!(entries[1].error.as_deref(), Some("Download failed"));

        let resume = journal.last_interrupted_upload("/docs", "a.bin").unwrap().unwrap();
        assert_eq!(resume.hash.as_deref(), Some("abc"));
        assert!(journal.last_interrupted_upload("/docs", "zzz").unwrap().is_none());
    }
}
