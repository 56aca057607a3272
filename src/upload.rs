//! Upload pipeline: hash precheck, then acknowledged chunked send
//!
//! One chunk is in flight per task. A chunk the transport refuses is retried
//! after a short backoff without advancing; the owner drives the backoff via
//! [`Uploader::next_deadline`] and [`Uploader::poll_retries`].
//!
//! Hashing never runs inside the uploader: [`Uploader::start`] hands back a
//! [`HashJob`] the owner runs wherever blocking reads are acceptable, and the
//! result comes back through [`Uploader::hash_ready`].

use serde::Serialize;
use sha2::{Digest, Sha384};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{OperationError, Result};
use crate::events::{Direction, FileManagerEvents, TransferProgress};
use crate::ops;
use crate::protocol_core::prepare_upload_chunk;
use crate::transport::Link;

const HASH_READ_BUF: usize = 1024 * 1024;

/// Random-access content to upload
pub trait UploadSource: Send {
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    /// Fill `buf` with the bytes starting at `offset`
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

pub struct MemorySource {
    name: String,
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

impl UploadSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of source"))?;
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

pub struct FileSource {
    name: String,
    file: File,
    size: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self { name, file, size })
    }
}

impl UploadSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }
}

/// SHA-384 of the whole source, lowercase hex
pub fn hash_source(source: &mut dyn UploadSource) -> io::Result<String> {
    let size = source.size();
    let mut hasher = Sha384::new();
    let mut buf = vec![0u8; HASH_READ_BUF.min(size as usize).max(1)];
    let mut offset = 0u64;
    while offset < size {
        let n = buf.len().min((size - offset) as usize);
        source.read_at(offset, &mut buf[..n])?;
        hasher.update(&buf[..n]);
        offset += n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Source detached from its task while the precheck hash is computed
pub struct HashJob {
    id: String,
    source: Box<dyn UploadSource>,
}

impl std::fmt::Debug for HashJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashJob").field("id", &self.id).finish_non_exhaustive()
    }
}

impl HashJob {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Blocking: reads the whole source
    pub fn run(mut self) -> HashedSource {
        let hash = hash_source(self.source.as_mut());
        HashedSource {
            id: self.id,
            source: self.source,
            hash,
        }
    }
}

/// Outcome of a [`HashJob`], carrying the source back to its task
pub struct HashedSource {
    id: String,
    source: Box<dyn UploadSource>,
    hash: io::Result<String>,
}

impl HashedSource {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Hashing,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn is_active(self) -> bool {
        matches!(self, UploadStatus::Hashing | UploadStatus::Uploading)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadTask {
    pub id: String,
    pub remote_path: String,
    pub file_name: String,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub next_offset: u64,
    /// Sent but not yet acknowledged; at most one chunk
    pub pending_bytes: u64,
    pub status: UploadStatus,
    pub hash: Option<String>,
    pub append: bool,
    pub error: Option<String>,
}

pub type UploadReceiver = oneshot::Receiver<Result<UploadTask>>;

struct Slot {
    task: UploadTask,
    seq: u64,
    // None while a HashJob holds it
    source: Option<Box<dyn UploadSource>>,
    retry_at: Option<Instant>,
    done_sent: bool,
    waiter: Option<oneshot::Sender<Result<UploadTask>>>,
}

impl Slot {
    fn report(&self, events: &dyn FileManagerEvents) {
        let t = &self.task;
        let progress = if t.status == UploadStatus::Completed {
            100
        } else {
            TransferProgress::percent(t.bytes_uploaded, t.total_bytes)
        };
        events.transfer_progress(&TransferProgress {
            id: t.id.clone(),
            file: t.file_name.clone(),
            progress,
            bytes_transferred: t.bytes_uploaded,
            total_bytes: t.total_bytes,
            direction: Direction::Upload,
        });
    }

    fn settle(&mut self, outcome: Result<UploadTask>) {
        if let Some(tx) = self.waiter.take() {
            let _ = tx.send(outcome);
        }
    }

    fn complete(&mut self, events: &dyn FileManagerEvents) -> UploadTask {
        self.task.status = UploadStatus::Completed;
        self.task.bytes_uploaded = self.task.total_bytes;
        self.task.pending_bytes = 0;
        self.retry_at = None;
        self.report(events);
        tracing::info!(id = %self.task.id, file = %self.task.file_name, "Upload complete");
        let snapshot = self.task.clone();
        self.settle(Ok(snapshot.clone()));
        snapshot
    }

    fn fail(&mut self, error: String) -> UploadTask {
        tracing::warn!(id = %self.task.id, file = %self.task.file_name, "Upload failed: {}", error);
        self.task.status = UploadStatus::Failed;
        self.task.pending_bytes = 0;
        self.task.error = Some(error.clone());
        self.retry_at = None;
        self.settle(Err(OperationError::Server(error)));
        self.task.clone()
    }

    fn send_hash(&mut self, link: &mut Link<'_>) -> Result<()> {
        let hash = self.task.hash.clone().unwrap_or_default();
        let req = ops::upload_hash(
            &self.task.id,
            &self.task.remote_path,
            &self.task.file_name,
            &hash,
            self.task.total_bytes,
        )?;
        self.task.status = UploadStatus::Hashing;
        link.send_request(&req).map_err(|e| {
            tracing::debug!(id = %self.task.id, "uploadhash send failed: {}", e);
            OperationError::SendFailed
        })
    }

    fn begin(&mut self, append: bool, offset: u64, link: &mut Link<'_>) -> Result<()> {
        self.task.status = UploadStatus::Uploading;
        self.task.append = append;
        self.task.next_offset = offset;
        self.task.bytes_uploaded = offset;
        self.task.pending_bytes = 0;
        self.done_sent = false;
        let req = ops::upload(
            &self.task.id,
            &self.task.remote_path,
            &self.task.file_name,
            self.task.total_bytes,
            append,
        )?;
        link.send_request(&req).map_err(|e| {
            tracing::debug!(id = %self.task.id, "upload send failed: {}", e);
            OperationError::SendFailed
        })
    }

    fn send_next_chunk(
        &mut self,
        chunk_size: usize,
        retry: Duration,
        link: &mut Link<'_>,
        now: Instant,
    ) -> Option<UploadTask> {
        if self.task.status != UploadStatus::Uploading || self.task.pending_bytes > 0 {
            return None;
        }
        if self.task.next_offset >= self.task.total_bytes {
            self.finish(retry, link, now);
            return None;
        }

        let start = self.task.next_offset;
        let end = start
            .saturating_add(chunk_size as u64)
            .min(self.task.total_bytes);
        let mut buf = vec![0u8; (end - start) as usize];
        let read = match self.source.as_mut() {
            Some(source) => source.read_at(start, &mut buf),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "source is still being hashed")),
        };
        if let Err(e) = read {
            return Some(self.fail(format!("Failed to read source: {}", e)));
        }
        let payload = prepare_upload_chunk(&buf);

        match link.send_binary(&payload) {
            Ok(()) => {
                self.task.pending_bytes = end - start;
                self.task.next_offset = end;
                self.retry_at = None;
            }
            Err(e) => {
                tracing::trace!(id = %self.task.id, offset = start, "Chunk send refused ({}), retrying", e);
                self.retry_at = Some(now + retry);
            }
        }
        None
    }

    fn finish(&mut self, retry: Duration, link: &mut Link<'_>, now: Instant) {
        if self.task.status != UploadStatus::Uploading || self.done_sent {
            return;
        }
        match link.send_request(&ops::upload_done(&self.task.id)) {
            Ok(()) => {
                self.done_sent = true;
                self.retry_at = None;
            }
            Err(_) => self.retry_at = Some(now + retry),
        }
    }
}

pub struct Uploader {
    slots: HashMap<String, Slot>,
    next_seq: u64,
    chunk_size: usize,
    hash_check_limit: u64,
    send_retry: Duration,
}

impl Uploader {
    pub fn new(chunk_size: usize, hash_check_limit: u64, send_retry: Duration) -> Self {
        Self {
            slots: HashMap::new(),
            next_seq: 0,
            chunk_size: chunk_size.max(1),
            hash_check_limit,
            send_retry,
        }
    }

    /// Register a task. Without a precheck `upload` goes out immediately;
    /// with one the task waits in `Hashing` and the returned [`HashJob`] must
    /// be run and fed back through [`Uploader::hash_ready`].
    /// The receiver settles when the task completes, fails, or is cancelled.
    pub fn start(
        &mut self,
        source: Box<dyn UploadSource>,
        remote_path: &str,
        check_hash: bool,
        link: &mut Link<'_>,
    ) -> Result<(String, UploadReceiver, Option<HashJob>)> {
        ops::validate_path(remote_path)?;
        let file_name = ops::validated_name(source.name())?;
        let total = source.size();
        let hash_first = check_hash && total <= self.hash_check_limit;

        let id = ops::generate_prefixed_id("upload");
        let (tx, rx) = oneshot::channel();
        self.next_seq += 1;
        let (source, job) = if hash_first {
            (
                None,
                Some(HashJob {
                    id: id.clone(),
                    source,
                }),
            )
        } else {
            (Some(source), None)
        };
        let mut slot = Slot {
            task: UploadTask {
                id: id.clone(),
                remote_path: remote_path.to_string(),
                file_name,
                bytes_uploaded: 0,
                total_bytes: total,
                next_offset: 0,
                pending_bytes: 0,
                status: if hash_first {
                    UploadStatus::Hashing
                } else {
                    UploadStatus::Pending
                },
                hash: None,
                append: false,
                error: None,
            },
            seq: self.next_seq,
            source,
            retry_at: None,
            done_sent: false,
            waiter: Some(tx),
        };
        tracing::debug!(
            id = %id,
            file = %slot.task.file_name,
            size = total,
            hashed = hash_first,
            "Upload started"
        );

        if !hash_first {
            if let Err(e) = slot.begin(false, 0, link) {
                slot.fail(e.to_string());
                self.slots.insert(id, slot);
                return Err(e);
            }
        }
        self.slots.insert(id.clone(), slot);
        Ok((id, rx, job))
    }

    /// Precheck hash computed: reattach the source and send `uploadhash`.
    /// Returns the task if it failed here.
    pub fn hash_ready(&mut self, hashed: HashedSource, link: &mut Link<'_>) -> Option<UploadTask> {
        let HashedSource { id, source, hash } = hashed;
        let Some(slot) = self.slots.get_mut(&id) else {
            tracing::debug!(id = %id, "Hash finished for an upload no longer tracked");
            return None;
        };
        if slot.source.is_none() {
            slot.source = Some(source);
        }
        if slot.task.status != UploadStatus::Hashing || slot.task.hash.is_some() {
            return None;
        }
        match hash {
            Ok(hash) => {
                slot.task.hash = Some(hash);
                match slot.send_hash(link) {
                    Ok(()) => None,
                    Err(e) => Some(slot.fail(e.to_string())),
                }
            }
            Err(e) => Some(slot.fail(format!("Failed to hash source: {}", e))),
        }
    }

    /// `uploadhash` reply: skip the transfer or begin at the resume offset
    pub fn handle_hash(
        &mut self,
        id: &str,
        exists: bool,
        offset: Option<u64>,
        link: &mut Link<'_>,
        events: &dyn FileManagerEvents,
    ) -> Option<UploadTask> {
        let slot = self.slots.get_mut(id)?;
        if slot.task.status != UploadStatus::Hashing || slot.task.hash.is_none() {
            return None;
        }
        if exists {
            tracing::info!(id = %id, "Remote already holds identical content");
            return Some(slot.complete(events));
        }
        let offset = offset.unwrap_or(0).min(slot.task.total_bytes);
        match slot.begin(offset > 0, offset, link) {
            Ok(()) => None,
            Err(e) => Some(slot.fail(e.to_string())),
        }
    }

    /// `uploadstart`: the agent is ready to receive. An explicit offset
    /// overrides the resume point; without one the offset agreed in the hash
    /// precheck stands.
    pub fn handle_start(
        &mut self,
        id: &str,
        offset: Option<u64>,
        link: &mut Link<'_>,
        now: Instant,
    ) -> Option<UploadTask> {
        let (chunk_size, retry) = (self.chunk_size, self.send_retry);
        let slot = self.slots.get_mut(id)?;
        if slot.task.status != UploadStatus::Uploading {
            return None;
        }
        if slot.task.pending_bytes > 0 {
            tracing::debug!(id = %id, "Repeated uploadstart with a chunk in flight ignored");
            return None;
        }
        if let Some(offset) = offset {
            let offset = offset.min(slot.task.total_bytes);
            slot.task.next_offset = offset;
            slot.task.bytes_uploaded = offset;
        }
        slot.retry_at = None;
        slot.send_next_chunk(chunk_size, retry, link, now)
    }

    /// `uploadack`: an explicit offset is the confirmed byte count. Landing
    /// inside the in-flight chunk rewinds the send position to it; at or below
    /// the already confirmed count it is a repeat and changes nothing.
    pub fn handle_ack(
        &mut self,
        id: &str,
        offset: Option<u64>,
        link: &mut Link<'_>,
        events: &dyn FileManagerEvents,
        now: Instant,
    ) -> Option<UploadTask> {
        let (chunk_size, retry) = (self.chunk_size, self.send_retry);
        let slot = self.slots.get_mut(id)?;
        if slot.task.status != UploadStatus::Uploading {
            return None;
        }
        if slot.task.pending_bytes == 0 {
            tracing::debug!(id = %id, "Ack with nothing in flight ignored");
            return None;
        }
        let in_flight_end = slot.task.bytes_uploaded + slot.task.pending_bytes;
        match offset {
            Some(confirmed) if confirmed <= slot.task.bytes_uploaded => {
                tracing::debug!(id = %id, confirmed, "Repeated ack ignored");
                return None;
            }
            Some(confirmed) if confirmed < in_flight_end => {
                tracing::debug!(
                    id = %id,
                    confirmed,
                    sent = in_flight_end,
                    "Partial ack, resending from confirmed offset"
                );
                slot.task.bytes_uploaded = confirmed;
                slot.task.next_offset = confirmed;
            }
            _ => slot.task.bytes_uploaded = in_flight_end,
        }
        slot.task.pending_bytes = 0;
        slot.retry_at = None;
        slot.report(events);

        if slot.task.bytes_uploaded >= slot.task.total_bytes {
            slot.finish(retry, link, now);
            None
        } else {
            slot.send_next_chunk(chunk_size, retry, link, now)
        }
    }

    /// `uploaddone` echo from the agent
    pub fn handle_done(&mut self, id: &str, events: &dyn FileManagerEvents) -> Option<UploadTask> {
        let slot = self.slots.get_mut(id)?;
        if !slot.task.status.is_active() {
            return None;
        }
        Some(slot.complete(events))
    }

    pub fn handle_error(&mut self, id: &str, error: &str) -> Option<UploadTask> {
        let slot = self.slots.get_mut(id)?;
        if matches!(slot.task.status, UploadStatus::Completed | UploadStatus::Failed) {
            return None;
        }
        Some(slot.fail(error.to_string()))
    }

    /// Drop the task locally; chunks already sent may still land remotely
    pub fn cancel(&mut self, id: &str) -> Option<UploadTask> {
        let mut slot = self.slots.remove(id)?;
        slot.task.status = UploadStatus::Cancelled;
        slot.task.pending_bytes = 0;
        slot.settle(Err(OperationError::Cancelled));
        tracing::info!(id = %id, "Upload cancelled");
        Some(slot.task)
    }

    /// Re-run a failed task. With a hash the agent can report how much it
    /// already holds; without one the upload restarts from zero.
    pub fn retry(&mut self, id: &str, link: &mut Link<'_>) -> Result<UploadReceiver> {
        let slot = self
            .slots
            .get_mut(id)
            .filter(|s| s.task.status == UploadStatus::Failed)
            .ok_or_else(|| OperationError::UnknownTransfer(id.to_string()))?;
        if slot.source.is_none() {
            return Err(OperationError::Io("source is still being hashed".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        slot.waiter = Some(tx);
        slot.task.error = None;
        slot.task.pending_bytes = 0;
        slot.done_sent = false;
        let sent = if slot.task.hash.is_some() {
            slot.send_hash(link)
        } else {
            slot.begin(false, 0, link)
        };
        if let Err(e) = sent {
            slot.fail(e.to_string());
            return Err(e);
        }
        tracing::info!(id = %id, "Retrying upload");
        Ok(rx)
    }

    /// Re-send chunks (or `uploaddone`) whose backoff has elapsed
    pub fn poll_retries(&mut self, link: &mut Link<'_>, now: Instant) -> Vec<UploadTask> {
        let (chunk_size, retry) = (self.chunk_size, self.send_retry);
        let mut failed = Vec::new();
        for slot in self.slots.values_mut() {
            if !slot.retry_at.is_some_and(|at| at <= now) {
                continue;
            }
            slot.retry_at = None;
            if slot.task.bytes_uploaded >= slot.task.total_bytes {
                slot.finish(retry, link, now);
            } else if let Some(t) = slot.send_next_chunk(chunk_size, retry, link, now) {
                failed.push(t);
            }
        }
        failed
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.values().filter_map(|s| s.retry_at).min()
    }

    /// Tunnel lost: settle every waiter with `Disconnected` and forget all
    /// tasks. Returns the ones that were mid-transfer.
    pub fn interrupt_all(&mut self) -> Vec<UploadTask> {
        let mut interrupted = Vec::new();
        for (_, mut slot) in self.slots.drain() {
            slot.settle(Err(OperationError::Disconnected));
            if slot.task.status.is_active() {
                interrupted.push(slot.task);
            }
        }
        interrupted.sort_by(|a, b| a.id.cmp(&b.id));
        interrupted
    }

    pub fn clear_completed(&mut self) {
        self.slots.retain(|_, s| {
            !matches!(s.task.status, UploadStatus::Completed | UploadStatus::Cancelled)
        });
    }

    pub fn has_active(&self) -> bool {
        self.slots.values().any(|s| s.task.status.is_active())
    }

    pub fn active_id(&self) -> Option<String> {
        self.slots
            .values()
            .filter(|s| s.task.status.is_active())
            .min_by_key(|s| s.seq)
            .map(|s| s.task.id.clone())
    }

    pub fn get(&self, id: &str) -> Option<UploadTask> {
        self.slots.get(id).map(|s| s.task.clone())
    }

    /// All tracked tasks, oldest first
    pub fn all(&self) -> Vec<UploadTask> {
        let mut slots: Vec<&Slot> = self.slots.values().collect();
        slots.sort_by_key(|s| s.seq);
        slots.into_iter().map(|s| s.task.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEvents;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::Transport;

    fn uploader() -> Uploader {
        Uploader::new(4, 1024, Duration::from_millis(25))
    }

    fn start_hashed(up: &mut Uploader, t: &mut MemoryTransport, name: &str, data: &[u8]) -> (String, UploadReceiver) {
        let (id, rx, job) = {
            let mut link = Link::new(Some(&mut *t));
            up.start(Box::new(MemorySource::new(name, data.to_vec())), "/d", true, &mut link)
                .unwrap()
        };
        let job = job.expect("hash job");
        assert_eq!(job.id(), id);
        assert_eq!(up.get(&id).unwrap().status, UploadStatus::Hashing);
        let hashed = job.run();
        let mut link = Link::new(Some(&mut *t));
        assert!(up.hash_ready(hashed, &mut link).is_none());
        (id, rx)
    }

    #[test]
    fn test_hash_source_is_sha384_hex() {
        let mut src = MemorySource::new("a", b"abc".to_vec());
        let h = hash_source(&mut src).unwrap();
        assert_eq!(h.len(), 96);
        assert!(h.starts_with("cb00753f45a35e8b"));
        let mut empty = MemorySource::new("e", Vec::new());
        assert_eq!(hash_source(&mut empty).unwrap().len(), 96);
    }

    #[test]
    fn test_memory_source_bounds() {
        let mut src = MemorySource::new("a", b"abcdef".to_vec());
        let mut buf = [0u8; 3];
        src.read_at(2, &mut buf).unwrap();
        assert_eq!(&buf, b"cde");
        assert!(src.read_at(5, &mut buf).is_err());
    }

    #[test]
    fn test_chunk_loop_is_window_one_and_escapes() {
        let mut t = MemoryTransport::default();
        let mut up = uploader();
        let now = Instant::now();
        let data = b"{abcdefgh".to_vec(); // 9 bytes -> chunks of 4,4,1
        let (id, mut rx, _) = {
            let mut link = Link::new(Some(&mut t));
            up.start(Box::new(MemorySource::new("f.txt", data)), "/d", false, &mut link)
                .unwrap()
        };
        {
            let mut link = Link::new(Some(&mut t));
            assert!(up.handle_start(&id, Some(0), &mut link, now).is_none());
            // a second start-less nudge must not send another chunk
            assert!(up.poll_retries(&mut link, now).is_empty());
        }
        assert_eq!(t.binary_sent(), vec![vec![0u8, b'{', b'a', b'b', b'c']]);

        for _ in 0..2 {
            let mut link = Link::new(Some(&mut t));
            up.handle_ack(&id, None, &mut link, &NoopEvents, now);
        }
        assert_eq!(t.binary_sent().len(), 3);
        assert_eq!(up.get(&id).unwrap().pending_bytes, 1);

        {
            let mut link = Link::new(Some(&mut t));
            up.handle_ack(&id, None, &mut link, &NoopEvents, now);
        }
        let done: Vec<_> = t
            .json_sent()
            .into_iter()
            .filter(|v| v["action"] == "uploaddone")
            .collect();
        assert_eq!(done.len(), 1);

        let task = up.handle_done(&id, &NoopEvents).unwrap();
        assert_eq!(task.status, UploadStatus::Completed);
        assert_eq!(task.bytes_uploaded, 9);
        assert_eq!(rx.try_recv().unwrap().unwrap().status, UploadStatus::Completed);
        t.stop();
    }

    #[test]
    fn test_backpressure_retries_same_chunk() {
        let mut t = MemoryTransport::default();
        let mut up = uploader();
        let now = Instant::now();
        let (id, _rx, _) = {
            let mut link = Link::new(Some(&mut t));
            up.start(Box::new(MemorySource::new("f", b"12345678".to_vec())), "/d", false, &mut link)
                .unwrap()
        };
        t.refuse_binary(1);
        {
            let mut link = Link::new(Some(&mut t));
            up.handle_start(&id, Some(0), &mut link, now);
        }
        assert!(t.binary_sent().is_empty());
        let at = up.next_deadline().unwrap();
        assert_eq!(at, now + Duration::from_millis(25));
        assert_eq!(up.get(&id).unwrap().next_offset, 0);

        {
            let mut link = Link::new(Some(&mut t));
            up.poll_retries(&mut link, at);
        }
        assert_eq!(t.binary_sent(), vec![b"1234".to_vec()]);
        assert!(up.next_deadline().is_none());
    }

    #[test]
    fn test_explicit_ack_offset_rewinds() {
        let mut t = MemoryTransport::default();
        let mut up = uploader();
        let now = Instant::now();
        let (id, _rx, _) = {
            let mut link = Link::new(Some(&mut t));
            up.start(Box::new(MemorySource::new("f", b"abcdefgh".to_vec())), "/d", false, &mut link)
                .unwrap()
        };
        let mut link = Link::new(Some(&mut t));
        up.handle_start(&id, Some(0), &mut link, now);
        // agent only took 2 of the 4 bytes
        up.handle_ack(&id, Some(2), &mut link, &NoopEvents, now);
        drop(link);
        let task = up.get(&id).unwrap();
        assert_eq!(task.bytes_uploaded, 2);
        assert_eq!(task.next_offset, 6);
        assert_eq!(t.binary_sent()[1], b"cdef".to_vec());
    }

    #[test]
    fn test_hash_exists_and_resume() {
        let mut t = MemoryTransport::default();
        let mut up = uploader();
        let (id, mut rx) = start_hashed(&mut up, &mut t, "f", b"abcdefgh");
        assert_eq!(t.json_sent()[0]["action"], "uploadhash");
        {
            let mut link = Link::new(Some(&mut t));
            let done = up.handle_hash(&id, true, None, &mut link, &NoopEvents).unwrap();
            assert_eq!(done.status, UploadStatus::Completed);
        }
        assert!(t.binary_sent().is_empty());
        assert!(rx.try_recv().unwrap().is_ok());

        let (id, _rx) = start_hashed(&mut up, &mut t, "g", b"abcdefgh");
        {
            let mut link = Link::new(Some(&mut t));
            assert!(up.handle_hash(&id, false, Some(4), &mut link, &NoopEvents).is_none());
        }
        let upload = t.json_sent().into_iter().last().unwrap();
        assert_eq!(upload["action"], "upload");
        assert_eq!(upload["append"], true);
        assert_eq!(up.get(&id).unwrap().bytes_uploaded, 4);
    }

    #[test]
    fn test_error_cancel_retry_and_interrupt() {
        let mut t = MemoryTransport::default();
        let mut up = uploader();
        let (id, mut rx) = start_hashed(&mut up, &mut t, "f", b"abc");
        let failed = up.handle_error(&id, "disk full").unwrap();
        assert_eq!(failed.status, UploadStatus::Failed);
        assert!(rx.try_recv().unwrap().is_err());
        assert!(!up.has_active());
        // failed tasks persist
        assert!(up.get(&id).is_some());

        let _rx = {
            let mut link = Link::new(Some(&mut t));
            up.retry(&id, &mut link).unwrap()
        };
        assert_eq!(up.active_id().as_deref(), Some(id.as_str()));
        let last = t.json_sent().into_iter().last().unwrap();
        assert_eq!(last["action"], "uploadhash");

        let interrupted = up.interrupt_all();
        assert_eq!(interrupted.len(), 1);
        assert!(up.all().is_empty());

        let (id2, mut rx2, _) = {
            let mut link = Link::new(Some(&mut t));
            up.start(Box::new(MemorySource::new("g", b"abc".to_vec())), "/d", false, &mut link)
                .unwrap()
        };
        assert_eq!(up.cancel(&id2).unwrap().status, UploadStatus::Cancelled);
        assert_eq!(rx2.try_recv().unwrap(), Err(OperationError::Cancelled));
        assert!(up.get(&id2).is_none());
        let mut link = Link::new(Some(&mut t));
        assert!(up.retry(&id2, &mut link).is_err());
    }

    #[test]
    fn test_rejects_traversal_in_remote_path() {
        let mut t = MemoryTransport::default();
        let mut up = uploader();
        let mut link = Link::new(Some(&mut t));
        let err = up
            .start(Box::new(MemorySource::new("f", vec![1])), "/a/../b", false, &mut link)
            .unwrap_err();
        assert!(matches!(err, OperationError::InvalidPath(_)));
        drop(link);
        assert!(t.sent().is_empty());
    }

    #[test]
    fn test_bare_uploadstart_keeps_precheck_offset() {
        let mut t = MemoryTransport::default();
        let mut up = uploader();
        let now = Instant::now();
        let (id, _rx) = start_hashed(&mut up, &mut t, "r.bin", b"ABCDEFGH");
        let mut link = Link::new(Some(&mut t));
        assert!(up.handle_hash(&id, false, Some(4), &mut link, &NoopEvents).is_none());
        assert!(up.handle_start(&id, None, &mut link, now).is_none());
        // repeated start while the chunk is out changes nothing
        assert!(up.handle_start(&id, None, &mut link, now).is_none());
        drop(link);
        assert_eq!(t.binary_sent(), vec![b"EFGH".to_vec()]);
        let task = up.get(&id).unwrap();
        assert_eq!(task.bytes_uploaded, 4);
        assert_eq!(task.next_offset, 8);
    }

    #[test]
    fn test_repeated_ack_offset_does_not_resend() {
        let mut t = MemoryTransport::default();
        let mut up = uploader();
        let now = Instant::now();
        let (id, _rx, _) = {
            let mut link = Link::new(Some(&mut t));
            up.start(Box::new(MemorySource::new("f", b"abcdefghijkl".to_vec())), "/d", false, &mut link)
                .unwrap()
        };
        let mut link = Link::new(Some(&mut t));
        up.handle_start(&id, Some(0), &mut link, now);
        up.handle_ack(&id, Some(4), &mut link, &NoopEvents, now);
        up.handle_ack(&id, Some(4), &mut link, &NoopEvents, now);
        drop(link);
        assert_eq!(t.binary_sent(), vec![b"abcd".to_vec(), b"efgh".to_vec()]);
        let task = up.get(&id).unwrap();
        assert_eq!(task.bytes_uploaded, 4);
        assert_eq!(task.pending_bytes, 4);
    }

    #[test]
    fn test_cancel_while_hashing_drops_late_digest() {
        let mut t = MemoryTransport::default();
        let mut up = uploader();
        let (id, mut rx, job) = {
            let mut link = Link::new(Some(&mut t));
            up.start(Box::new(MemorySource::new("f", b"abc".to_vec())), "/d", true, &mut link)
                .unwrap()
        };
        // nothing goes out until the digest is back
        assert!(t.sent().is_empty());
        assert!(up.has_active());
        assert_eq!(up.cancel(&id).unwrap().status, UploadStatus::Cancelled);
        assert_eq!(rx.try_recv().unwrap(), Err(OperationError::Cancelled));

        let hashed = job.unwrap().run();
        let mut link = Link::new(Some(&mut t));
        assert!(up.hash_ready(hashed, &mut link).is_none());
        drop(link);
        assert!(t.sent().is_empty());
    }

    #[test]
    fn test_unreadable_source_fails_in_hash_job() {
        struct Broken;
        impl UploadSource for Broken {
            fn name(&self) -> &str {
                "broken.bin"
            }
            fn size(&self) -> u64 {
                8
            }
            fn read_at(&mut self, _offset: u64, _buf: &mut [u8]) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::Other, "device gone"))
            }
        }

        let mut t = MemoryTransport::default();
        let mut up = uploader();
        let (id, mut rx, job) = {
            let mut link = Link::new(Some(&mut t));
            up.start(Box::new(Broken), "/d", true, &mut link).unwrap()
        };
        let hashed = job.unwrap().run();
        let mut link = Link::new(Some(&mut t));
        let failed = up.hash_ready(hashed, &mut link).unwrap();
        drop(link);
        assert_eq!(failed.status, UploadStatus::Failed);
        assert!(failed.error.unwrap().contains("device gone"));
        assert!(rx.try_recv().unwrap().is_err());
        assert!(up.get(&id).is_some());
    }
}
