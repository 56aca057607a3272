//! Request/response correlation by `reqid`
//!
//! Each request lives in an id-keyed arena with an explicit state. Timeouts are
//! driven by the owner through [`Correlator::expire`] and
//! [`Correlator::next_deadline`] instead of one timer per request. Settled ids
//! are kept as tombstones for a while so late or duplicate replies are absorbed
//! (and, for timed-out requests, logged as completed after the fact).

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{OperationError, Result};
use crate::message::FileEntry;
use crate::protocol::timeouts;

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Listing(Vec<FileEntry>),
    Response(Value),
}

pub type ReplySender = oneshot::Sender<Result<Reply>>;
pub type ReplyReceiver = oneshot::Receiver<Result<Reply>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Listing,
    Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Resolved,
    Rejected,
    TimedOut,
}

/// What happened to a reply handed to the correlator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Settled,
    /// Reply for a request that already timed out locally
    AfterTimeout,
    /// Reply for a request already resolved or rejected; ignored
    Duplicate,
    Unknown,
}

struct Entry {
    kind: RequestKind,
    state: RequestState,
    seq: u64,
    // Pending: reply deadline. Settled: when the tombstone may be dropped.
    deadline: Instant,
    sender: Option<ReplySender>,
}

pub struct Correlator {
    entries: HashMap<String, Entry>,
    next_seq: u64,
    retention: Duration,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::with_retention(Duration::from_millis(timeouts::SETTLED_RETENTION_MS))
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            next_seq: 0,
            retention,
        }
    }

    /// Register a pending request. Fails if `reqid` is already pending.
    pub fn register(
        &mut self,
        reqid: &str,
        kind: RequestKind,
        timeout: Duration,
        now: Instant,
    ) -> Result<ReplyReceiver> {
        if self.state(reqid) == Some(RequestState::Pending) {
            return Err(OperationError::DuplicateRequest(reqid.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        self.next_seq += 1;
        self.entries.insert(
            reqid.to_string(),
            Entry {
                kind,
                state: RequestState::Pending,
                seq: self.next_seq,
                deadline: now + timeout,
                sender: Some(tx),
            },
        );
        Ok(rx)
    }

    /// Drop a request whose send failed; the caller sees `error` immediately
    /// and no timeout will fire for it.
    pub fn abandon(&mut self, reqid: &str, error: OperationError) {
        if let Some(mut entry) = self.entries.remove(reqid) {
            if let Some(tx) = entry.sender.take() {
                let _ = tx.send(Err(error));
            }
        }
    }

    pub fn resolve(&mut self, reqid: &str, reply: Reply, now: Instant) -> Settle {
        self.settle(reqid, Ok(reply), now)
    }

    pub fn reject(&mut self, reqid: &str, error: OperationError, now: Instant) -> Settle {
        self.settle(reqid, Err(error), now)
    }

    fn settle(&mut self, reqid: &str, outcome: Result<Reply>, now: Instant) -> Settle {
        let Some(entry) = self.entries.get_mut(reqid) else {
            return Settle::Unknown;
        };
        match entry.state {
            RequestState::Pending => {
                entry.state = if outcome.is_ok() {
                    RequestState::Resolved
                } else {
                    RequestState::Rejected
                };
                entry.deadline = now + self.retention;
                if let Some(tx) = entry.sender.take() {
                    // Receiver dropped means the caller stopped waiting; nothing to do
                    let _ = tx.send(outcome);
                }
                Settle::Settled
            }
            RequestState::TimedOut => {
                tracing::info!(
                    reqid = %reqid,
                    ok = outcome.is_ok(),
                    "Request completed after timeout"
                );
                Settle::AfterTimeout
            }
            RequestState::Resolved | RequestState::Rejected => {
                tracing::debug!(reqid = %reqid, "Ignoring duplicate reply");
                Settle::Duplicate
            }
        }
    }

    /// Oldest pending listing, used when a listing reply omits its reqid
    pub fn oldest_pending_listing(&self) -> Option<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == RequestState::Pending && e.kind == RequestKind::Listing)
            .min_by_key(|(_, e)| e.seq)
            .map(|(id, _)| id.clone())
    }

    /// Time out every pending request whose deadline has passed and drop stale
    /// tombstones. Returns the ids that timed out.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        let retention = self.retention;
        self.entries.retain(|reqid, entry| {
            if entry.deadline > now {
                return true;
            }
            if entry.state != RequestState::Pending {
                return false;
            }
            tracing::warn!(
                reqid = %reqid,
                "Operation timed out; it may still have completed on the agent"
            );
            entry.state = RequestState::TimedOut;
            entry.deadline = now + retention;
            if let Some(tx) = entry.sender.take() {
                let _ = tx.send(Err(OperationError::TimedOut));
            }
            expired.push(reqid.clone());
            true
        });
        expired
    }

    /// Reject every pending request and forget all tombstones
    pub fn fail_all(&mut self, error: OperationError) -> usize {
        let mut failed = 0;
        for (_, mut entry) in self.entries.drain() {
            if entry.state == RequestState::Pending {
                failed += 1;
                if let Some(tx) = entry.sender.take() {
                    let _ = tx.send(Err(error.clone()));
                }
            }
        }
        failed
    }

    /// Earliest instant at which [`Correlator::expire`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.deadline).min()
    }

    pub fn state(&self, reqid: &str) -> Option<RequestState> {
        self.entries.get(reqid).map(|e| e.state)
    }

    pub fn is_pending(&self, reqid: &str) -> bool {
        self.state(reqid) == Some(RequestState::Pending)
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == RequestState::Pending)
            .count()
    }
}
