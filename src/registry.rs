//! Caller-owned guard against opening two file sessions to the same agent

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A file session for {agent} via {remote} is already active")]
    AlreadyActive { agent: String, remote: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    agent: String,
    remote: String,
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashSet<SessionKey>>>,
}

/// Held for the lifetime of a session; dropping it releases the slot
#[derive(Debug)]
pub struct SessionLease {
    key: SessionKey,
    active: Arc<Mutex<HashSet<SessionKey>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, agent: &str, remote: &str) -> Result<SessionLease, RegistryError> {
        let key = SessionKey {
            agent: agent.to_string(),
            remote: remote.to_string(),
        };
        if !self.active.lock().insert(key.clone()) {
            return Err(RegistryError::AlreadyActive {
                agent: key.agent,
                remote: key.remote,
            });
        }
        tracing::debug!(agent = %agent, remote = %remote, "Session acquired");
        Ok(SessionLease {
            key,
            active: self.active.clone(),
        })
    }

    pub fn is_active(&self, agent: &str, remote: &str) -> bool {
        self.active.lock().contains(&SessionKey {
            agent: agent.to_string(),
            remote: remote.to_string(),
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

impl SessionLease {
    pub fn agent(&self) -> &str {
        &self.key.agent
    }

    pub fn remote(&self) -> &str {
        &self.key.remote
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.active.lock().remove(&self.key);
        tracing::debug!(agent = %self.key.agent, "Session released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let registry = SessionRegistry::new();
        let lease = registry.acquire("node//a", "wss://mesh").unwrap();
        assert_eq!(lease.agent(), "node//a");
        assert!(matches!(
            registry.acquire("node//a", "wss://mesh"),
            Err(RegistryError::AlreadyActive { .. })
        ));
        let other = registry.acquire("node//b", "wss://mesh").unwrap();
        assert_eq!(registry.active_count(), 2);

        drop(lease);
        assert!(!registry.is_active("node//a", "wss://mesh"));
        assert!(registry.acquire("node//a", "wss://mesh").is_ok());
        drop(other);
    }

    #[test]
    fn test_clones_share_state() {
        let registry = SessionRegistry::new();
        let clone = registry.clone();
        let _lease = registry.acquire("n", "r").unwrap();
        assert!(clone.is_active("n", "r"));
        assert!(clone.acquire("n", "r").is_err());
    }
}
