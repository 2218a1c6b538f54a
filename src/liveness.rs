//! Local Liveness Cache
//!
//! Process-local TTL set recording "this session was recently active on
//! this node". Consumed by the placement director (sticky slot-1 pinning)
//! and by session actors (presence window, independent from deactivation
//! timing). Never shared across nodes; each node's view is a hint that may
//! go stale, which placement tolerates by design of the protocol, not by
//! coordination.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::session::types::SessionId;

const PURGE_THRESHOLD: usize = 10_000;

pub struct LivenessCache {
    entries: DashMap<SessionId, Instant>,
}

impl LivenessCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn add(&self, session_id: SessionId, ttl: Duration) {
        if self.entries.len() > PURGE_THRESHOLD {
            let now = Instant::now();
            self.entries.retain(|_, deadline| *deadline > now);
        }
        self.entries.insert(session_id, Instant::now() + ttl);
    }

    pub fn remove(&self, session_id: SessionId) {
        self.entries.remove(&session_id);
    }

    pub fn exists(&self, session_id: SessionId) -> bool {
        // Copy the deadline out so the shard guard is released before any
        // removal below.
        let deadline = match self.entries.get(&session_id) {
            Some(entry) => *entry,
            None => return false,
        };

        if deadline > Instant::now() {
            return true;
        }

        self.entries.remove(&session_id);
        false
    }
}

impl Default for LivenessCache {
    fn default() -> Self {
        Self::new()
    }
}
