//! Request Router
//!
//! Client-side slot resolution: remembers which replica slot last answered
//! for each session and sweeps the remaining slots on transient failure.
//! The router is generic over the per-slot operation so the retry policy
//! is testable with plain closures.

use std::future::Future;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::SessionError;
use crate::session::types::{PRIMARY_SLOT, ReplicaSlot, SessionId};

/// How long a successful slot answer stays sticky.
const LAST_GOOD_SLOT_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Get also sweeps one slot past the replication factor so an empty
    /// primary can be satisfied by read-through.
    Read,
    Write,
}

pub struct SessionRouter {
    replication_factor: u8,
    last_good_slot: DashMap<SessionId, (ReplicaSlot, Instant)>,
}

impl SessionRouter {
    pub fn new(replication_factor: u8) -> Self {
        Self {
            replication_factor,
            last_good_slot: DashMap::new(),
        }
    }

    /// Runs `op` against replica slots starting from the last known-good
    /// one.
    ///
    /// - success remembers the slot and returns the value;
    /// - `ExpiredError` stops the sweep and yields no result (the session
    ///   is logically gone, which is not the same as absent);
    /// - transient failures and unknown internal failures advance to the
    ///   next slot;
    /// - every other error propagates to the caller unchanged;
    /// - a fully exhausted sweep is a generic unavailability, never a
    ///   session-specific error.
    pub async fn resolve<T, F, Fut>(
        &self,
        session_id: SessionId,
        kind: RouteKind,
        op: F,
    ) -> Result<Option<T>, SessionError>
    where
        F: Fn(ReplicaSlot) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let max_slot = self.max_slot(kind);
        // A read may have cached the read-through slot, one past the write
        // sweep; clamp so every sweep makes at least one attempt.
        let start = self.cached_slot(session_id).min(max_slot);

        for slot in start..=max_slot {
            match op(slot).await {
                Ok(value) => {
                    self.remember_slot(session_id, slot);
                    return Ok(Some(value));
                }
                Err(SessionError::Expired(_)) => {
                    tracing::debug!("Session {} expired at slot {}", session_id, slot);
                    return Ok(None);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        "Slot {} unavailable for session {}: {}, trying next",
                        slot,
                        session_id,
                        e
                    );
                }
                Err(SessionError::Internal(e)) => {
                    tracing::error!("Unknown failure at slot {} for {}: {}", slot, session_id, e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(SessionError::NodeUnavailable(format!(
            "no replica slot answered for session {}",
            session_id
        )))
    }

    fn max_slot(&self, kind: RouteKind) -> ReplicaSlot {
        let factor = self.replication_factor.max(1);
        match kind {
            RouteKind::Read if self.replication_factor > 0 => factor + 1,
            _ => factor,
        }
    }

    fn cached_slot(&self, session_id: SessionId) -> ReplicaSlot {
        match self.last_good_slot.get(&session_id) {
            Some(entry) => {
                let (slot, cached_at) = *entry;
                if cached_at.elapsed() < LAST_GOOD_SLOT_TTL {
                    slot
                } else {
                    PRIMARY_SLOT
                }
            }
            None => PRIMARY_SLOT,
        }
    }

    fn remember_slot(&self, session_id: SessionId, slot: ReplicaSlot) {
        self.last_good_slot
            .insert(session_id, (slot, Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn transient() -> SessionError {
        SessionError::Timeout("silo gone".to_string())
    }

    #[tokio::test]
    async fn falls_over_to_next_slot_and_remembers_it() {
        let router = SessionRouter::new(2);
        let id = SessionId::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_seen = calls.clone();
        let result = router
            .resolve(id, RouteKind::Read, |slot| {
                let calls = calls_seen.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if slot == 1 {
                        Err(transient())
                    } else {
                        Ok(format!("slot-{}", slot))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.as_deref(), Some("slot-2"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The next resolve starts directly at slot 2.
        let result = router
            .resolve(id, RouteKind::Read, |slot| async move {
                assert_eq!(slot, 2);
                Ok("again")
            })
            .await
            .unwrap();
        assert_eq!(result, Some("again"));
    }

    #[tokio::test]
    async fn expired_stops_the_sweep_with_no_result() {
        let router = SessionRouter::new(2);
        let id = SessionId::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_seen = calls.clone();
        let result: Option<()> = router
            .resolve(id, RouteKind::Read, |_slot| {
                let calls = calls_seen.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SessionError::Expired(id))
                }
            })
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "expired must not retry");
    }

    #[tokio::test]
    async fn exhaustion_is_generic_unavailability() {
        let router = SessionRouter::new(2);
        let id = SessionId::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_seen = calls.clone();
        let result: Result<Option<()>, _> = router
            .resolve(id, RouteKind::Write, |_slot| {
                let calls = calls_seen.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;

        assert!(matches!(result, Err(SessionError::NodeUnavailable(_))));
        // Writes sweep replication_factor slots, no read-through bonus.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reads_get_one_extra_attempt() {
        let router = SessionRouter::new(2);
        let id = SessionId::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_seen = calls.clone();
        let _: Result<Option<()>, _> = router
            .resolve(id, RouteKind::Read, |_slot| {
                let calls = calls_seen.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn concurrency_errors_propagate_unchanged() {
        let router = SessionRouter::new(2);
        let id = SessionId::new();

        let result: Result<Option<()>, _> = router
            .resolve(id, RouteKind::Write, |_slot| async move {
                Err(SessionError::Concurrency {
                    conflicting_keys: vec!["cart".to_string()],
                })
            })
            .await;

        match result {
            Err(SessionError::Concurrency { conflicting_keys }) => {
                assert_eq!(conflicting_keys, vec!["cart".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_replication_factor_still_reaches_the_primary() {
        let router = SessionRouter::new(0);
        let id = SessionId::new();

        let result = router
            .resolve(id, RouteKind::Read, |slot| async move {
                assert_eq!(slot, PRIMARY_SLOT);
                Ok(42)
            })
            .await
            .unwrap();

        assert_eq!(result, Some(42));
    }
}
