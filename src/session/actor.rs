//! Session Actor
//!
//! One addressable instance per (session id, replica slot). Each instance
//! is a single tokio task draining an mpsc mailbox, so messages are
//! processed strictly in arrival order and the record is never touched
//! concurrently. The replication retry tick and the idle-deactivation
//! deadline are `select!` branches of the same task: both are serialized
//! with message handling and both die with the task, so a cancelled
//! instance can never leak a timer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::ReplicationType;
use crate::error::SessionError;
use crate::session::runtime::ActorRuntime;
use crate::session::types::{
    GetQuery, InvalidateCommand, PRIMARY_SLOT, ReplicaSlot, SessionDeletion, SessionId,
    SessionRecord, SessionSnapshot, UpdateCommand, now_unix_seconds,
};

/// How long an activation advertises its presence in the local liveness
/// cache. Intentionally longer than any idle window so placement keeps
/// treating the session as pinned here across reactivations.
const ACTOR_PRESENCE_TTL: Duration = Duration::from_secs(60 * 60);

/// First retry delay after entering the async replication path.
const REPLICATION_FIRST_DELAY: Duration = Duration::from_millis(500);

pub enum SessionMessage {
    Update {
        command: UpdateCommand,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Get {
        query: GetQuery,
        reply: oneshot::Sender<Result<Option<SessionSnapshot>, SessionError>>,
    },
    Invalidate {
        command: InvalidateCommand,
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    /// Authoritative full-state delivery from the replication partner.
    /// Applied wholesale, versions included; never fans out again.
    Replicate {
        snapshot: SessionSnapshot,
        origin: SocketAddr,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// Mailbox entry kept in the runtime registry. `activation_id` guards
/// registry removal: a deactivating instance only evicts itself, never a
/// successor that reused its key.
#[derive(Clone)]
pub struct ActorHandle {
    pub tx: mpsc::Sender<SessionMessage>,
    pub activation_id: u64,
}

pub struct SessionActor {
    session_id: SessionId,
    slot: ReplicaSlot,
    activation_id: u64,
    record: SessionRecord,
    /// Location Hint: believed host of the replication partner. None when
    /// unknown or when it would point at this node.
    next: Option<SocketAddr>,
    /// Armed while a replication retry is pending.
    retry_at: Option<Instant>,
    idle_deadline: Instant,
    runtime: Arc<ActorRuntime>,
}

impl SessionActor {
    pub fn new(
        session_id: SessionId,
        slot: ReplicaSlot,
        activation_id: u64,
        runtime: Arc<ActorRuntime>,
    ) -> Self {
        let idle = runtime.config.idle_deactivation();
        Self {
            session_id,
            slot,
            activation_id,
            record: SessionRecord::empty(),
            next: None,
            retry_at: None,
            idle_deadline: Instant::now() + idle,
            runtime,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<SessionMessage>) {
        tracing::info!(
            "Activating ({}, slot {}) on {}",
            self.session_id,
            self.slot,
            self.runtime.local_http_addr()
        );

        self.runtime
            .liveness
            .add(self.session_id, ACTOR_PRESENCE_TTL);

        loop {
            let idle_deadline = self.idle_deadline;
            let retry_armed = self.retry_at.is_some();
            let retry_at = self.retry_at.unwrap_or(idle_deadline);

            tokio::select! {
                biased;

                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },

                _ = tokio::time::sleep_until(retry_at), if retry_armed => {
                    // Re-arm the steady-state tick first; a successful
                    // attempt below cancels it.
                    self.retry_at =
                        Some(Instant::now() + self.runtime.config.replication_retry_delay());
                    if let Err(e) = self.attempt_replication("retry").await {
                        tracing::warn!(
                            "Replication retry failed for ({}, slot {}): {}",
                            self.session_id,
                            self.slot,
                            e
                        );
                    }
                },

                _ = tokio::time::sleep_until(idle_deadline) => break,
            }
        }

        // Stop accepting mail before the final replication work runs; a
        // late sender re-activates a fresh instance instead of parking a
        // message in a dying mailbox.
        drop(rx);
        self.deactivate().await;
    }

    async fn handle(&mut self, msg: SessionMessage) {
        match msg {
            SessionMessage::Update { command, reply } => {
                let result = self.handle_update(command).await;
                let _ = reply.send(result);
            }
            SessionMessage::Get { query, reply } => {
                let result = self.handle_get(query).await;
                let _ = reply.send(result);
            }
            SessionMessage::Invalidate { command, reply } => {
                let result = self.handle_invalidate(command).await;
                let _ = reply.send(result);
            }
            SessionMessage::Replicate {
                snapshot,
                origin,
                reply,
            } => {
                let result = self.handle_replicate(snapshot, origin);
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_update(&mut self, command: UpdateCommand) -> Result<(), SessionError> {
        tracing::debug!(
            "Update ({}, slot {}): {} section(s)",
            self.session_id,
            self.slot,
            command.sections.len()
        );

        let now = now_unix_seconds();

        if let Some(expiration) = command.expiration_unix_seconds {
            self.extend_idle_deadline(expiration, now);
        }

        if self.record.is_empty() {
            let Some(expiration) = command.expiration_unix_seconds else {
                return Err(SessionError::MissingExpiration(self.session_id));
            };
            self.record = SessionRecord::create(self.session_id, expiration, &command.sections);
        } else {
            if let Some(expiration) = command.expiration_unix_seconds {
                self.record.set_expiration(expiration);
            }

            let conflicting_keys = self.record.apply_sections(
                &command.sections,
                self.runtime.config.enable_concurrency_check_for_sections,
            );
            if !conflicting_keys.is_empty() {
                // Sections without a conflict were already applied above;
                // the caller learns about the survivors on the next read.
                return Err(SessionError::Concurrency { conflicting_keys });
            }
        }

        if self.record.is_expired(now) {
            return Err(SessionError::Expired(self.session_id));
        }

        if self.slot == PRIMARY_SLOT {
            self.runtime.writebehind.record_existence(self.session_id);
            self.replicate("update").await?;
        }

        Ok(())
    }

    async fn handle_get(
        &mut self,
        query: GetQuery,
    ) -> Result<Option<SessionSnapshot>, SessionError> {
        if self.record.is_empty() {
            if self.slot > PRIMARY_SLOT || !self.runtime.config.replication_enabled() {
                return Ok(None);
            }

            // Read-through: an empty primary asks its replica for the full
            // record, hydrates from it, and remembers where it lives.
            match self
                .runtime
                .read_through(self.session_id, self.partner_slot())
                .await
            {
                Ok((snapshot, replica_addr)) => {
                    self.set_next(replica_addr);

                    let Some(snapshot) = snapshot else {
                        return Ok(None);
                    };
                    self.record = SessionRecord::hydrate(self.session_id, &snapshot);
                    self.extend_idle_deadline(
                        self.record.expiration_unix_seconds,
                        now_unix_seconds(),
                    );
                    return Ok(Some(self.record.snapshot(&query.sections)));
                }
                Err(e) => {
                    tracing::warn!(
                        "Read-through failed for ({}, slot {}): {}",
                        self.session_id,
                        self.slot,
                        e
                    );
                    return Ok(None);
                }
            }
        }

        if self.record.is_expired(now_unix_seconds()) {
            return Err(SessionError::Expired(self.session_id));
        }

        // Self-healing read: with no live partner on record, schedule a
        // re-replication. Always via the retry tick so a read never blocks
        // on (or deadlocks with) its own replica.
        let partner_dead = match self.next {
            None => true,
            Some(addr) => self.runtime.membership.is_dead_node(addr),
        };
        if partner_dead && self.runtime.config.replication_enabled() {
            self.arm_retry(REPLICATION_FIRST_DELAY);
        }

        Ok(Some(self.record.snapshot(&query.sections)))
    }

    async fn handle_invalidate(
        &mut self,
        command: InvalidateCommand,
    ) -> Result<bool, SessionError> {
        tracing::info!(
            "Invalidate ({}, slot {}): {}",
            self.session_id,
            self.slot,
            command.reason
        );

        // Deactivate once the mailbox drains.
        self.idle_deadline = Instant::now();
        self.retry_at = None;
        self.runtime.liveness.remove(self.session_id);

        if self.record.is_empty() {
            let known = self
                .runtime
                .store
                .exists(self.session_id)
                .await
                .unwrap_or(true);
            if !known {
                return Ok(true);
            }
        }

        self.record = SessionRecord::empty();
        self.runtime.writebehind.record_deletion(SessionDeletion {
            session_id: self.session_id,
            reason: command.reason.clone(),
        });

        if self.slot == PRIMARY_SLOT && self.runtime.config.replication_enabled() {
            return self
                .runtime
                .invalidate_partner(self.session_id, self.partner_slot(), command, self.next)
                .await;
        }

        Ok(true)
    }

    fn handle_replicate(
        &mut self,
        snapshot: SessionSnapshot,
        origin: SocketAddr,
    ) -> Result<(), SessionError> {
        tracing::debug!(
            "Replica delivery for ({}, slot {}) from {}",
            self.session_id,
            self.slot,
            origin
        );

        self.record = SessionRecord::hydrate(self.session_id, &snapshot);
        self.set_next(origin);
        self.extend_idle_deadline(self.record.expiration_unix_seconds, now_unix_seconds());

        Ok(())
    }

    /// Entry point for replication after a successful local change.
    ///
    /// Async mode never replicates inline: it arms the retry tick with a
    /// short first delay and returns. Sync mode attempts inline; a failure
    /// propagates when `ensure_synchronized` is set and otherwise degrades
    /// to the timer.
    async fn replicate(&mut self, reason: &str) -> Result<(), SessionError> {
        if !self.runtime.config.replication_enabled() || self.record.is_empty() {
            return Ok(());
        }

        if self.runtime.config.replication_type == ReplicationType::Async {
            self.arm_retry(REPLICATION_FIRST_DELAY);
            return Ok(());
        }

        match self.attempt_replication(reason).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.runtime.config.ensure_synchronized {
                    return Err(e);
                }
                self.arm_retry(self.runtime.config.replication_retry_delay());
                Ok(())
            }
        }
    }

    /// One replication attempt: ship the full current record to the
    /// partner slot. Success refreshes the Location Hint and cancels any
    /// pending retry.
    async fn attempt_replication(&mut self, reason: &str) -> Result<(), SessionError> {
        if !self.runtime.config.replication_enabled() || self.record.is_empty() {
            self.retry_at = None;
            return Ok(());
        }

        let partner = self.partner_slot();
        tracing::debug!(
            "({}, slot {}) replicating to slot {}. Reason: {}",
            self.session_id,
            self.slot,
            partner,
            reason
        );

        let snapshot = self.record.snapshot(&[]);
        let partner_addr = self
            .runtime
            .replicate_to(self.session_id, partner, snapshot, self.next)
            .await?;

        self.set_next(partner_addr);
        self.retry_at = None;

        Ok(())
    }

    async fn deactivate(self) {
        tracing::info!(
            "Deactivating ({}, slot {}) on {}",
            self.session_id,
            self.slot,
            self.runtime.local_http_addr()
        );

        self.runtime
            .deregister(self.session_id, self.slot, self.activation_id);
        self.runtime.liveness.remove(self.session_id);

        if self.record.is_empty() {
            return;
        }

        if self.record.is_expired(now_unix_seconds()) {
            self.runtime.writebehind.record_deletion(SessionDeletion {
                session_id: self.session_id,
                reason: "expired".to_string(),
            });
            return;
        }

        // Last chance to hand the freshest copy to the partner before this
        // instance disappears. Best-effort by design.
        let mut actor = self;
        if let Err(e) = actor.attempt_replication("deactivate").await {
            tracing::warn!(
                "Final replication failed for ({}, slot {}): {}",
                actor.session_id,
                actor.slot,
                e
            );
        }
    }

    /// The replica slot this instance hands its state to. Hand-off is a
    /// fixed 1 <-> 2 alternation, independent of the configured factor.
    fn partner_slot(&self) -> ReplicaSlot {
        if self.slot == PRIMARY_SLOT { 2 } else { PRIMARY_SLOT }
    }

    fn set_next(&mut self, addr: SocketAddr) {
        self.next = if addr == self.runtime.local_http_addr() {
            None
        } else {
            Some(addr)
        };
    }

    fn arm_retry(&mut self, delay: Duration) {
        if self.retry_at.is_none() {
            self.retry_at = Some(Instant::now() + delay);
        }
    }

    fn extend_idle_deadline(&mut self, expiration_unix_seconds: i64, now_unix: i64) {
        let remaining = expiration_unix_seconds.saturating_sub(now_unix);
        // A past deadline keeps the current idle window; the record answers
        // ExpiredError until deactivation emits its deletion event.
        if remaining > 0 {
            self.idle_deadline = Instant::now() + Duration::from_secs(remaining as u64);
        }
    }
}
