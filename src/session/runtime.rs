//! Actor Runtime
//!
//! The substrate the actors run on: a per-node registry of live mailboxes,
//! activation through the placement director, and HTTP delivery to other
//! nodes.
//!
//! ## Locating an actor
//! A message for (session, slot) is delivered to the local instance when
//! one exists. Otherwise the runtime probes the other alive nodes for an
//! existing activation and forwards to the first hit; only when no node
//! hosts the actor does placement run and a fresh instance activate, here
//! or on the chosen remote node. Internal deliveries always bind locally —
//! the sender already placed them — so a message forwards at most once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::liveness::LivenessCache;
use crate::membership::service::MembershipService;
use crate::placement::{PlacementDirector, PlacementRequest};
use crate::session::actor::{ActorHandle, SessionActor, SessionMessage};
use crate::session::protocol::{
    ENDPOINT_INTERNAL_GET, ENDPOINT_INTERNAL_INVALIDATE, ENDPOINT_INTERNAL_PROBE,
    ENDPOINT_INTERNAL_UPDATE, ErrorBody, InternalGetRequest, InternalGetResponse,
    InternalInvalidateRequest, InternalInvalidateResponse, InternalUpdateRequest,
    InternalUpdateResponse, ProbeRequest, ProbeResponse, SectionDto, SessionBody,
};
use crate::session::types::{
    GetQuery, InvalidateCommand, ReplicaSlot, SessionId, SessionSnapshot, UpdateCommand,
};
use crate::writebehind::pipeline::WriteBehindHandle;
use crate::writebehind::store::ExistenceStore;

const MAILBOX_CAPACITY: usize = 128;
/// Upper bound on waiting for an actor's reply; breaks any residual
/// call cycle between co-located instances the same way the transport
/// timeout breaks a distributed one.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

pub type ActorKey = (SessionId, ReplicaSlot);

enum Host {
    Local,
    Remote(SocketAddr),
}

pub struct ActorRuntime {
    pub config: Arc<ServerConfig>,
    pub membership: Arc<MembershipService>,
    pub liveness: Arc<LivenessCache>,
    pub writebehind: WriteBehindHandle,
    pub store: Arc<dyn ExistenceStore>,
    placement: PlacementDirector,
    actors: DashMap<ActorKey, ActorHandle>,
    activation_counter: AtomicU64,
    http_client: reqwest::Client,
}

impl ActorRuntime {
    pub fn new(
        config: Arc<ServerConfig>,
        membership: Arc<MembershipService>,
        liveness: Arc<LivenessCache>,
        writebehind: WriteBehindHandle,
        store: Arc<dyn ExistenceStore>,
    ) -> Arc<Self> {
        let placement = PlacementDirector::new(membership.clone(), liveness.clone());
        Arc::new(Self {
            config,
            membership,
            liveness,
            writebehind,
            store,
            placement,
            actors: DashMap::new(),
            activation_counter: AtomicU64::new(1),
            http_client: reqwest::Client::new(),
        })
    }

    pub fn local_http_addr(&self) -> SocketAddr {
        self.membership.local_node.http_addr
    }

    pub fn hosts(&self, session_id: SessionId, slot: ReplicaSlot) -> bool {
        self.actors.contains_key(&(session_id, slot))
    }

    pub fn active_actor_count(&self) -> usize {
        self.actors.len()
    }

    /// Registry cleanup on deactivation. The activation id check keeps a
    /// slow deactivation from evicting a successor instance.
    pub(crate) fn deregister(
        &self,
        session_id: SessionId,
        slot: ReplicaSlot,
        activation_id: u64,
    ) {
        self.actors
            .remove_if(&(session_id, slot), |_, handle| {
                handle.activation_id == activation_id
            });
    }

    // --- Client-facing dispatch (one op against one slot) ---

    pub async fn update(
        self: &Arc<Self>,
        session_id: SessionId,
        slot: ReplicaSlot,
        command: UpdateCommand,
    ) -> Result<(), SessionError> {
        match self.resolve_host(session_id, slot).await? {
            Host::Local => self.update_local(session_id, slot, command).await,
            Host::Remote(addr) => {
                let payload = InternalUpdateRequest {
                    session_id,
                    slot,
                    origin: None,
                    sections: command.sections.iter().map(SectionDto::from_write).collect(),
                    expiration_unix_seconds: command.expiration_unix_seconds,
                    authoritative_version: None,
                };
                // A client update is not idempotent; never auto-retry it.
                let _: InternalUpdateResponse = self
                    .post_internal(addr, ENDPOINT_INTERNAL_UPDATE, &payload, 1)
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn get(
        self: &Arc<Self>,
        session_id: SessionId,
        slot: ReplicaSlot,
        query: GetQuery,
    ) -> Result<Option<SessionSnapshot>, SessionError> {
        match self.resolve_host(session_id, slot).await? {
            Host::Local => self.get_local(session_id, slot, query).await,
            Host::Remote(addr) => {
                let payload = InternalGetRequest {
                    session_id,
                    slot,
                    sections: query.sections,
                };
                let response: InternalGetResponse = self
                    .post_internal(addr, ENDPOINT_INTERNAL_GET, &payload, 3)
                    .await?;
                decode_session(response.session)
            }
        }
    }

    pub async fn invalidate(
        self: &Arc<Self>,
        session_id: SessionId,
        slot: ReplicaSlot,
        command: InvalidateCommand,
    ) -> Result<bool, SessionError> {
        match self.resolve_host(session_id, slot).await? {
            Host::Local => self.invalidate_local(session_id, slot, command).await,
            Host::Remote(addr) => {
                let payload = InternalInvalidateRequest {
                    session_id,
                    slot,
                    reason: command.reason,
                    origin: None,
                };
                let response: InternalInvalidateResponse = self
                    .post_internal(addr, ENDPOINT_INTERNAL_INVALIDATE, &payload, 3)
                    .await?;
                Ok(response.existed)
            }
        }
    }

    // --- Local delivery (also the entry point for internal endpoints) ---

    pub async fn update_local(
        self: &Arc<Self>,
        session_id: SessionId,
        slot: ReplicaSlot,
        command: UpdateCommand,
    ) -> Result<(), SessionError> {
        self.send_message(session_id, slot, |reply| SessionMessage::Update {
            command: command.clone(),
            reply,
        })
        .await
    }

    pub async fn get_local(
        self: &Arc<Self>,
        session_id: SessionId,
        slot: ReplicaSlot,
        query: GetQuery,
    ) -> Result<Option<SessionSnapshot>, SessionError> {
        self.send_message(session_id, slot, |reply| SessionMessage::Get {
            query: query.clone(),
            reply,
        })
        .await
    }

    pub async fn invalidate_local(
        self: &Arc<Self>,
        session_id: SessionId,
        slot: ReplicaSlot,
        command: InvalidateCommand,
    ) -> Result<bool, SessionError> {
        self.send_message(session_id, slot, |reply| SessionMessage::Invalidate {
            command: command.clone(),
            reply,
        })
        .await
    }

    pub async fn replicate_local(
        self: &Arc<Self>,
        session_id: SessionId,
        slot: ReplicaSlot,
        snapshot: SessionSnapshot,
        origin: SocketAddr,
    ) -> Result<(), SessionError> {
        self.send_message(session_id, slot, |reply| SessionMessage::Replicate {
            snapshot: snapshot.clone(),
            origin,
            reply,
        })
        .await
    }

    // --- Actor-facing calls ---

    /// Ships a full-state snapshot to the partner slot and returns the
    /// address of the node that accepted it. Prefers the caller's Location
    /// Hint as long as the hinted node is still alive.
    pub(crate) async fn replicate_to(
        self: &Arc<Self>,
        session_id: SessionId,
        slot: ReplicaSlot,
        snapshot: SessionSnapshot,
        hint: Option<SocketAddr>,
    ) -> Result<SocketAddr, SessionError> {
        let host = match hint {
            Some(addr) if !self.membership.is_dead_node(addr) => Host::Remote(addr),
            _ => self.resolve_host(session_id, slot).await?,
        };

        match host {
            Host::Local => {
                let local = self.local_http_addr();
                self.replicate_local(session_id, slot, snapshot, local)
                    .await?;
                Ok(local)
            }
            Host::Remote(addr) => {
                let payload = InternalUpdateRequest {
                    session_id,
                    slot,
                    origin: Some(self.local_http_addr()),
                    sections: snapshot
                        .sections
                        .iter()
                        .map(|(key, record)| SectionDto::from_record(key, record))
                        .collect(),
                    expiration_unix_seconds: Some(snapshot.expiration_unix_seconds),
                    authoritative_version: Some(snapshot.version),
                };
                let response: InternalUpdateResponse = self
                    .post_internal(addr, ENDPOINT_INTERNAL_UPDATE, &payload, 3)
                    .await?;
                Ok(response.node_addr)
            }
        }
    }

    /// Full-record fetch from a replica slot, for read-through hydration.
    pub(crate) async fn read_through(
        self: &Arc<Self>,
        session_id: SessionId,
        slot: ReplicaSlot,
    ) -> Result<(Option<SessionSnapshot>, SocketAddr), SessionError> {
        match self.resolve_host(session_id, slot).await? {
            Host::Local => {
                let snapshot = self
                    .get_local(session_id, slot, GetQuery::default())
                    .await?;
                Ok((snapshot, self.local_http_addr()))
            }
            Host::Remote(addr) => {
                let payload = InternalGetRequest {
                    session_id,
                    slot,
                    sections: vec![],
                };
                let response: InternalGetResponse = self
                    .post_internal(addr, ENDPOINT_INTERNAL_GET, &payload, 3)
                    .await?;
                Ok((decode_session(response.session)?, response.node_addr))
            }
        }
    }

    pub(crate) async fn invalidate_partner(
        self: &Arc<Self>,
        session_id: SessionId,
        slot: ReplicaSlot,
        command: InvalidateCommand,
        hint: Option<SocketAddr>,
    ) -> Result<bool, SessionError> {
        let host = match hint {
            Some(addr) if !self.membership.is_dead_node(addr) => Host::Remote(addr),
            _ => self.resolve_host(session_id, slot).await?,
        };

        match host {
            Host::Local => self.invalidate_local(session_id, slot, command).await,
            Host::Remote(addr) => {
                let payload = InternalInvalidateRequest {
                    session_id,
                    slot,
                    reason: command.reason,
                    origin: Some(self.local_http_addr()),
                };
                let response: InternalInvalidateResponse = self
                    .post_internal(addr, ENDPOINT_INTERNAL_INVALIDATE, &payload, 3)
                    .await?;
                Ok(response.existed)
            }
        }
    }

    // --- Activation and delivery plumbing ---

    async fn resolve_host(
        self: &Arc<Self>,
        session_id: SessionId,
        slot: ReplicaSlot,
    ) -> Result<Host, SessionError> {
        if self.hosts(session_id, slot) {
            return Ok(Host::Local);
        }

        // Stand-in for the activation directory: ask every other alive
        // node whether it already hosts this actor.
        let local_id = self.membership.local_node.id.clone();
        for node in self.membership.get_alive_members() {
            if node.id == local_id {
                continue;
            }
            let payload = ProbeRequest { session_id, slot };
            match self
                .post_internal::<_, ProbeResponse>(
                    node.http_addr,
                    ENDPOINT_INTERNAL_PROBE,
                    &payload,
                    1,
                )
                .await
            {
                Ok(response) if response.hosted => {
                    return Ok(Host::Remote(node.http_addr));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Probe of {} failed: {}", node.http_addr, e);
                }
            }
        }

        let request = PlacementRequest {
            session_id,
            slot,
            hint: None,
        };
        let node = self.placement.pick(&request)?;

        if node.id == local_id {
            Ok(Host::Local)
        } else {
            Ok(Host::Remote(node.http_addr))
        }
    }

    async fn send_message<R>(
        self: &Arc<Self>,
        session_id: SessionId,
        slot: ReplicaSlot,
        build: impl Fn(oneshot::Sender<Result<R, SessionError>>) -> SessionMessage,
    ) -> Result<R, SessionError> {
        for _attempt in 0..3 {
            let tx = self.get_or_activate(session_id, slot);
            let (reply_tx, reply_rx) = oneshot::channel();

            if tx.send(build(reply_tx)).await.is_err() {
                // The instance deactivated under us; drop the stale handle
                // and let the next attempt activate a fresh one.
                self.actors
                    .remove_if(&(session_id, slot), |_, handle| handle.tx.same_channel(&tx));
                continue;
            }

            return match tokio::time::timeout(REPLY_TIMEOUT, reply_rx).await {
                Ok(Ok(result)) => result,
                // Deactivated between accepting the message and handling
                // it; transient, the caller's sweep covers it.
                Ok(Err(_)) => Err(SessionError::NodeUnavailable(format!(
                    "actor ({}, slot {}) deactivated before replying",
                    session_id, slot
                ))),
                Err(_) => Err(SessionError::Timeout(format!(
                    "actor ({}, slot {}) did not reply",
                    session_id, slot
                ))),
            };
        }

        Err(SessionError::NodeUnavailable(format!(
            "actor ({}, slot {}) keeps deactivating",
            session_id, slot
        )))
    }

    fn get_or_activate(
        self: &Arc<Self>,
        session_id: SessionId,
        slot: ReplicaSlot,
    ) -> mpsc::Sender<SessionMessage> {
        self.actors
            .entry((session_id, slot))
            .or_insert_with(|| self.spawn_actor(session_id, slot))
            .tx
            .clone()
    }

    fn spawn_actor(self: &Arc<Self>, session_id: SessionId, slot: ReplicaSlot) -> ActorHandle {
        let activation_id = self.activation_counter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

        let actor = SessionActor::new(session_id, slot, activation_id, self.clone());
        tokio::spawn(actor.run(rx));

        ActorHandle { tx, activation_id }
    }

    // --- HTTP helpers with backoff ---

    async fn post_internal<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        addr: SocketAddr,
        path: &str,
        payload: &Req,
        attempts: usize,
    ) -> Result<Resp, SessionError> {
        let url = format!("http://{}{}", addr, path);
        let mut delay_ms = 150u64;
        let mut last_error = SessionError::NodeUnavailable(format!("no attempt made to {}", url));

        for attempt in 0..attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    return resp.json::<Resp>().await.map_err(|e| {
                        SessionError::Internal(anyhow::anyhow!("bad response from {}: {}", url, e))
                    });
                }
                Ok(resp) => {
                    // A non-2xx reply is a decision by the remote node,
                    // not a delivery failure; surface it without retrying.
                    let status = resp.status();
                    return match resp.json::<ErrorBody>().await {
                        Ok(body) => Err(body.into_error()),
                        Err(_) => Err(SessionError::NodeUnavailable(format!(
                            "{} answered {}",
                            url, status
                        ))),
                    };
                }
                Err(e) => {
                    last_error = classify_transport_error(&url, &e);
                    if attempt + 1 == attempts {
                        break;
                    }
                    // Jitter keeps simultaneous retries from stampeding.
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(last_error)
    }
}

fn classify_transport_error(url: &str, error: &reqwest::Error) -> SessionError {
    if error.is_timeout() {
        SessionError::Timeout(format!("{}: {}", url, error))
    } else if error.is_connect() {
        SessionError::Connection(format!("{}: {}", url, error))
    } else {
        SessionError::NodeUnavailable(format!("{}: {}", url, error))
    }
}

fn decode_session(body: Option<SessionBody>) -> Result<Option<SessionSnapshot>, SessionError> {
    match body {
        Some(body) => body
            .into_snapshot()
            .map(Some)
            .map_err(|e| SessionError::Internal(anyhow::anyhow!("undecodable session body: {}", e))),
        None => Ok(None),
    }
}
