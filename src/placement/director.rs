use std::sync::Arc;
use std::time::Duration;

use crate::error::SessionError;
use crate::liveness::LivenessCache;
use crate::membership::service::MembershipService;
use crate::membership::types::{Node, NodeId};
use crate::session::types::{PRIMARY_SLOT, ReplicaSlot, SessionId};

/// How long a slot-1 pin stays sticky in the local liveness cache.
const SESSION_PIN_TTL: Duration = Duration::from_secs(60 * 60);

/// Everything placement is allowed to look at for one activation.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub session_id: SessionId,
    pub slot: ReplicaSlot,
    /// Explicit target carried with the request; wins over every rule.
    pub hint: Option<NodeId>,
}

/// Chooses the node that hosts a new actor activation.
///
/// Rules, in order:
/// 1. An explicit placement hint wins, provided the hinted node is a
///    candidate.
/// 2. A slot-1 request for a session this node has no pin for lands on
///    the local node, and the pin is recorded so future slot-1
///    activations stay sticky.
/// 3. A single-node cluster can host the activation only if the session
///    is not already pinned here: one node cannot carry both replica
///    slots of the same session.
/// 4. Uniform random among candidates, skipping the local node whenever
///    more than one candidate remains, so replicas land on distinct
///    hosts.
pub fn place(
    request: &PlacementRequest,
    candidates: &[Node],
    local: &Node,
    cache: &LivenessCache,
) -> Result<NodeId, SessionError> {
    if candidates.is_empty() {
        return Err(SessionError::NoCapacity("no alive nodes".to_string()));
    }

    if let Some(hint) = &request.hint
        && candidates.iter().any(|node| &node.id == hint)
    {
        return Ok(hint.clone());
    }

    if request.slot == PRIMARY_SLOT && !cache.exists(request.session_id) {
        cache.add(request.session_id, SESSION_PIN_TTL);
        return Ok(local.id.clone());
    }

    if candidates.len() == 1 && candidates[0].id == local.id {
        if !cache.exists(request.session_id) {
            return Ok(local.id.clone());
        }
        return Err(SessionError::NoCapacity(
            "not enough nodes for session replication".to_string(),
        ));
    }

    use rand::Rng;
    let idx = rand::thread_rng().gen_range(0..candidates.len());
    let chosen = if candidates[idx].id == local.id {
        &candidates[(idx + 1) % candidates.len()]
    } else {
        &candidates[idx]
    };

    Ok(chosen.id.clone())
}

/// Thin runtime wrapper feeding `place` with live cluster state.
pub struct PlacementDirector {
    membership: Arc<MembershipService>,
    cache: Arc<LivenessCache>,
}

impl PlacementDirector {
    pub fn new(membership: Arc<MembershipService>, cache: Arc<LivenessCache>) -> Self {
        Self { membership, cache }
    }

    pub fn pick(&self, request: &PlacementRequest) -> Result<Node, SessionError> {
        let candidates = self.membership.get_alive_members();
        let chosen = place(
            request,
            &candidates,
            &self.membership.local_node,
            &self.cache,
        )?;

        tracing::debug!(
            "Placed ({}, slot {}) on {:?}",
            request.session_id,
            request.slot,
            chosen
        );

        candidates
            .into_iter()
            .find(|node| node.id == chosen)
            .ok_or_else(|| SessionError::NoCapacity("placed node vanished".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::types::NodeState;

    fn node(port: u16) -> Node {
        Node {
            id: NodeId::new(),
            gossip_addr: format!("127.0.0.1:{}", port).parse().unwrap(),
            http_addr: format!("127.0.0.1:{}", port + 1000).parse().unwrap(),
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: None,
        }
    }

    fn request(slot: ReplicaSlot) -> PlacementRequest {
        PlacementRequest {
            session_id: SessionId::new(),
            slot,
            hint: None,
        }
    }

    #[test]
    fn slot_one_pins_to_local_node() {
        let local = node(5000);
        let other = node(5001);
        let cache = LivenessCache::new();
        let req = request(1);

        let chosen = place(&req, &[local.clone(), other], &local, &cache).unwrap();

        assert_eq!(chosen, local.id);
        // The pin is sticky for the next placement decision.
        assert!(cache.exists(req.session_id));
    }

    #[test]
    fn pinned_slot_one_falls_through_to_random_remote() {
        let local = node(5000);
        let other = node(5001);
        let cache = LivenessCache::new();
        let req = request(1);

        cache.add(req.session_id, Duration::from_secs(60));

        // The pin exists but no activation does, so placement treats this
        // like any other replica and avoids the local node.
        let chosen = place(&req, &[local.clone(), other.clone()], &local, &cache).unwrap();
        assert_eq!(chosen, other.id);
    }

    #[test]
    fn single_node_cluster_refuses_second_replica() {
        let local = node(5000);
        let cache = LivenessCache::new();
        let req = request(2);

        cache.add(req.session_id, Duration::from_secs(60));

        let result = place(&req, &[local.clone()], &local, &cache);
        assert!(matches!(result, Err(SessionError::NoCapacity(_))));
    }

    #[test]
    fn single_node_cluster_hosts_unpinned_replica() {
        let local = node(5000);
        let cache = LivenessCache::new();

        let chosen = place(&request(2), &[local.clone()], &local, &cache).unwrap();
        assert_eq!(chosen, local.id);
    }

    #[test]
    fn explicit_hint_wins_over_pinning() {
        let local = node(5000);
        let other = node(5001);
        let cache = LivenessCache::new();

        let req = PlacementRequest {
            session_id: SessionId::new(),
            slot: 1,
            hint: Some(other.id.clone()),
        };

        let chosen = place(&req, &[local.clone(), other.clone()], &local, &cache).unwrap();
        assert_eq!(chosen, other.id);
        // Hinted placement never records a pin.
        assert!(!cache.exists(req.session_id));
    }

    #[test]
    fn hint_for_unknown_node_is_ignored() {
        let local = node(5000);
        let stranger = node(9000);
        let cache = LivenessCache::new();

        let req = PlacementRequest {
            session_id: SessionId::new(),
            slot: 1,
            hint: Some(stranger.id),
        };

        let chosen = place(&req, &[local.clone()], &local, &cache).unwrap();
        assert_eq!(chosen, local.id);
    }

    #[test]
    fn random_placement_excludes_local_node() {
        let local = node(5000);
        let a = node(5001);
        let b = node(5002);
        let cache = LivenessCache::new();

        for _ in 0..100 {
            let chosen = place(
                &request(2),
                &[local.clone(), a.clone(), b.clone()],
                &local,
                &cache,
            )
            .unwrap();
            assert_ne!(chosen, local.id, "replica placed on its own primary node");
        }
    }

    #[test]
    fn no_candidates_is_no_capacity() {
        let local = node(5000);
        let cache = LivenessCache::new();

        let result = place(&request(1), &[], &local, &cache);
        assert!(matches!(result, Err(SessionError::NoCapacity(_))));
    }
}
