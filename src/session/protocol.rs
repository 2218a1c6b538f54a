//! Session Network Protocol
//!
//! Endpoint paths and Data Transfer Objects for the public front-end and
//! for internode traffic (forwarding, replication, read-through, and the
//! existing-activation probe). Everything is JSON over HTTP; section
//! payloads travel base64-encoded.

use std::net::SocketAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::session::types::{
    ReplicaSlot, SectionRecord, SectionWrite, SessionId, SessionSnapshot,
};

// --- API Endpoints ---

/// Public endpoint for client write requests.
pub const ENDPOINT_UPDATE: &str = "/session/update";
/// Public endpoint for client read requests.
pub const ENDPOINT_GET: &str = "/session/get";
/// Public endpoint for explicit session invalidation.
pub const ENDPOINT_INVALIDATE: &str = "/session/invalidate";

/// Internal endpoint delivering a forwarded or replicated update to the
/// node that hosts (or must activate) the target actor.
pub const ENDPOINT_INTERNAL_UPDATE: &str = "/internal/session/update";
/// Internal endpoint for forwarded reads and slot-to-slot read-through.
pub const ENDPOINT_INTERNAL_GET: &str = "/internal/session/get";
/// Internal endpoint propagating an invalidation to a replica slot.
pub const ENDPOINT_INTERNAL_INVALIDATE: &str = "/internal/session/invalidate";
/// Internal endpoint asking whether a node currently hosts a live actor
/// for (session, slot), without activating one.
pub const ENDPOINT_INTERNAL_PROBE: &str = "/internal/session/probe";

// --- Data Transfer Objects ---

/// One section on the wire. `data_base64` is the payload, `version` the
/// optimistic-concurrency version (caller-believed on writes, stored on
/// reads).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionDto {
    pub key: String,
    pub data_base64: String,
    pub version: i64,
}

impl SectionDto {
    pub fn from_write(write: &SectionWrite) -> Self {
        Self {
            key: write.key.clone(),
            data_base64: BASE64.encode(&write.data),
            version: write.version,
        }
    }

    pub fn from_record(key: &str, record: &SectionRecord) -> Self {
        Self {
            key: key.to_string(),
            data_base64: BASE64.encode(&record.data),
            version: record.version,
        }
    }

    pub fn into_write(self) -> Result<SectionWrite, base64::DecodeError> {
        Ok(SectionWrite {
            key: self.key,
            data: BASE64.decode(self.data_base64.as_bytes())?,
            version: self.version,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSessionRequest {
    pub session_id: SessionId,
    pub sections: Vec<SectionDto>,
    /// Relative TTL; converted to an absolute deadline at the boundary.
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSessionRequest {
    pub session_id: SessionId,
    /// Empty means all sections.
    #[serde(default)]
    pub sections: Vec<String>,
}

/// Full read-side view of a session, also reused as the replication and
/// read-through payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBody {
    pub expiration_unix_seconds: i64,
    pub version: i64,
    pub sections: Vec<SectionDto>,
}

impl SessionBody {
    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Self {
        Self {
            expiration_unix_seconds: snapshot.expiration_unix_seconds,
            version: snapshot.version,
            sections: snapshot
                .sections
                .iter()
                .map(|(key, record)| SectionDto::from_record(key, record))
                .collect(),
        }
    }

    pub fn into_snapshot(self) -> Result<SessionSnapshot, base64::DecodeError> {
        let mut sections = std::collections::HashMap::with_capacity(self.sections.len());
        for dto in self.sections {
            sections.insert(
                dto.key,
                SectionRecord {
                    data: BASE64.decode(dto.data_base64.as_bytes())?,
                    version: dto.version,
                },
            );
        }
        Ok(SessionSnapshot {
            expiration_unix_seconds: self.expiration_unix_seconds,
            version: self.version,
            sections,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateSessionRequest {
    pub session_id: SessionId,
    pub reason: String,
}

/// Internal update delivery.
///
/// With `authoritative` unset this is a forwarded client update and runs
/// the ordinary optimistic checks. With `authoritative` set it carries the
/// sender's full post-update record (`body`) and is applied wholesale by
/// the receiving replica; `origin` is the sending node, which the replica
/// adopts as its replication-partner hint and never echoes back to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalUpdateRequest {
    pub session_id: SessionId,
    pub slot: ReplicaSlot,
    pub origin: Option<SocketAddr>,
    pub sections: Vec<SectionDto>,
    pub expiration_unix_seconds: Option<i64>,
    /// Present only on replication deliveries: the record version the
    /// receiving replica must adopt.
    pub authoritative_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalUpdateResponse {
    /// HTTP address of the node that served the request, recorded by the
    /// sender as its Location Hint.
    pub node_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalGetRequest {
    pub session_id: SessionId,
    pub slot: ReplicaSlot,
    #[serde(default)]
    pub sections: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalGetResponse {
    pub node_addr: SocketAddr,
    pub session: Option<SessionBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalInvalidateRequest {
    pub session_id: SessionId,
    pub slot: ReplicaSlot,
    pub reason: String,
    /// Set when slot 1 propagates its own invalidation; the replica does
    /// not fan out further.
    pub origin: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalInvalidateResponse {
    pub node_addr: SocketAddr,
    pub existed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub session_id: SessionId,
    pub slot: ReplicaSlot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub node_addr: SocketAddr,
    pub hosted: bool,
}

// --- Error body ---

/// Typed error representation crossing both the public and the internal
/// wire. `kind` is stable; `message` is advisory and never carries
/// internal detail for unknown failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicting_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl ErrorBody {
    pub fn from_error(error: &SessionError) -> Self {
        let (kind, message, conflicting_keys, session_id) = match error {
            SessionError::Expired(id) => ("expired", error.to_string(), vec![], Some(*id)),
            SessionError::NotFound(id) => ("not_found", error.to_string(), vec![], Some(*id)),
            SessionError::Concurrency { conflicting_keys } => (
                "concurrency",
                error.to_string(),
                conflicting_keys.clone(),
                None,
            ),
            SessionError::SizeExceeded { .. } => ("size_exceeded", error.to_string(), vec![], None),
            SessionError::MissingExpiration(id) => {
                ("missing_expiration", error.to_string(), vec![], Some(*id))
            }
            SessionError::NoCapacity(_) => ("no_capacity", error.to_string(), vec![], None),
            SessionError::NodeUnavailable(_) => {
                ("node_unavailable", error.to_string(), vec![], None)
            }
            SessionError::Timeout(_) => ("timeout", error.to_string(), vec![], None),
            SessionError::Connection(_) => ("connection", error.to_string(), vec![], None),
            SessionError::PermissionDenied => ("permission_denied", error.to_string(), vec![], None),
            // Never leak internal detail past the boundary.
            SessionError::Internal(_) => ("internal", "internal error".to_string(), vec![], None),
        };

        Self {
            kind: kind.to_string(),
            message,
            conflicting_keys,
            session_id,
        }
    }

    pub fn into_error(self) -> SessionError {
        let session_id = self.session_id.unwrap_or_else(SessionId::nil);
        match self.kind.as_str() {
            "expired" => SessionError::Expired(session_id),
            "not_found" => SessionError::NotFound(session_id),
            "concurrency" => SessionError::Concurrency {
                conflicting_keys: self.conflicting_keys,
            },
            "missing_expiration" => SessionError::MissingExpiration(session_id),
            "no_capacity" => SessionError::NoCapacity(self.message),
            "node_unavailable" => SessionError::NodeUnavailable(self.message),
            "timeout" => SessionError::Timeout(self.message),
            "connection" => SessionError::Connection(self.message),
            "permission_denied" => SessionError::PermissionDenied,
            _ => SessionError::Internal(anyhow::anyhow!(
                "remote failure ({}): {}",
                self.kind,
                self.message
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_dto_roundtrips_payload() {
        let write = SectionWrite {
            key: "cart".to_string(),
            data: vec![0, 159, 146, 150],
            version: 3,
        };

        let dto = SectionDto::from_write(&write);
        let back = dto.into_write().unwrap();
        assert_eq!(back, write);
    }

    #[test]
    fn error_body_preserves_conflict_keys() {
        let error = SessionError::Concurrency {
            conflicting_keys: vec!["a".to_string(), "b".to_string()],
        };

        let body = ErrorBody::from_error(&error);
        assert_eq!(body.kind, "concurrency");

        match body.into_error() {
            SessionError::Concurrency { conflicting_keys } => {
                assert_eq!(conflicting_keys, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn internal_errors_never_leak_detail() {
        let body = ErrorBody::from_error(&SessionError::Internal(anyhow::anyhow!(
            "connection string user=admin password=hunter2"
        )));
        assert_eq!(body.kind, "internal");
        assert_eq!(body.message, "internal error");
    }
}
