//! Session Error Taxonomy
//!
//! Every failure that can cross a component boundary is a `SessionError`
//! variant. Transient classes (node unavailable, timeout, connection) are
//! retried by the router's slot sweep and by the replication timer; all
//! other classes propagate to the caller unchanged and are mapped to HTTP
//! status codes at the boundary.

use axum::http::StatusCode;

use crate::session::types::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session passed its TTL. Surfaced as a conflict, never retried.
    #[error("session {0} has expired")]
    Expired(SessionId),

    #[error("session {0} not found")]
    NotFound(SessionId),

    /// Optimistic version mismatch on one or more sections. Sections that
    /// did not conflict were still applied before this was raised.
    #[error("version conflict on sections {conflicting_keys:?}")]
    Concurrency { conflicting_keys: Vec<String> },

    /// A section payload is over the configured cap. Rejected before the
    /// request reaches an actor.
    #[error("section '{key}' is {size} bytes, over the {limit} byte cap")]
    SizeExceeded { key: String, size: usize, limit: usize },

    /// A brand-new session must carry an expiration.
    #[error("session {0} is new and the update carries no expiration")]
    MissingExpiration(SessionId),

    /// Placement could not satisfy the replication requirement.
    #[error("placement failed: {0}")]
    NoCapacity(String),

    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    /// Reserved: the permission collaborator never raises this today.
    #[error("permission denied")]
    PermissionDenied,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SessionError {
    /// Transient classes are retried across slots by the router and across
    /// attempts by the replication timer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NodeUnavailable(_) | Self::Timeout(_) | Self::Connection(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Expired(_) | Self::Concurrency { .. } => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MissingExpiration(_) => StatusCode::BAD_REQUEST,
            Self::SizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NoCapacity(_)
            | Self::NodeUnavailable(_)
            | Self::Timeout(_)
            | Self::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classes_are_retryable() {
        assert!(SessionError::Timeout("t".into()).is_transient());
        assert!(SessionError::Connection("c".into()).is_transient());
        assert!(SessionError::NodeUnavailable("n".into()).is_transient());
        assert!(!SessionError::Expired(SessionId::nil()).is_transient());
        assert!(
            !SessionError::Concurrency {
                conflicting_keys: vec!["a".into()]
            }
            .is_transient()
        );
    }

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(
            SessionError::Expired(SessionId::nil()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            SessionError::NotFound(SessionId::nil()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            SessionError::SizeExceeded {
                key: "k".into(),
                size: 2,
                limit: 1
            }
            .status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            SessionError::NoCapacity("one node".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            SessionError::Internal(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
