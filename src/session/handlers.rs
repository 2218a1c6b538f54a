//! HTTP Handlers
//!
//! Public front-end (update / get / invalidate, routed through the slot
//! sweep) and the internal node-to-node endpoints (forwarded ops,
//! replication deliveries, read-through, activation probe). Errors cross
//! the boundary as an `ErrorBody` with the status code of their class.

use std::sync::Arc;

use axum::Json;
use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::SessionError;
use crate::router::{RouteKind, SessionRouter};
use crate::session::protocol::{
    ErrorBody, GetSessionRequest, InternalGetRequest, InternalGetResponse,
    InternalInvalidateRequest, InternalInvalidateResponse, InternalUpdateRequest,
    InternalUpdateResponse, InvalidateSessionRequest, ProbeRequest, ProbeResponse, SessionBody,
    UpdateSessionRequest,
};
use crate::session::runtime::ActorRuntime;
use crate::session::types::{
    GetQuery, InvalidateCommand, SectionRecord, SessionSnapshot, UpdateCommand, now_unix_seconds,
};

fn error_response(error: &SessionError) -> Response {
    (error.status_code(), Json(ErrorBody::from_error(error))).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            kind: "bad_request".to_string(),
            message: message.into(),
            conflicting_keys: vec![],
            session_id: None,
        }),
    )
        .into_response()
}

// --- Public front-end ---

pub async fn handle_update(
    Extension(runtime): Extension<Arc<ActorRuntime>>,
    Extension(router): Extension<Arc<SessionRouter>>,
    Json(req): Json<UpdateSessionRequest>,
) -> Response {
    let mut sections = Vec::with_capacity(req.sections.len());
    for dto in req.sections {
        let write = match dto.into_write() {
            Ok(write) => write,
            Err(e) => return bad_request(format!("undecodable section payload: {}", e)),
        };

        // The size cap is enforced here, before anything reaches an actor.
        if write.data.len() > runtime.config.max_section_size {
            let error = SessionError::SizeExceeded {
                key: write.key,
                size: write.data.len(),
                limit: runtime.config.max_section_size,
            };
            return error_response(&error);
        }

        sections.push(write);
    }

    let command = UpdateCommand {
        sections,
        expiration_unix_seconds: req.ttl_seconds.map(|ttl| now_unix_seconds() + ttl),
    };

    let session_id = req.session_id;
    let result = router
        .resolve(session_id, RouteKind::Write, |slot| {
            let runtime = runtime.clone();
            let command = command.clone();
            async move { runtime.update(session_id, slot, command).await }
        })
        .await;

    match result {
        Ok(Some(())) => StatusCode::OK.into_response(),
        Ok(None) => error_response(&SessionError::Expired(session_id)),
        Err(e) => error_response(&e),
    }
}

pub async fn handle_get(
    Extension(runtime): Extension<Arc<ActorRuntime>>,
    Extension(router): Extension<Arc<SessionRouter>>,
    Json(req): Json<GetSessionRequest>,
) -> Response {
    let session_id = req.session_id;
    let sections = req.sections;

    let result = router
        .resolve(session_id, RouteKind::Read, |slot| {
            let runtime = runtime.clone();
            let query = GetQuery {
                sections: sections.clone(),
            };
            async move { runtime.get(session_id, slot, query).await }
        })
        .await;

    match result {
        Ok(Some(Some(snapshot))) => {
            (StatusCode::OK, Json(SessionBody::from_snapshot(&snapshot))).into_response()
        }
        Ok(Some(None)) | Ok(None) => error_response(&SessionError::NotFound(session_id)),
        Err(e) => error_response(&e),
    }
}

pub async fn handle_invalidate(
    Extension(runtime): Extension<Arc<ActorRuntime>>,
    Extension(router): Extension<Arc<SessionRouter>>,
    Json(req): Json<InvalidateSessionRequest>,
) -> Response {
    let session_id = req.session_id;
    let reason = req.reason;

    let result = router
        .resolve(session_id, RouteKind::Write, |slot| {
            let runtime = runtime.clone();
            let command = InvalidateCommand {
                reason: reason.clone(),
            };
            async move { runtime.invalidate(session_id, slot, command).await }
        })
        .await;

    match result {
        Ok(Some(_)) => StatusCode::OK.into_response(),
        Ok(None) => error_response(&SessionError::NotFound(session_id)),
        Err(e) => error_response(&e),
    }
}

// --- Internal node-to-node endpoints ---

pub async fn handle_internal_update(
    Extension(runtime): Extension<Arc<ActorRuntime>>,
    Json(req): Json<InternalUpdateRequest>,
) -> Response {
    let node_addr = runtime.local_http_addr();

    let result = if let Some(version) = req.authoritative_version {
        // Replication delivery: rebuild the full snapshot and apply it
        // wholesale on the local replica instance.
        let Some(origin) = req.origin else {
            return bad_request("replication delivery without an origin");
        };
        let Some(expiration_unix_seconds) = req.expiration_unix_seconds else {
            return bad_request("replication delivery without an expiration");
        };

        let mut section_records = std::collections::HashMap::with_capacity(req.sections.len());
        for dto in req.sections {
            let write = match dto.into_write() {
                Ok(write) => write,
                Err(e) => return bad_request(format!("undecodable section payload: {}", e)),
            };
            section_records.insert(
                write.key,
                SectionRecord {
                    data: write.data,
                    version: write.version,
                },
            );
        }

        let snapshot = SessionSnapshot {
            expiration_unix_seconds,
            version,
            sections: section_records,
        };

        runtime
            .replicate_local(req.session_id, req.slot, snapshot, origin)
            .await
    } else {
        let mut sections = Vec::with_capacity(req.sections.len());
        for dto in req.sections {
            match dto.into_write() {
                Ok(write) => sections.push(write),
                Err(e) => return bad_request(format!("undecodable section payload: {}", e)),
            }
        }

        let command = UpdateCommand {
            sections,
            expiration_unix_seconds: req.expiration_unix_seconds,
        };
        runtime
            .update_local(req.session_id, req.slot, command)
            .await
    };

    match result {
        Ok(()) => (StatusCode::OK, Json(InternalUpdateResponse { node_addr })).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn handle_internal_get(
    Extension(runtime): Extension<Arc<ActorRuntime>>,
    Json(req): Json<InternalGetRequest>,
) -> Response {
    let node_addr = runtime.local_http_addr();
    let query = GetQuery {
        sections: req.sections,
    };

    match runtime.get_local(req.session_id, req.slot, query).await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(InternalGetResponse {
                node_addr,
                session: snapshot.map(|s| SessionBody::from_snapshot(&s)),
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn handle_internal_invalidate(
    Extension(runtime): Extension<Arc<ActorRuntime>>,
    Json(req): Json<InternalInvalidateRequest>,
) -> Response {
    let node_addr = runtime.local_http_addr();
    let command = InvalidateCommand { reason: req.reason };

    match runtime
        .invalidate_local(req.session_id, req.slot, command)
        .await
    {
        Ok(existed) => (
            StatusCode::OK,
            Json(InternalInvalidateResponse { node_addr, existed }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// Activation probe: answers whether this node currently hosts a live
/// actor for (session, slot). Never activates one.
pub async fn handle_internal_probe(
    Extension(runtime): Extension<Arc<ActorRuntime>>,
    Json(req): Json<ProbeRequest>,
) -> Response {
    (
        StatusCode::OK,
        Json(ProbeResponse {
            node_addr: runtime.local_http_addr(),
            hosted: runtime.hosts(req.session_id, req.slot),
        }),
    )
        .into_response()
}
