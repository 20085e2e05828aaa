//! Signaling surface: offer/answer exchange, trickle candidates, and the
//! health check.
//!
//! Handlers are stateless; every operation delegates to the peer manager.
//! Bodies are parsed by hand so malformed input maps to the documented
//! `{"error": ..., "message": ...}` shape instead of the framework default.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use prism_protocol::StreamMetadata;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::manager::{PeerManager, PeerManagerError};
use crate::stats::{StreamStats, format_uptime};

/// Response header carrying the minted peer id; also accepted on requests
/// that address an existing session.
const PEER_ID_HEADER: &str = "x-peer-id";

/// Offers are tens of KB; anything near this cap is garbage.
const MAX_SIGNALING_BODY: usize = 262_144;

/// Upper bound on a whole signaling exchange.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Shared application state.
pub struct AppState {
    pub manager: Arc<PeerManager>,
    pub stats: Arc<StreamStats>,
    /// Last metadata announced by the producer, if any.
    pub stream_info: watch::Receiver<Option<StreamMetadata>>,
    pub started_at: Instant,
}

/// Build the signaling router with CORS per the configured origins.
pub fn build_router(state: Arc<AppState>, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/webrtc/offer", post(offer))
        .route("/webrtc/candidate", post(candidate))
        .route("/webrtc/candidates", get(poll_candidates))
        .route("/webrtc/health", get(health))
        .layer(RequestBodyLimitLayer::new(MAX_SIGNALING_BODY))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|origin| origin == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static(PEER_ID_HEADER),
        ])
        .expose_headers([header::HeaderName::from_static(PEER_ID_HEADER)])
}

#[derive(Deserialize)]
struct OfferRequest {
    sdp: String,
    #[serde(rename = "type")]
    typ: String,
}

#[derive(Deserialize)]
struct CandidateRequest {
    candidate: String,
    #[serde(rename = "sdpMid")]
    sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    sdp_mline_index: Option<u16>,
}

fn error_response(
    status: StatusCode,
    kind: &str,
    message: impl Into<String>,
) -> Response {
    (
        status,
        Json(json!({ "error": kind, "message": message.into() })),
    )
        .into_response()
}

fn require_json(headers: &HeaderMap) -> Result<(), Response> {
    let ok = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if ok {
        Ok(())
    } else {
        Err(error_response(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "content type must be application/json",
        ))
    }
}

fn require_peer_id(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get(PEER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "bad_request",
                "missing X-Peer-ID header",
            )
        })
}

/// POST /webrtc/offer
///
/// Create a viewer session from an SDP offer. Returns the answer plus an
/// `X-Peer-ID` header identifying the new session.
async fn offer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_json(&headers) {
        return resp;
    }
    let req: OfferRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "bad_request",
                format!("malformed offer body: {e}"),
            );
        }
    };
    if req.typ != "offer" {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_offer",
            format!("expected type 'offer', got '{}'", req.typ),
        );
    }

    match state.manager.create_peer(&req.sdp).await {
        Ok((peer_id, answer)) => {
            let mut response = (
                StatusCode::OK,
                Json(json!({ "sdp": answer, "type": "answer" })),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&peer_id) {
                response.headers_mut().insert(PEER_ID_HEADER, value);
            }
            response
        }
        Err(e @ PeerManagerError::InvalidOffer(_)) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_offer", e.to_string())
        }
        Err(e @ PeerManagerError::Exhausted { .. }) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "exhausted", e.to_string())
        }
        Err(e) => {
            tracing::error!("Offer handling failed: {e}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "failed to create session",
            )
        }
    }
}

/// POST /webrtc/candidate
///
/// Apply one trickled remote candidate to the session named by `X-Peer-ID`.
async fn candidate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_json(&headers) {
        return resp;
    }
    let peer_id = match require_peer_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let req: CandidateRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "bad_request",
                format!("malformed candidate body: {e}"),
            );
        }
    };

    let init = RTCIceCandidateInit {
        candidate: req.candidate,
        sdp_mid: req.sdp_mid,
        sdp_mline_index: req.sdp_mline_index,
        ..Default::default()
    };

    match state.manager.add_remote_candidate(&peer_id, init).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "success": true, "peer_id": peer_id })),
        )
            .into_response(),
        Err(PeerManagerError::NotFound(_)) => error_response(
            StatusCode::NOT_FOUND,
            "unknown_peer",
            format!("no session with id '{peer_id}'"),
        ),
        Err(e) => error_response(StatusCode::BAD_REQUEST, "bad_request", e.to_string()),
    }
}

/// GET /webrtc/candidates
///
/// Drain the locally generated candidates accumulated since the last poll
/// for the session named by `X-Peer-ID`.
async fn poll_candidates(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let peer_id = match require_peer_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.manager.drain_local_candidates(&peer_id).await {
        Ok(candidates) => (
            StatusCode::OK,
            Json(json!({ "peer_id": peer_id, "candidates": candidates })),
        )
            .into_response(),
        Err(PeerManagerError::NotFound(_)) => error_response(
            StatusCode::NOT_FOUND,
            "unknown_peer",
            format!("no session with id '{peer_id}'"),
        ),
        Err(e) => {
            tracing::error!("Candidate poll failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
        }
    }
}

/// GET /webrtc/health
async fn health(State(state): State<Arc<AppState>>) -> Response {
    let snap = state.stats.snapshot();
    let mut body = json!({
        "status": "ok",
        "peers": state.manager.peer_count().await,
        "connected_peers": state.manager.connected_count(),
        "uptime": format_uptime(state.started_at.elapsed()),
        "dropped_video_frames": snap.dropped_video_frames,
        "dropped_audio_frames": snap.dropped_audio_frames,
        "producer_connects": snap.producer_connects,
    });
    if let Some(meta) = *state.stream_info.borrow() {
        body["stream"] = json!({
            "width": meta.video_width,
            "height": meta.video_height,
            "codec": meta.video_codec,
            "fps": meta.video_fps,
        });
    }
    Json(body).into_response()
}
