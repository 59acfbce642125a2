//! HTTP API for clients
//!
//! JSON over hyper http1. The caller is identified by the
//! `x-participant-id` header; authentication happens upstream.
//!
//! Routes:
//! - `POST /live-shows/nearby`
//! - `GET  /location/calculate-distance?lat1&lng1&lat2&lng2`
//! - `GET  /live-shows/{id}`
//! - `POST /live-shows/{id}/join|leave|enqueue|chat|set-current-performer|next-performer`
//! - `GET  /metrics`, `GET /health`

use crate::domain::error::{AdmissionError, NearbyError, SessionError};
use crate::domain::types::{Coordinate, ParticipantId, Role, RoleHint, SessionId, UserLocation};
use crate::infra::metrics::Metrics;
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::admission::SessionAdmissionController;
use crate::services::distance::DistanceEvaluator;
use crate::services::nearby::NearbyShowFinder;
use crate::services::queue::ParticipantQueueManager;
use crate::services::registry::SessionRegistry;
use anyhow::Context;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::body::Body;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const PARTICIPANT_HEADER: &str = "x-participant-id";

/// Largest request body read into memory
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Services shared by all connections
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub distance: Arc<DistanceEvaluator>,
    pub nearby: NearbyShowFinder,
    pub admission: SessionAdmissionController,
    pub queue: ParticipantQueueManager,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        distance: Arc<DistanceEvaluator>,
        nearby_radius_meters: f64,
    ) -> Self {
        Self {
            nearby: NearbyShowFinder::new(registry.clone(), distance.clone(), nearby_radius_meters),
            admission: SessionAdmissionController::new(registry.clone(), distance.clone()),
            queue: ParticipantQueueManager::new(registry.clone()),
            metrics: registry.metrics().clone(),
            registry,
            distance,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NearbyBody {
    user_latitude: Option<f64>,
    user_longitude: Option<f64>,
    radius_meters: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationBody {
    latitude: f64,
    longitude: f64,
    #[serde(default, alias = "accuracyMeters")]
    accuracy: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinBody {
    avatar_id: Option<String>,
    microphone_id: Option<String>,
    location: Option<LocationBody>,
    role: Option<RoleHint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PerformerBody {
    participant_id: ParticipantId,
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinResponse {
    success: bool,
    user_role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
    degraded: bool,
    already_member: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    distance_meters: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue_position: Option<usize>,
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let (status, bytes) = match serde_json::to_vec(body) {
        Ok(bytes) => (status, bytes),
        Err(e) => {
            error!(error = %e, "http_response_serialize_failed");
            (StatusCode::INTERNAL_SERVER_ERROR, br#"{"success":false,"error":"INTERNAL"}"#.to_vec())
        }
    };
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(bytes)))
        .expect("static response should not fail")
}

fn error_response(status: StatusCode, code: &str, message: impl std::fmt::Display) -> Response<Full<Bytes>> {
    json_response(status, &json!({ "success": false, "error": code, "message": message.to_string() }))
}

fn bad_request(message: impl std::fmt::Display) -> Response<Full<Bytes>> {
    error_response(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
}

fn nearby_error(e: NearbyError) -> Response<Full<Bytes>> {
    error_response(StatusCode::BAD_REQUEST, e.code(), e)
}

fn admission_error(e: AdmissionError) -> Response<Full<Bytes>> {
    let status = match &e {
        AdmissionError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        AdmissionError::SessionInactive(_) => StatusCode::CONFLICT,
        AdmissionError::OutOfRange { .. } => StatusCode::FORBIDDEN,
        AdmissionError::InvalidLocation { .. } => StatusCode::BAD_REQUEST,
        AdmissionError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.code(), e)
}

fn session_error(e: SessionError) -> Response<Full<Bytes>> {
    let status = match &e {
        SessionError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        SessionError::SessionInactive(_) | SessionError::NotAParticipant(_) => StatusCode::CONFLICT,
        SessionError::NotHost => StatusCode::FORBIDDEN,
        SessionError::EmptyMessage => StatusCode::BAD_REQUEST,
        SessionError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.code(), e)
}

/// Parse a JSON body; an empty body reads as `{}`
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response<Full<Bytes>>> {
    let raw: &[u8] = if body.iter().all(u8::is_ascii_whitespace) { b"{}" } else { &body[..] };
    serde_json::from_slice(raw).map_err(|e| bad_request(format!("invalid request body: {e}")))
}

/// Look up one key in a query string
fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

fn query_f64(query: &str, key: &str) -> Result<f64, Response<Full<Bytes>>> {
    let raw = query_param(query, key).ok_or_else(|| bad_request(format!("missing query parameter {key}")))?;
    raw.parse::<f64>()
        .map_err(|_| bad_request(format!("query parameter {key} is not a number: {raw}")))
}

fn require_participant(participant: Option<&ParticipantId>) -> Result<&ParticipantId, Response<Full<Bytes>>> {
    participant.ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "MISSING_PARTICIPANT_ID",
            format!("header {PARTICIPANT_HEADER} is required"),
        )
    })
}

/// Request after the body has been read
pub struct ApiRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub participant: Option<ParticipantId>,
    pub body: Bytes,
}

/// Dispatch one request
pub async fn route(state: &AppState, req: ApiRequest<'_>) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = req.path.trim_matches('/').split('/').collect();
    let result = match (req.method, segments.as_slice()) {
        (&Method::GET, ["health"]) => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        (&Method::GET, ["metrics"]) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(format_prometheus_metrics(&state.metrics))))
            .expect("static response should not fail")),
        (&Method::GET, ["location", "calculate-distance"]) => {
            calculate_distance(state, req.query.unwrap_or("")).await
        }
        (&Method::POST, ["live-shows", "nearby"]) => nearby(state, &req.body).await,
        (&Method::GET, ["live-shows", id]) => get_show(state, &SessionId::from(*id)),
        (&Method::POST, ["live-shows", id, action]) => {
            let sid = SessionId::from(*id);
            let caller = req.participant.as_ref();
            match *action {
                "join" => join(state, &sid, caller, &req.body).await,
                "leave" => leave(state, &sid, caller),
                "enqueue" => enqueue(state, &sid, caller),
                "chat" => chat(state, &sid, caller, &req.body),
                "set-current-performer" => set_current_performer(state, &sid, caller, &req.body),
                "next-performer" => next_performer(state, &sid, caller),
                _ => Err(not_found()),
            }
        }
        (&Method::OPTIONS, _) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header("Access-Control-Allow-Headers", format!("Content-Type, {PARTICIPANT_HEADER}"))
            .body(Full::new(Bytes::new()))
            .expect("static response should not fail")),
        _ => Err(not_found()),
    };
    result.unwrap_or_else(|response| response)
}

fn not_found() -> Response<Full<Bytes>> {
    error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "no such route")
}

type Handled = Result<Response<Full<Bytes>>, Response<Full<Bytes>>>;

async fn calculate_distance(state: &AppState, query: &str) -> Handled {
    let a = Coordinate::new(query_f64(query, "lat1")?, query_f64(query, "lng1")?);
    let b = Coordinate::new(query_f64(query, "lat2")?, query_f64(query, "lng2")?);
    if !a.is_valid() || !b.is_valid() {
        return Err(bad_request("coordinates out of range"));
    }
    let meters = state.distance.distance_meters(a, b).await;
    Ok(json_response(StatusCode::OK, &json!({ "distance": { "meters": meters } })))
}

async fn nearby(state: &AppState, body: &Bytes) -> Handled {
    let body: NearbyBody = parse_body(body)?;
    let location = match (body.user_latitude, body.user_longitude) {
        (Some(latitude), Some(longitude)) => Some(UserLocation::new(Coordinate::new(latitude, longitude), None)),
        _ => None,
    };
    let shows = state
        .nearby
        .find_nearby(location.as_ref(), body.radius_meters)
        .await
        .map_err(nearby_error)?;
    Ok(json_response(StatusCode::OK, &json!({ "success": true, "shows": shows })))
}

fn get_show(state: &AppState, sid: &SessionId) -> Handled {
    let session = state
        .registry
        .snapshot(sid)
        .ok_or_else(|| session_error(SessionError::SessionNotFound(sid.clone())))?;
    Ok(json_response(StatusCode::OK, &json!({ "success": true, "show": session })))
}

async fn join(state: &AppState, sid: &SessionId, caller: Option<&ParticipantId>, body: &Bytes) -> Handled {
    let participant = require_participant(caller)?;
    let body: JoinBody = parse_body(body)?;
    debug!(
        session_id = %sid,
        participant_id = %participant,
        avatar_id = ?body.avatar_id,
        microphone_id = ?body.microphone_id,
        "join_requested"
    );
    let location = body
        .location
        .map(|l| UserLocation::new(Coordinate::new(l.latitude, l.longitude), l.accuracy));

    let outcome = state
        .admission
        .join(sid, participant, location.as_ref(), body.role)
        .await
        .map_err(admission_error)?;

    let message = if outcome.already_member {
        Some("already joined")
    } else if outcome.degraded {
        Some("joined without location verification")
    } else {
        None
    };
    Ok(json_response(
        StatusCode::OK,
        &JoinResponse {
            success: true,
            user_role: outcome.role,
            message,
            degraded: outcome.degraded,
            already_member: outcome.already_member,
            distance_meters: outcome.distance_meters,
            queue_position: outcome.queue_position,
        },
    ))
}

fn leave(state: &AppState, sid: &SessionId, caller: Option<&ParticipantId>) -> Handled {
    let participant = require_participant(caller)?;
    let effect = state.queue.leave(sid, participant).map_err(session_error)?;
    Ok(json_response(
        StatusCode::OK,
        &json!({ "success": true, "sessionEnded": effect.ended_session }),
    ))
}

fn enqueue(state: &AppState, sid: &SessionId, caller: Option<&ParticipantId>) -> Handled {
    let participant = require_participant(caller)?;
    let added = state.queue.enqueue(sid, participant).map_err(session_error)?;
    let position = state.registry.snapshot(sid).and_then(|s| s.queue_position(participant));
    Ok(json_response(
        StatusCode::OK,
        &json!({ "success": true, "queued": added, "queuePosition": position }),
    ))
}

fn chat(state: &AppState, sid: &SessionId, caller: Option<&ParticipantId>, body: &Bytes) -> Handled {
    let participant = require_participant(caller)?;
    let body: ChatBody = parse_body(body)?;
    let message = state.queue.append_chat(sid, participant, &body.text).map_err(session_error)?;
    Ok(json_response(StatusCode::OK, &json!({ "success": true, "message": message })))
}

fn set_current_performer(
    state: &AppState,
    sid: &SessionId,
    caller: Option<&ParticipantId>,
    body: &Bytes,
) -> Handled {
    let host = require_participant(caller)?;
    let body: PerformerBody = parse_body(body)?;
    let previous = state
        .queue
        .host_set_current_performer(sid, host, &body.participant_id)
        .map_err(session_error)?;
    Ok(json_response(
        StatusCode::OK,
        &json!({
            "success": true,
            "currentPerformerId": body.participant_id,
            "previousPerformerId": previous,
        }),
    ))
}

fn next_performer(state: &AppState, sid: &SessionId, caller: Option<&ParticipantId>) -> Handled {
    let host = require_participant(caller)?;
    let current = state.queue.advance(sid, host).map_err(session_error)?;
    Ok(json_response(StatusCode::OK, &json!({ "success": true, "currentPerformerId": current })))
}

/// Handle HTTP requests
async fn handle_request<B>(req: Request<B>, state: Arc<AppState>) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    state.metrics.record_http_request();
    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            debug!(method = %parts.method, path = %parts.uri.path(), "http_body_too_large");
            return Ok(error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                format!("request body exceeds {MAX_BODY_BYTES} bytes"),
            ));
        }
        Err(e) => return Ok(bad_request(format!("failed to read request body: {e}"))),
    };
    let participant = parts
        .headers
        .get(PARTICIPANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ParticipantId::from);

    let response = route(
        &state,
        ApiRequest {
            method: &parts.method,
            path: parts.uri.path(),
            query: parts.uri.query(),
            participant,
            body,
        },
    )
    .await;
    debug!(method = %parts.method, path = %parts.uri.path(), status = %response.status().as_u16(), "http_request");
    Ok(response)
}

/// Bind and serve the API until shutdown
pub async fn start_api_server(
    bind_address: &str,
    port: u16,
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind((bind_address, port))
        .await
        .with_context(|| format!("Failed to bind API server to {bind_address}:{port}"))?;
    serve(listener, state, shutdown).await
}

/// Serve the API on an already bound listener until shutdown
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "api_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "api_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("api_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
