//! HTTP client for the coordinator API
//!
//! Used by the simulator and by `HttpDistance`, which plugs a remote
//! `/location/calculate-distance` endpoint into the distance evaluator.

use crate::domain::error::DistanceError;
use crate::domain::types::{Coordinate, ParticipantId, Role, RoleHint, SessionId, UserLocation};
use crate::io::http_api::PARTICIPANT_HEADER;
use crate::services::distance::RemoteDistance;
use crate::services::nearby::NearbyShowResult;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failure talking to the coordinator
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{code} ({status}): {message}")]
    Api { status: u16, code: String, message: String },

    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl ClientError {
    /// API error code, if the server answered with one
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct NearbyReply {
    shows: Vec<NearbyShowResult>,
}

#[derive(Debug, Deserialize)]
struct DistanceReply {
    distance: DistanceValue,
}

#[derive(Debug, Deserialize)]
struct DistanceValue {
    meters: f64,
}

/// Result of a join call
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReply {
    pub user_role: Role,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub already_member: bool,
    #[serde(default)]
    pub distance_meters: Option<f64>,
    #[serde(default)]
    pub queue_position: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaveReply {
    session_ended: bool,
}

/// Thin JSON client over reqwest
#[derive(Clone)]
pub struct ShowApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ShowApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(timeout).http1_only().build()?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(match serde_json::from_slice::<ErrorBody>(&bytes) {
                Ok(body) => ClientError::Api { status: status.as_u16(), code: body.error, message: body.message },
                Err(_) => ClientError::Api {
                    status: status.as_u16(),
                    code: status.canonical_reason().unwrap_or("HTTP_ERROR").to_string(),
                    message: String::from_utf8_lossy(&bytes).into_owned(),
                },
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        participant: Option<&ParticipantId>,
        body: serde_json::Value,
    ) -> Result<T, ClientError> {
        let mut request = self
            .client
            .post(self.url(path))
            .header("Content-Type", "application/json")
            .body(body.to_string());
        if let Some(participant) = participant {
            request = request.header(PARTICIPANT_HEADER, participant.0.as_str());
        }
        let response = request.send().await?;
        debug!(path = %path, status = %response.status(), "api_client_response");
        Self::read(response).await
    }

    /// Active shows within `radius_meters` (server default when `None`)
    pub async fn nearby(
        &self,
        location: &UserLocation,
        radius_meters: Option<f64>,
    ) -> Result<Vec<NearbyShowResult>, ClientError> {
        let body = json!({
            "userLatitude": location.coordinate.latitude,
            "userLongitude": location.coordinate.longitude,
            "radiusMeters": radius_meters,
        });
        let reply: NearbyReply = self.post_json("/live-shows/nearby", None, body).await?;
        Ok(reply.shows)
    }

    pub async fn join(
        &self,
        session_id: &SessionId,
        participant: &ParticipantId,
        location: Option<&UserLocation>,
        role: Option<RoleHint>,
    ) -> Result<JoinReply, ClientError> {
        let mut body = json!({});
        if let Some(location) = location {
            body["location"] = json!({
                "latitude": location.coordinate.latitude,
                "longitude": location.coordinate.longitude,
                "accuracy": location.accuracy_meters,
            });
        }
        if let Some(role) = role {
            body["role"] = json!(role);
        }
        self.post_json(&format!("/live-shows/{session_id}/join"), Some(participant), body).await
    }

    /// Leave a show; returns whether the session ended as a result
    pub async fn leave(&self, session_id: &SessionId, participant: &ParticipantId) -> Result<bool, ClientError> {
        let reply: LeaveReply = self
            .post_json(&format!("/live-shows/{session_id}/leave"), Some(participant), json!({}))
            .await?;
        Ok(reply.session_ended)
    }

    pub async fn calculate_distance(&self, a: Coordinate, b: Coordinate) -> Result<f64, ClientError> {
        let response = self
            .client
            .get(self.url("/location/calculate-distance"))
            .query(&[
                ("lat1", a.latitude),
                ("lng1", a.longitude),
                ("lat2", b.latitude),
                ("lng2", b.longitude),
            ])
            .send()
            .await?;
        let reply: DistanceReply = Self::read(response).await?;
        Ok(reply.distance.meters)
    }
}

/// Remote distance service reached over HTTP
pub struct HttpDistance {
    client: ShowApiClient,
    timeout_ms: u64,
}

impl HttpDistance {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self { client: ShowApiClient::new(base_url, timeout)?, timeout_ms: timeout.as_millis() as u64 })
    }
}

fn distance_error(e: ClientError, timeout_ms: u64) -> DistanceError {
    match e {
        ClientError::Transport(e) if e.is_timeout() => DistanceError::Timeout(timeout_ms),
        ClientError::Transport(e) => DistanceError::Network(e.to_string()),
        ClientError::Api { status, message, .. } => DistanceError::Api { status, message },
        ClientError::Decode(message) => DistanceError::InvalidResponse(message),
    }
}

#[async_trait]
impl RemoteDistance for HttpDistance {
    async fn distance_meters(&self, a: Coordinate, b: Coordinate) -> Result<f64, DistanceError> {
        self.client
            .calculate_distance(a, b)
            .await
            .map_err(|e| distance_error(e, self.timeout_ms))
    }
}

/// True for statuses a caller may retry
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_maps_to_distance_error() {
        let e = ClientError::Api { status: 503, code: "UNAVAILABLE".into(), message: "down".into() };
        assert_eq!(distance_error(e, 500), DistanceError::Api { status: 503, message: "down".into() });

        let e = ClientError::Decode("expected value".into());
        assert_eq!(distance_error(e, 500), DistanceError::InvalidResponse("expected value".into()));
    }

    #[test]
    fn test_error_code() {
        let e = ClientError::Api { status: 403, code: "OUT_OF_RANGE".into(), message: String::new() };
        assert_eq!(e.code(), Some("OUT_OF_RANGE"));
        assert_eq!(ClientError::Decode("x".into()).code(), None);
    }

    #[test]
    fn test_join_reply_parses_server_shape() {
        let reply: JoinReply = serde_json::from_str(
            r#"{"success":true,"userRole":"performer","degraded":false,"alreadyMember":false,"distanceMeters":12.5,"queuePosition":1}"#,
        )
        .unwrap();
        assert_eq!(reply.user_role, Role::Performer);
        assert_eq!(reply.queue_position, Some(1));
        assert_eq!(reply.distance_meters, Some(12.5));
    }

    #[test]
    fn test_retryable_status() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        // Port 1 on loopback is closed in test environments
        let remote = HttpDistance::new("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
        let err = remote
            .distance_meters(Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, DistanceError::Network(_) | DistanceError::Timeout(_)));
    }
}
