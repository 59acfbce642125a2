//! Position source backed by an HTTP positioning endpoint
//!
//! The endpoint answers `GET <url>` with `{"latitude", "longitude", "accuracy"}`.
//! Status codes map onto `LocationError` so `LocationAcquirer` can decide
//! which failures to retry.

use crate::domain::error::LocationError;
use crate::domain::types::{Coordinate, UserLocation};
use crate::io::api_client::is_retryable_status;
use crate::services::location::PositionSource;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct PositionBody {
    latitude: f64,
    longitude: f64,
    #[serde(default, alias = "accuracyMeters")]
    accuracy: Option<f64>,
}

/// Classify a non-success response
fn status_error(status: StatusCode, retry_after: Option<&str>) -> LocationError {
    match status {
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
            LocationError::permission_denied(format!("positioning endpoint refused access ({status})"))
        }
        StatusCode::NOT_FOUND | StatusCode::NOT_IMPLEMENTED => {
            LocationError::unsupported(format!("positioning endpoint unavailable ({status})"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            LocationError::timeout(format!("positioning endpoint timed out ({status})"))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after_ms = retry_after.and_then(|v| v.trim().parse::<u64>().ok()).map(|s| s.saturating_mul(1000));
            LocationError::api("positioning rate limited", true, retry_after_ms)
        }
        s if s.is_server_error() => LocationError::position_unavailable(format!("positioning failed ({status})")),
        s => LocationError::api(format!("positioning rejected request ({s})"), is_retryable_status(s), None),
    }
}

fn transport_error(e: &reqwest::Error) -> LocationError {
    if e.is_timeout() {
        LocationError::timeout(e.to_string())
    } else {
        LocationError::network(e.to_string())
    }
}

fn parse_position(bytes: &[u8]) -> Result<UserLocation, LocationError> {
    let body: PositionBody = serde_json::from_slice(bytes)
        .map_err(|e| LocationError::position_unavailable(format!("unreadable position: {e}")))?;
    let coordinate = Coordinate::new(body.latitude, body.longitude);
    if !coordinate.is_valid() {
        return Err(LocationError::position_unavailable(format!(
            "position out of range: {}, {}",
            body.latitude, body.longitude
        )));
    }
    Ok(UserLocation::new(coordinate, body.accuracy))
}

/// `PositionSource` that polls an HTTP endpoint
#[derive(Clone)]
pub struct HttpPositionSource {
    client: reqwest::Client,
    url: String,
    watch_interval: Duration,
}

impl HttpPositionSource {
    pub fn new(url: &str, request_timeout: Duration, watch_interval: Duration) -> Result<Self, LocationError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .http1_only()
            .build()
            .map_err(|e| LocationError::unsupported(format!("http client unavailable: {e}")))?;
        Ok(Self { client, url: url.to_string(), watch_interval })
    }

    async fn fetch(&self) -> Result<UserLocation, LocationError> {
        let response = self.client.get(&self.url).send().await.map_err(|e| transport_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()).map(str::to_string);
            return Err(status_error(status, retry_after.as_deref()));
        }
        let bytes = response.bytes().await.map_err(|e| transport_error(&e))?;
        parse_position(&bytes)
    }
}

#[async_trait]
impl PositionSource for HttpPositionSource {
    async fn current_position(&self) -> Result<UserLocation, LocationError> {
        self.fetch().await
    }

    fn watch_position(&self) -> Result<mpsc::Receiver<Result<UserLocation, LocationError>>, LocationError> {
        let (tx, rx) = mpsc::channel(16);
        let source = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(source.watch_interval);
            loop {
                ticker.tick().await;
                let update = source.fetch().await;
                if let Err(e) = &update {
                    warn!(url = %source.url, code = e.code(), "position_poll_failed");
                }
                if tx.send(update).await.is_err() {
                    debug!(url = %source.url, "position_watch_closed");
                    return;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_error(StatusCode::FORBIDDEN, None).code(), "PERMISSION_DENIED");
        assert_eq!(status_error(StatusCode::NOT_IMPLEMENTED, None).code(), "UNSUPPORTED");
        assert_eq!(status_error(StatusCode::SERVICE_UNAVAILABLE, None).code(), "POSITION_UNAVAILABLE");
        assert_eq!(status_error(StatusCode::GATEWAY_TIMEOUT, None).code(), "TIMEOUT");
    }

    #[test]
    fn test_rate_limit_is_retryable_with_hint() {
        let e = status_error(StatusCode::TOO_MANY_REQUESTS, Some("3"));
        assert!(e.retryable());
        assert_eq!(e.retry_after_ms(), Some(3000));

        let e = status_error(StatusCode::TOO_MANY_REQUESTS, Some("soon"));
        assert!(e.retryable());
        assert_eq!(e.retry_after_ms(), None);
    }

    #[test]
    fn test_huge_retry_after_saturates() {
        let e = status_error(StatusCode::TOO_MANY_REQUESTS, Some("18446744073709551615"));
        assert!(e.retryable());
        assert_eq!(e.retry_after_ms(), Some(u64::MAX));

        let e = status_error(StatusCode::TOO_MANY_REQUESTS, Some(" 86400 "));
        assert_eq!(e.retry_after_ms(), Some(86_400_000));
    }

    #[test]
    fn test_client_error_is_terminal() {
        let e = status_error(StatusCode::BAD_REQUEST, None);
        assert!(!e.retryable());
        assert!(!status_error(StatusCode::FORBIDDEN, None).retryable());
    }

    #[test]
    fn test_parse_position() {
        let location = parse_position(br#"{"latitude":64.1466,"longitude":-21.9426,"accuracy":8.0}"#).unwrap();
        assert_eq!(location.coordinate, Coordinate::new(64.1466, -21.9426));
        assert_eq!(location.accuracy_meters, Some(8.0));

        assert!(parse_position(br#"{"latitude":95.0,"longitude":0.0}"#).is_err());
        assert!(parse_position(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let source =
            HttpPositionSource::new("http://127.0.0.1:1/position", Duration::from_millis(500), Duration::from_secs(1))
                .unwrap();
        let err = source.current_position().await.unwrap_err();
        assert!(err.retryable());
    }
}
