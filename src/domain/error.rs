//! Typed error taxonomy for location, distance, admission and queue operations
//!
//! Every error carries a stable machine code (`code()`) used on the wire;
//! the `Display` text is the human-facing message.

use crate::domain::types::{ParticipantId, SessionId};
use thiserror::Error;

/// Failure to acquire the device position
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocationError {
    #[error("location permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("position unavailable: {message}")]
    PositionUnavailable { message: String },

    #[error("location request timed out: {message}")]
    Timeout { message: String },

    #[error("geolocation is not supported: {message}")]
    Unsupported { message: String },

    #[error("network error while acquiring location: {message}")]
    NetworkError { message: String },

    #[error("location service error: {message}")]
    ApiError { message: String, retryable: bool, retry_after_ms: Option<u64> },

    #[error("failed to acquire location after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<LocationError> },
}

impl LocationError {
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied { message: message.into() }
    }

    pub fn position_unavailable(message: impl Into<String>) -> Self {
        Self::PositionUnavailable { message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout { message: message.into() }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported { message: message.into() }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    pub fn api(message: impl Into<String>, retryable: bool, retry_after_ms: Option<u64>) -> Self {
        Self::ApiError { message: message.into(), retryable, retry_after_ms }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::PositionUnavailable { .. } => "POSITION_UNAVAILABLE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Unsupported { .. } => "UNSUPPORTED",
            Self::NetworkError { .. } => "NETWORK_ERROR",
            Self::ApiError { .. } => "API_ERROR",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
        }
    }

    /// Whether the acquirer may schedule another attempt
    pub fn retryable(&self) -> bool {
        match self {
            Self::PositionUnavailable { .. } | Self::Timeout { .. } | Self::NetworkError { .. } => {
                true
            }
            Self::ApiError { retryable, .. } => *retryable,
            Self::PermissionDenied { .. } | Self::Unsupported { .. } | Self::RetryExhausted { .. } => {
                false
            }
        }
    }

    /// Minimum wait requested by the location service, if any
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::ApiError { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// Actionable hint for the end user
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => {
                "Allow location access for this app in your device settings, then try again."
            }
            Self::Unsupported { .. } => {
                "This device cannot report its location. You can still join a show without proximity verification."
            }
            Self::PositionUnavailable { .. } | Self::Timeout { .. } => {
                "Move to an area with better GPS reception and try again."
            }
            Self::NetworkError { .. } | Self::ApiError { .. } => {
                "Check your network connection and try again."
            }
            Self::RetryExhausted { .. } => {
                "Your location could not be determined. Try again in a moment."
            }
        }
    }
}

/// Failure of the authoritative (remote) distance computation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DistanceError {
    #[error("distance request failed: {0}")]
    Network(String),

    #[error("distance service returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("distance request timed out after {0} ms")]
    Timeout(u64),

    #[error("invalid distance response: {0}")]
    InvalidResponse(String),
}

/// Failure to list nearby shows
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NearbyError {
    #[error("user location is required to search for nearby shows")]
    LocationUnavailable,

    #[error("invalid coordinate ({latitude}, {longitude})")]
    InvalidLocation { latitude: f64, longitude: f64 },

    #[error("invalid search radius {0}")]
    InvalidRadius(f64),
}

impl NearbyError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::LocationUnavailable => "LOCATION_UNAVAILABLE",
            Self::InvalidLocation { .. } => "INVALID_LOCATION",
            Self::InvalidRadius(_) => "INVALID_RADIUS",
        }
    }
}

/// Rejection of a join request at the admission gate
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdmissionError {
    #[error("live show {0} not found")]
    SessionNotFound(SessionId),

    #[error("live show {0} is not active")]
    SessionInactive(SessionId),

    #[error("you are {distance_meters:.0} m from the venue; you must be within {radius_meters:.0} m to join")]
    OutOfRange { distance_meters: f64, radius_meters: f64 },

    #[error("invalid coordinate ({latitude}, {longitude})")]
    InvalidLocation { latitude: f64, longitude: f64 },

    #[error("join rejected: {0}")]
    InvariantViolation(String),
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionInactive(_) => "SESSION_INACTIVE",
            Self::OutOfRange { .. } => "OUT_OF_RANGE",
            Self::InvalidLocation { .. } => "INVALID_LOCATION",
            Self::InvariantViolation(_) => "INVARIANT_VIOLATION",
        }
    }
}

/// Failure of a queue / membership mutation on an admitted session
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("live show {0} not found")]
    SessionNotFound(SessionId),

    #[error("live show {0} is not active")]
    SessionInactive(SessionId),

    #[error("{0} is not a participant of this live show")]
    NotAParticipant(ParticipantId),

    #[error("only the host can do this")]
    NotHost,

    #[error("chat message must not be empty")]
    EmptyMessage,

    #[error("operation rejected: {0}")]
    InvariantViolation(String),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionInactive(_) => "SESSION_INACTIVE",
            Self::NotAParticipant(_) => "NOT_A_PARTICIPANT",
            Self::NotHost => "NOT_HOST",
            Self::EmptyMessage => "EMPTY_MESSAGE",
            Self::InvariantViolation(_) => "INVARIANT_VIOLATION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!LocationError::permission_denied("denied").retryable());
        assert!(!LocationError::unsupported("no gps").retryable());
        assert!(LocationError::position_unavailable("no fix").retryable());
        assert!(LocationError::timeout("slow").retryable());
        assert!(LocationError::api("rate limited", true, Some(500)).retryable());
        assert!(!LocationError::api("bad key", false, None).retryable());
    }

    #[test]
    fn test_retry_exhausted_message_embeds_attempts_and_cause() {
        let err = LocationError::RetryExhausted {
            attempts: 3,
            last: Box::new(LocationError::timeout("no response in 10s")),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("no response in 10s"));
        assert_eq!(err.code(), "RETRY_EXHAUSTED");
        assert!(!err.retryable());
    }

    #[test]
    fn test_out_of_range_message() {
        let err = AdmissionError::OutOfRange { distance_meters: 100.4, radius_meters: 30.0 };
        assert_eq!(err.to_string(), "you are 100 m from the venue; you must be within 30 m to join");
        assert_eq!(err.code(), "OUT_OF_RANGE");
    }
}
