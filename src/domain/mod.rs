//! Domain models - core value types and the live show session aggregate
//!
//! This module contains the canonical data types used throughout the system:
//! - `Coordinate`, `UserLocation`, `Venue` - geospatial values
//! - `Session` - the live show aggregate (participants, queue, host, chat)
//! - `SessionStateDelta` - state changes emitted to the broadcaster
//! - `error` - typed error taxonomy

pub mod error;
pub mod session;
pub mod types;

// Re-export commonly used types at module level
pub use error::{AdmissionError, DistanceError, LocationError, NearbyError, SessionError};
pub use session::{ChatMessage, LeaveEffect, Session, SessionStateDelta, SessionSummary};
pub use types::{Coordinate, ParticipantId, Role, RoleHint, SessionId, UserLocation, Venue, VenueId};
