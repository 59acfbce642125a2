//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `location` - Device location acquisition with retry/backoff
//! - `distance` - Great-circle distance with remote-first evaluation
//! - `registry` - Session store, show lifecycle and per-session locking
//! - `nearby` - Nearby active show discovery
//! - `admission` - Proximity-gated join and role assignment
//! - `queue` - Performance queue, stage and chat mutations

pub mod admission;
pub mod distance;
pub mod location;
pub mod nearby;
pub mod queue;
pub mod registry;

// Re-export commonly used types
pub use admission::{JoinOutcome, SessionAdmissionController};
pub use distance::{haversine_meters, DistanceEvaluator, RemoteDistance};
pub use location::{LocationAcquirer, PositionSource, RetryPolicy};
pub use nearby::{NearbyShowFinder, NearbyShowResult};
pub use queue::ParticipantQueueManager;
pub use registry::SessionRegistry;
