//! Session admission - proximity gate and role assignment
//!
//! The distance to the venue is computed before the session lock is taken
//! (it may involve a network round-trip); every decision that depends on
//! session state is then made again inside the lock.

use crate::domain::error::AdmissionError;
use crate::domain::session::{Session, SessionStateDelta};
use crate::domain::types::{ParticipantId, Role, RoleHint, SessionId, UserLocation};
use crate::services::distance::DistanceEvaluator;
use crate::services::registry::{Applied, SessionRegistry};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Result of an accepted join
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinOutcome {
    pub role: Role,
    /// Admitted without a proximity check
    pub degraded: bool,
    /// The participant was already a member; nothing changed
    pub already_member: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<f64>,
    /// 1-based queue position for performers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
}

impl JoinOutcome {
    fn from_session(session: &Session, participant_id: &ParticipantId, role: Role) -> Self {
        Self {
            role,
            degraded: false,
            already_member: false,
            distance_meters: None,
            queue_position: session.queue_position(participant_id),
        }
    }
}

pub struct SessionAdmissionController {
    registry: Arc<SessionRegistry>,
    distance: Arc<DistanceEvaluator>,
}

impl SessionAdmissionController {
    pub fn new(registry: Arc<SessionRegistry>, distance: Arc<DistanceEvaluator>) -> Self {
        Self { registry, distance }
    }

    pub async fn join(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        location: Option<&UserLocation>,
        role_hint: Option<RoleHint>,
    ) -> Result<JoinOutcome, AdmissionError> {
        let started = Instant::now();
        let result = self.admit(session_id, participant_id, location, role_hint).await;
        let latency_us = started.elapsed().as_micros() as u64;
        let metrics = self.registry.metrics();

        match &result {
            Ok(outcome) => {
                metrics.record_join(outcome.role, outcome.degraded, outcome.already_member, latency_us);
                info!(
                    session_id = %session_id,
                    participant_id = %participant_id,
                    role = %outcome.role,
                    degraded = %outcome.degraded,
                    already_member = %outcome.already_member,
                    distance_m = ?outcome.distance_meters,
                    "join_accepted"
                );
            }
            Err(e) => {
                metrics.record_join_rejected(e, latency_us);
                info!(
                    session_id = %session_id,
                    participant_id = %participant_id,
                    code = %e.code(),
                    reason = %e,
                    "join_rejected"
                );
            }
        }
        result
    }

    async fn admit(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        location: Option<&UserLocation>,
        role_hint: Option<RoleHint>,
    ) -> Result<JoinOutcome, AdmissionError> {
        let handle = self
            .registry
            .handle(session_id)
            .ok_or_else(|| AdmissionError::SessionNotFound(session_id.clone()))?;

        let (venue_id, radius_meters) = {
            let session = handle.lock();
            if !session.is_active() {
                return Err(AdmissionError::SessionInactive(session_id.clone()));
            }
            if let Some(role) = session.role_of(participant_id) {
                return Ok(JoinOutcome {
                    already_member: true,
                    ..JoinOutcome::from_session(&session, participant_id, role)
                });
            }
            (session.venue_id().clone(), session.radius_meters())
        };

        let distance_meters = match location {
            Some(location) => {
                let origin = location.coordinate;
                if !origin.is_valid() {
                    return Err(AdmissionError::InvalidLocation {
                        latitude: origin.latitude,
                        longitude: origin.longitude,
                    });
                }
                let venue = self.registry.get_venue(&venue_id).ok_or_else(|| {
                    AdmissionError::InvariantViolation(format!("venue {venue_id} is not registered"))
                })?;
                let meters = self.distance.distance_meters(origin, venue.coordinate).await;
                if meters > radius_meters {
                    return Err(AdmissionError::OutOfRange { distance_meters: meters, radius_meters });
                }
                Some(meters)
            }
            None => None,
        };

        let mut session = handle.lock();
        if !session.is_active() {
            return Err(AdmissionError::SessionInactive(session_id.clone()));
        }
        // Lost a race with our own concurrent join
        if let Some(role) = session.role_of(participant_id) {
            return Ok(JoinOutcome {
                already_member: true,
                distance_meters,
                ..JoinOutcome::from_session(&session, participant_id, role)
            });
        }

        let role = assign_role(&session, participant_id, role_hint);
        let pid = participant_id.clone();
        let mut outcome = self.registry.apply(
            &mut session,
            "join",
            AdmissionError::InvariantViolation,
            |s| {
                s.add_participant(pid.clone());
                let joined = SessionStateDelta::ParticipantJoined { participant_id: pid.clone(), role };
                match role {
                    Role::Host => {
                        let newly_assigned = s
                            .assign_host(&pid)
                            .map_err(|e| AdmissionError::InvariantViolation(e.to_string()))?;
                        let mut applied = Applied::new(JoinOutcome::from_session(s, &pid, role)).with(joined);
                        if newly_assigned {
                            applied = applied.with(SessionStateDelta::HostAssigned { participant_id: pid.clone() });
                        }
                        Ok(applied)
                    }
                    Role::Performer => {
                        s.enqueue(&pid).map_err(|e| AdmissionError::InvariantViolation(e.to_string()))?;
                        Ok(Applied::new(JoinOutcome::from_session(s, &pid, role))
                            .with(joined)
                            .with(SessionStateDelta::QueueChanged { queue: s.queue_snapshot() }))
                    }
                }
            },
        )?;

        outcome.degraded = distance_meters.is_none();
        outcome.distance_meters = distance_meters;
        Ok(outcome)
    }
}

/// Pick the role for a participant who is not yet a member
fn assign_role(session: &Session, participant_id: &ParticipantId, hint: Option<RoleHint>) -> Role {
    // Pre-configured host arriving
    if session.is_host(participant_id) {
        return Role::Host;
    }
    if !session.host_slot_open() {
        return Role::Performer;
    }
    match hint {
        Some(RoleHint::Host) => Role::Host,
        Some(RoleHint::Performer) => Role::Performer,
        None if session.participants().is_empty() => Role::Host,
        None => Role::Performer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Coordinate, Venue, VenueId};
    use crate::infra::metrics::Metrics;
    use crate::io::broadcast_channel::RecordingBroadcaster;
    use crate::services::distance::EARTH_RADIUS_METERS;
    use chrono::Utc;

    const VENUE: Coordinate = Coordinate::new(64.1503, -21.9326);

    struct Fixture {
        registry: Arc<SessionRegistry>,
        recorder: Arc<RecordingBroadcaster>,
        controller: SessionAdmissionController,
        sid: SessionId,
    }

    fn fixture_with(session: Session) -> Fixture {
        let recorder = Arc::new(RecordingBroadcaster::new());
        let registry = Arc::new(SessionRegistry::new(recorder.clone(), Arc::new(Metrics::new())));
        registry.add_venue(Venue {
            id: VenueId::from("harpa"),
            name: "Harpa".to_string(),
            address: "Austurbakki 2".to_string(),
            coordinate: VENUE,
        });
        let sid = session.id().clone();
        registry.open_session(session);
        let controller =
            SessionAdmissionController::new(registry.clone(), Arc::new(DistanceEvaluator::local()));
        Fixture { registry, recorder, controller, sid }
    }

    fn fixture() -> Fixture {
        fixture_with(Session::new(SessionId::from("show-1"), "Open mic", VenueId::from("harpa"), Utc::now(), 30.0))
    }

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::from(s)
    }

    fn at(meters_north: f64) -> UserLocation {
        let d_lat = (meters_north / EARTH_RADIUS_METERS).to_degrees();
        UserLocation::new(Coordinate::new(VENUE.latitude + d_lat, VENUE.longitude), Some(4.0))
    }

    #[tokio::test]
    async fn test_first_join_hosts_second_queues() {
        let f = fixture();
        let host = f.controller.join(&f.sid, &pid("a"), Some(&at(5.0)), None).await.unwrap();
        assert_eq!(host.role, Role::Host);
        assert!(!host.degraded);
        assert_eq!(host.queue_position, None);

        let performer = f.controller.join(&f.sid, &pid("b"), Some(&at(5.0)), None).await.unwrap();
        assert_eq!(performer.role, Role::Performer);
        assert_eq!(performer.queue_position, Some(1));

        let third = f.controller.join(&f.sid, &pid("c"), None, None).await.unwrap();
        assert_eq!(third.queue_position, Some(2));

        let session = f.registry.snapshot(&f.sid).unwrap();
        assert_eq!(session.host_id(), Some(&pid("a")));
        assert_eq!(session.queue_snapshot(), vec![pid("b"), pid("c")]);
        assert!(!session.is_queued(&pid("a")));
    }

    #[tokio::test]
    async fn test_out_of_range_rejected_degraded_accepted() {
        let f = fixture();
        let err = f.controller.join(&f.sid, &pid("a"), Some(&at(100.0)), None).await.unwrap_err();
        match err {
            AdmissionError::OutOfRange { distance_meters, radius_meters } => {
                assert!((distance_meters - 100.0).abs() < 0.5);
                assert_eq!(radius_meters, 30.0);
            }
            other => panic!("expected OutOfRange, got {other:?}"),
        }
        assert!(f.registry.snapshot(&f.sid).unwrap().participants().is_empty());

        let outcome = f.controller.join(&f.sid, &pid("a"), None, None).await.unwrap();
        assert!(outcome.degraded);
        assert_eq!(outcome.distance_meters, None);
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let f = fixture();
        f.controller.join(&f.sid, &pid("a"), None, None).await.unwrap();
        f.controller.join(&f.sid, &pid("b"), None, None).await.unwrap();
        let before = f.registry.snapshot(&f.sid).unwrap();

        let again = f.controller.join(&f.sid, &pid("b"), None, Some(RoleHint::Host)).await.unwrap();
        assert!(again.already_member);
        assert_eq!(again.role, Role::Performer);

        let after = f.registry.snapshot(&f.sid).unwrap();
        assert_eq!(after.participants(), before.participants());
        assert_eq!(after.queue_len(), before.queue_len());
        assert_eq!(after.version(), before.version());
    }

    #[tokio::test]
    async fn test_unknown_and_inactive_sessions() {
        let f = fixture();
        assert_eq!(
            f.controller.join(&SessionId::from("nope"), &pid("a"), None, None).await,
            Err(AdmissionError::SessionNotFound(SessionId::from("nope")))
        );

        f.registry.end_session(&f.sid, "cancelled").unwrap();
        assert_eq!(
            f.controller.join(&f.sid, &pid("a"), None, None).await,
            Err(AdmissionError::SessionInactive(f.sid.clone()))
        );
    }

    #[tokio::test]
    async fn test_invalid_location_rejected() {
        let f = fixture();
        let bad = UserLocation::new(Coordinate::new(f64::NAN, 0.0), None);
        assert!(matches!(
            f.controller.join(&f.sid, &pid("a"), Some(&bad), None).await,
            Err(AdmissionError::InvalidLocation { .. })
        ));
    }

    #[tokio::test]
    async fn test_role_hints() {
        // Performer hint on an empty session leaves the host slot open
        let f = fixture();
        let first = f.controller.join(&f.sid, &pid("a"), None, Some(RoleHint::Performer)).await.unwrap();
        assert_eq!(first.role, Role::Performer);

        // Host hint claims the open slot later
        let second = f.controller.join(&f.sid, &pid("b"), None, Some(RoleHint::Host)).await.unwrap();
        assert_eq!(second.role, Role::Host);

        // Slot taken; hint ignored
        let third = f.controller.join(&f.sid, &pid("c"), None, Some(RoleHint::Host)).await.unwrap();
        assert_eq!(third.role, Role::Performer);

        let session = f.registry.snapshot(&f.sid).unwrap();
        assert_eq!(session.host_id(), Some(&pid("b")));
        assert_eq!(session.queue_snapshot(), vec![pid("a"), pid("c")]);
    }

    #[tokio::test]
    async fn test_preconfigured_host() {
        let f = fixture_with(
            Session::new(SessionId::from("show-2"), "Gala", VenueId::from("harpa"), Utc::now(), 30.0)
                .with_host(pid("dj")),
        );
        let early = f.controller.join(&f.sid, &pid("fan"), None, None).await.unwrap();
        assert_eq!(early.role, Role::Performer);

        let host = f.controller.join(&f.sid, &pid("dj"), None, None).await.unwrap();
        assert_eq!(host.role, Role::Host);
        let session = f.registry.snapshot(&f.sid).unwrap();
        assert!(session.is_participant(&pid("dj")));
        assert!(!session.is_queued(&pid("dj")));
    }

    #[tokio::test]
    async fn test_session_radius_overrides_default() {
        let f = fixture_with(
            Session::new(SessionId::from("arena"), "Arena", VenueId::from("harpa"), Utc::now(), 150.0),
        );
        let outcome = f.controller.join(&f.sid, &pid("a"), Some(&at(100.0)), None).await.unwrap();
        assert_eq!(outcome.role, Role::Host);
    }

    #[tokio::test]
    async fn test_join_broadcasts_deltas_in_order() {
        let f = fixture();
        f.controller.join(&f.sid, &pid("a"), None, None).await.unwrap();
        f.controller.join(&f.sid, &pid("b"), None, None).await.unwrap();

        let kinds: Vec<&str> = f.recorder.envelopes().iter().map(|e| e.delta.kind()).collect();
        assert_eq!(
            kinds,
            vec!["participant_joined", "host_assigned", "participant_joined", "queue_changed"]
        );
        let seqs: Vec<u64> = f.recorder.envelopes().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_single_host() {
        let f = fixture();
        let controller = Arc::new(f.controller);
        let mut tasks = Vec::new();
        for i in 0..32 {
            let controller = controller.clone();
            let sid = f.sid.clone();
            tasks.push(tokio::spawn(async move {
                controller.join(&sid, &pid(&format!("p{i}")), Some(&at(3.0)), None).await
            }));
        }

        let mut hosts = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().role == Role::Host {
                hosts += 1;
            }
        }
        assert_eq!(hosts, 1);

        let session = f.registry.snapshot(&f.sid).unwrap();
        assert_eq!(session.participants().len(), 32);
        assert_eq!(session.queue_len(), 31);
        assert!(session.validate().is_ok());
        let seqs: Vec<u64> = f.recorder.envelopes().iter().map(|e| e.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }
}
