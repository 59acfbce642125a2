//! Session registry - in-memory show lifecycle and per-session locking
//!
//! Each session lives behind its own mutex; the outer map lock is only held
//! long enough to clone a handle, so operations on different sessions never
//! contend. Every mutation runs through [`SessionRegistry::apply`], which
//! re-validates the session invariants, rolls back on violation, and stamps
//! and publishes the resulting deltas while the session lock is still held.

use crate::domain::error::SessionError;
use crate::domain::session::{Session, SessionStateDelta};
use crate::domain::types::{SessionId, Venue, VenueId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::broadcast_channel::SessionBroadcaster;
use crate::io::session_journal::JournalSender;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared handle to one session's state
pub type SessionHandle = Arc<Mutex<Session>>;

/// Outcome of a committed mutation
pub(crate) struct Applied<T> {
    pub value: T,
    pub deltas: Vec<SessionStateDelta>,
}

impl<T> Applied<T> {
    pub fn new(value: T) -> Self {
        Self { value, deltas: Vec::new() }
    }

    pub fn with(mut self, delta: SessionStateDelta) -> Self {
        self.deltas.push(delta);
        self
    }
}

pub struct SessionRegistry {
    sessions: RwLock<FxHashMap<SessionId, SessionHandle>>,
    venues: RwLock<FxHashMap<VenueId, Venue>>,
    broadcaster: Arc<dyn SessionBroadcaster>,
    journal: Option<JournalSender>,
    active_count: AtomicU64,
    metrics: Arc<Metrics>,
}

impl SessionRegistry {
    pub fn new(broadcaster: Arc<dyn SessionBroadcaster>, metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: RwLock::new(FxHashMap::default()),
            venues: RwLock::new(FxHashMap::default()),
            broadcaster,
            journal: None,
            active_count: AtomicU64::new(0),
            metrics,
        }
    }

    /// Hand ended sessions to the journal worker behind `journal`
    pub fn with_journal(mut self, journal: JournalSender) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Seed venues and shows from configuration
    pub fn from_config(
        config: &Config,
        broadcaster: Arc<dyn SessionBroadcaster>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let registry = Self::new(broadcaster, metrics);

        for venue in config.venues() {
            registry.add_venue(venue.clone());
        }

        for seed in config.shows() {
            if registry.get_venue(&seed.venue_id).is_none() {
                warn!(session_id = %seed.id, venue_id = %seed.venue_id, "show_skipped_unknown_venue");
                continue;
            }
            let mut session = Session::new(
                seed.id.clone(),
                seed.name.clone(),
                seed.venue_id.clone(),
                seed.start_time,
                seed.radius_meters,
            )
            .with_description(seed.description.clone())
            .with_end_time(seed.end_time)
            .with_active(seed.active);
            if let Some(host_id) = &seed.host_id {
                session = session.with_host(host_id.clone());
            }
            registry.open_session(session);
        }

        info!(
            venues = %registry.venues.read().len(),
            sessions = %registry.sessions.read().len(),
            "registry_seeded"
        );
        registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn add_venue(&self, venue: Venue) {
        self.venues.write().insert(venue.id.clone(), venue);
    }

    pub fn get_venue(&self, venue_id: &VenueId) -> Option<Venue> {
        self.venues.read().get(venue_id).cloned()
    }

    /// Register a new session. Returns false if the id is already taken.
    pub fn open_session(&self, session: Session) -> bool {
        let id = session.id().clone();
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            warn!(session_id = %id, "session_open_duplicate");
            return false;
        }
        info!(session_id = %id, venue_id = %session.venue_id(), active = %session.is_active(), "session_opened");
        if session.is_active() {
            let active = self.active_count.fetch_add(1, Ordering::Relaxed) + 1;
            self.metrics.set_active_sessions(active);
        }
        sessions.insert(id, Arc::new(Mutex::new(session)));
        true
    }

    /// End a session on behalf of the show lifecycle. Returns false if it
    /// was already inactive.
    pub fn end_session(&self, session_id: &SessionId, reason: &str) -> Result<bool, SessionError> {
        let handle = self
            .handle(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.clone()))?;
        let mut session = handle.lock();
        if !session.is_active() {
            return Ok(false);
        }
        self.apply(&mut session, "end_session", SessionError::InvariantViolation, |s| {
            s.end();
            Ok(Applied::new(true).with(SessionStateDelta::SessionEnded { reason: reason.to_string() }))
        })
    }

    pub(crate) fn handle(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Point-in-time copy of one session
    pub fn snapshot(&self, session_id: &SessionId) -> Option<Session> {
        self.handle(session_id).map(|h| h.lock().clone())
    }

    /// Point-in-time copies of every active session
    pub fn list_active_sessions(&self) -> Vec<Session> {
        let handles: Vec<SessionHandle> = self.sessions.read().values().cloned().collect();
        handles
            .iter()
            .filter_map(|h| {
                let session = h.lock();
                session.is_active().then(|| session.clone())
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Run `op` against a locked session.
    ///
    /// On error the session is restored to its pre-op state. On success the
    /// invariants are re-checked; a violation is logged with the full session
    /// state, rolled back and reported through `violation`. Committed deltas
    /// each take the next session version as their broadcast sequence number.
    pub(crate) fn apply<T, E>(
        &self,
        session: &mut Session,
        op_name: &'static str,
        violation: impl FnOnce(String) -> E,
        op: impl FnOnce(&mut Session) -> Result<Applied<T>, E>,
    ) -> Result<T, E> {
        let checkpoint = session.checkpoint();
        let was_active = session.is_active();

        let applied = match op(session) {
            Ok(applied) => applied,
            Err(e) => {
                session.restore(checkpoint);
                return Err(e);
            }
        };

        if let Err(reason) = session.validate() {
            error!(
                session_id = %session.id(),
                op = %op_name,
                reason = %reason,
                state = ?session,
                "session_invariant_violated"
            );
            session.restore(checkpoint);
            self.metrics.record_invariant_violation();
            return Err(violation(reason));
        }

        for delta in applied.deltas {
            let seq = session.bump_version();
            self.broadcaster.publish(session.id(), seq, delta);
        }

        if was_active && !session.is_active() {
            info!(session_id = %session.id(), op = %op_name, "session_ended");
            // The worker writes the file after the lock is released
            if let Some(journal) = &self.journal {
                if journal.send(session.clone()).is_err() {
                    warn!(session_id = %session.id(), "session_journal_closed");
                }
            }
            let active = self.active_count.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
            self.metrics.set_active_sessions(active);
        }

        Ok(applied.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Coordinate, ParticipantId};
    use crate::io::broadcast_channel::RecordingBroadcaster;
    use chrono::Utc;

    fn registry() -> (SessionRegistry, Arc<RecordingBroadcaster>) {
        let recorder = Arc::new(RecordingBroadcaster::new());
        let registry = SessionRegistry::new(recorder.clone(), Arc::new(Metrics::new()));
        registry.add_venue(Venue {
            id: VenueId::from("harpa"),
            name: "Harpa".to_string(),
            address: "Austurbakki 2".to_string(),
            coordinate: Coordinate::new(64.1503, -21.9326),
        });
        (registry, recorder)
    }

    fn show(id: &str) -> Session {
        Session::new(SessionId::from(id), "Open mic", VenueId::from("harpa"), Utc::now(), 30.0)
    }

    #[test]
    fn test_open_rejects_duplicate_id() {
        let (registry, _) = registry();
        assert!(registry.open_session(show("a")));
        assert!(!registry.open_session(show("a")));
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn test_list_active_excludes_ended() {
        let (registry, recorder) = registry();
        registry.open_session(show("a"));
        registry.open_session(show("b"));
        registry.open_session(show("c").with_active(false));

        assert_eq!(registry.end_session(&SessionId::from("a"), "over"), Ok(true));
        assert_eq!(registry.end_session(&SessionId::from("a"), "over"), Ok(false));

        let active: Vec<SessionId> =
            registry.list_active_sessions().into_iter().map(|s| s.id().clone()).collect();
        assert_eq!(active, vec![SessionId::from("b")]);
        assert_eq!(recorder.envelopes().len(), 1);
        assert_eq!(registry.metrics().report().active_sessions, 1);
    }

    #[test]
    fn test_end_unknown_session() {
        let (registry, _) = registry();
        assert_eq!(
            registry.end_session(&SessionId::from("nope"), "over"),
            Err(SessionError::SessionNotFound(SessionId::from("nope")))
        );
    }

    #[test]
    fn test_apply_rolls_back_on_invariant_violation() {
        let (registry, recorder) = registry();
        registry.open_session(show("a"));
        let handle = registry.handle(&SessionId::from("a")).unwrap();
        let mut session = handle.lock();

        let result: Result<(), SessionError> =
            registry.apply(&mut session, "corrupt", SessionError::InvariantViolation, |s| {
                s.add_participant(ParticipantId::from("y"));
                s.force_current_performer(ParticipantId::from("ghost"));
                Ok(Applied::new(()).with(SessionStateDelta::QueueChanged { queue: Vec::new() }))
            });

        assert!(matches!(result, Err(SessionError::InvariantViolation(_))));
        assert!(session.participants().is_empty());
        assert!(session.current_performer_id().is_none());
        assert_eq!(session.version(), 0);
        assert!(recorder.envelopes().is_empty());
        assert_eq!(registry.metrics().invariant_violations_total(), 1);
    }

    #[test]
    fn test_apply_stamps_increasing_seq() {
        let (registry, recorder) = registry();
        registry.open_session(show("a"));
        let handle = registry.handle(&SessionId::from("a")).unwrap();
        let mut session = handle.lock();

        let pid = ParticipantId::from("p1");
        registry
            .apply(&mut session, "join", SessionError::InvariantViolation, |s| {
                s.add_participant(pid.clone());
                s.enqueue(&pid)?;
                Ok(Applied::new(())
                    .with(SessionStateDelta::ParticipantLeft { participant_id: pid.clone() })
                    .with(SessionStateDelta::QueueChanged { queue: s.queue_snapshot() }))
            })
            .unwrap();

        let seqs: Vec<u64> = recorder.envelopes().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(session.version(), 2);
    }

    #[tokio::test]
    async fn test_ended_session_goes_to_journal_worker() {
        use crate::io::session_journal::{create_journal_worker, SessionJournal};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.jsonl");
        let (tx, worker) = create_journal_worker(SessionJournal::new(path.to_str().unwrap()));
        let (registry, _) = registry();
        let registry = registry.with_journal(tx);
        registry.open_session(show("a"));
        registry.open_session(show("b"));

        assert_eq!(registry.end_session(&SessionId::from("a"), "over"), Ok(true));
        assert_eq!(registry.end_session(&SessionId::from("a"), "over"), Ok(false));

        // Dropping the registry closes the channel so the worker finishes
        drop(registry);
        worker.run().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let line: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(line["id"], "a");
        assert_eq!(line["isActive"], false);
    }

    #[test]
    fn test_from_config_skips_show_with_unknown_venue() {
        let toml = r#"
[[venues]]
id = "harpa"
name = "Harpa"
address = "Austurbakki 2"
latitude = 64.1503
longitude = -21.9326

[[shows]]
id = "known"
name = "Known"
venue_id = "harpa"
start_time = "2026-10-18T20:00:00Z"
host_id = "dj"

[[shows]]
id = "orphan"
name = "Orphan"
venue_id = "missing"
start_time = "2026-10-18T20:00:00Z"
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, toml).unwrap();
        let config = Config::from_file(&path).unwrap();

        let registry = SessionRegistry::from_config(
            &config,
            Arc::new(RecordingBroadcaster::new()),
            Arc::new(Metrics::new()),
        );
        assert_eq!(registry.session_count(), 1);
        let known = registry.snapshot(&SessionId::from("known")).unwrap();
        assert_eq!(known.host_id(), Some(&ParticipantId::from("dj")));
        assert_eq!(known.radius_meters(), 30.0);
    }
}
