//! Participant queue manager
//!
//! All queue, stage and membership mutations after admission. Each call
//! takes the session's own lock for its whole read-modify-write, so calls
//! on one session form a total order and calls on different sessions run
//! independently.

use crate::domain::error::SessionError;
use crate::domain::session::{ChatMessage, LeaveEffect, Session, SessionStateDelta};
use crate::domain::types::{ParticipantId, SessionId};
use crate::services::registry::{Applied, SessionRegistry};
use std::sync::Arc;
use tracing::{debug, info};

pub struct ParticipantQueueManager {
    registry: Arc<SessionRegistry>,
}

impl ParticipantQueueManager {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Run `f` with the session locked
    fn with_session<T>(
        &self,
        session_id: &SessionId,
        require_active: bool,
        f: impl FnOnce(&mut Session) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let handle = self
            .registry
            .handle(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.clone()))?;
        let mut session = handle.lock();
        if require_active && !session.is_active() {
            return Err(SessionError::SessionInactive(session_id.clone()));
        }
        f(&mut *session)
    }

    /// Append to the queue tail. Returns false when nothing changed (already
    /// queued, host, or currently performing).
    pub fn enqueue(&self, session_id: &SessionId, participant_id: &ParticipantId) -> Result<bool, SessionError> {
        let added = self.with_session(session_id, true, |session| {
            self.registry.apply(session, "enqueue", SessionError::InvariantViolation, |s| {
                let added = s.enqueue(participant_id)?;
                let applied = Applied::new(added);
                Ok(if added {
                    applied.with(SessionStateDelta::QueueChanged { queue: s.queue_snapshot() })
                } else {
                    applied
                })
            })
        })?;

        if added {
            self.registry.metrics().record_enqueue();
        }
        debug!(session_id = %session_id, participant_id = %participant_id, added = %added, "queue_enqueue");
        Ok(added)
    }

    /// Pop the queue head. Does not change the current performer.
    pub fn dequeue_next(&self, session_id: &SessionId) -> Result<Option<ParticipantId>, SessionError> {
        let next = self.with_session(session_id, true, |session| {
            self.registry.apply(session, "dequeue_next", SessionError::InvariantViolation, |s| {
                Ok(match s.dequeue_next() {
                    Some(next) => Applied::new(Some(next))
                        .with(SessionStateDelta::QueueChanged { queue: s.queue_snapshot() }),
                    None => Applied::new(None),
                })
            })
        })?;

        if next.is_some() {
            self.registry.metrics().record_dequeue();
        }
        debug!(session_id = %session_id, next = ?next, "queue_dequeue");
        Ok(next)
    }

    /// Put a participant on stage, pulling them out of the queue.
    /// Returns the previous performer.
    pub fn set_current_performer(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
    ) -> Result<Option<ParticipantId>, SessionError> {
        self.with_session(session_id, true, |session| self.put_on_stage(session, participant_id))
    }

    /// Host-initiated [`Self::set_current_performer`]
    pub fn host_set_current_performer(
        &self,
        session_id: &SessionId,
        actor: &ParticipantId,
        participant_id: &ParticipantId,
    ) -> Result<Option<ParticipantId>, SessionError> {
        self.with_session(session_id, true, |session| {
            require_host(session, actor)?;
            self.put_on_stage(session, participant_id)
        })
    }

    /// Host action: dequeue the next performer and put them on stage. With
    /// an empty queue the stage is cleared. Returns the new performer.
    pub fn advance(&self, session_id: &SessionId, actor: &ParticipantId) -> Result<Option<ParticipantId>, SessionError> {
        let (current, changed) = self.with_session(session_id, true, |session| {
            require_host(session, actor)?;
            self.registry.apply(session, "advance", SessionError::InvariantViolation, |s| {
                match s.dequeue_next() {
                    Some(next) => {
                        s.set_current_performer(&next)?;
                        Ok(Applied::new((Some(next.clone()), true))
                            .with(SessionStateDelta::QueueChanged { queue: s.queue_snapshot() })
                            .with(SessionStateDelta::CurrentPerformerChanged { participant_id: Some(next) }))
                    }
                    // Empty queue and empty stage: nothing to announce
                    None => Ok(match s.clear_current_performer() {
                        Some(_) => Applied::new((None, true))
                            .with(SessionStateDelta::CurrentPerformerChanged { participant_id: None }),
                        None => Applied::new((None, false)),
                    }),
                }
            })
        })?;

        let metrics = self.registry.metrics();
        if current.is_some() {
            metrics.record_dequeue();
        }
        if changed {
            metrics.record_performer_change();
        }
        info!(session_id = %session_id, current = ?current, changed = %changed, "performer_advanced");
        Ok(current)
    }

    /// Remove a participant. The host leaving ends the session. Leaving a
    /// session one is not part of is a no-op.
    pub fn leave(&self, session_id: &SessionId, participant_id: &ParticipantId) -> Result<LeaveEffect, SessionError> {
        let effect = self.with_session(session_id, false, |session| {
            self.registry.apply(session, "leave", SessionError::InvariantViolation, |s| {
                let effect = s.remove_participant(participant_id);
                let mut applied = Applied::new(effect);
                if !effect.was_member {
                    return Ok(applied);
                }
                applied = applied.with(SessionStateDelta::ParticipantLeft { participant_id: participant_id.clone() });
                if effect.was_queued {
                    applied = applied.with(SessionStateDelta::QueueChanged { queue: s.queue_snapshot() });
                }
                if effect.cleared_current {
                    applied = applied.with(SessionStateDelta::CurrentPerformerChanged { participant_id: None });
                }
                if effect.ended_session {
                    applied = applied.with(SessionStateDelta::SessionEnded { reason: "host_left".to_string() });
                }
                Ok(applied)
            })
        })?;

        if effect.was_member {
            self.registry.metrics().record_leave(effect.ended_session);
            info!(
                session_id = %session_id,
                participant_id = %participant_id,
                ended_session = %effect.ended_session,
                "participant_left"
            );
        }
        Ok(effect)
    }

    pub fn append_chat(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        text: &str,
    ) -> Result<ChatMessage, SessionError> {
        let message = self.with_session(session_id, true, |session| {
            self.registry.apply(session, "append_chat", SessionError::InvariantViolation, |s| {
                let message = s.append_chat(participant_id, text)?;
                Ok(Applied::new(message.clone()).with(SessionStateDelta::ChatAppended { message }))
            })
        })?;

        self.registry.metrics().record_chat_message();
        Ok(message)
    }

    fn put_on_stage(
        &self,
        session: &mut Session,
        participant_id: &ParticipantId,
    ) -> Result<Option<ParticipantId>, SessionError> {
        let previous = self.registry.apply(session, "set_current_performer", SessionError::InvariantViolation, |s| {
            let was_queued = s.is_queued(participant_id);
            let previous = s.set_current_performer(participant_id)?;
            let mut applied = Applied::new(previous.clone());
            if previous.as_ref() != Some(participant_id) {
                applied = applied.with(SessionStateDelta::CurrentPerformerChanged {
                    participant_id: Some(participant_id.clone()),
                });
            }
            if was_queued {
                applied = applied.with(SessionStateDelta::QueueChanged { queue: s.queue_snapshot() });
            }
            Ok(applied)
        })?;

        self.registry.metrics().record_performer_change();
        info!(
            session_id = %session.id(),
            participant_id = %participant_id,
            previous = ?previous,
            "current_performer_set"
        );
        Ok(previous)
    }
}

fn require_host(session: &Session, actor: &ParticipantId) -> Result<(), SessionError> {
    if session.is_host(actor) && session.is_participant(actor) {
        Ok(())
    } else {
        Err(SessionError::NotHost)
    }
}
