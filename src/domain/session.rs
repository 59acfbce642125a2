//! Live show session aggregate
//!
//! A `Session` owns the participant set, the FIFO performance queue, the
//! current performer and the host slot. Mutators check their preconditions
//! before touching state; `validate()` re-checks the session invariants:
//!
//! 1. `current_performer_id`, if set, is a participant and not queued.
//! 2. The queue has no duplicates and never contains the host.
//! 3. The host slot is assigned at most once.
//! 4. Queued and performing IDs are participants.

use crate::domain::error::SessionError;
use crate::domain::types::{epoch_ms, ParticipantId, Role, SessionId, VenueId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// One chat line; the chat log is append-only
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub participant_id: ParticipantId,
    pub text: String,
    pub sent_at_ms: i64,
}

/// Effect of removing a participant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaveEffect {
    pub was_member: bool,
    pub was_queued: bool,
    pub cleared_current: bool,
    /// The host left and the session was deactivated
    pub ended_session: bool,
}

/// State change emitted to the session broadcaster
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionStateDelta {
    #[serde(rename_all = "camelCase")]
    ParticipantJoined { participant_id: ParticipantId, role: Role },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { participant_id: ParticipantId },
    #[serde(rename_all = "camelCase")]
    HostAssigned { participant_id: ParticipantId },
    QueueChanged { queue: Vec<ParticipantId> },
    #[serde(rename_all = "camelCase")]
    CurrentPerformerChanged { participant_id: Option<ParticipantId> },
    ChatAppended { message: ChatMessage },
    SessionEnded { reason: String },
}

impl SessionStateDelta {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::ParticipantLeft { .. } => "participant_left",
            Self::HostAssigned { .. } => "host_assigned",
            Self::QueueChanged { .. } => "queue_changed",
            Self::CurrentPerformerChanged { .. } => "current_performer_changed",
            Self::ChatAppended { .. } => "chat_appended",
            Self::SessionEnded { .. } => "session_ended",
        }
    }
}

/// Read projection of a session for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub description: String,
    pub host_id: Option<ParticipantId>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub venue_id: VenueId,
    pub radius_meters: f64,
    pub participant_count: usize,
    pub queue_length: usize,
    pub current_performer_id: Option<ParticipantId>,
}

/// Membership fields captured before a mutation so a rejected operation
/// can be rolled back. The chat log is append-only, so only its length is kept.
#[derive(Debug, Clone)]
pub(crate) struct SessionCheckpoint {
    host_id: Option<ParticipantId>,
    host_assigned: bool,
    is_active: bool,
    end_time: Option<DateTime<Utc>>,
    participants: Vec<ParticipantId>,
    queue: VecDeque<ParticipantId>,
    current_performer_id: Option<ParticipantId>,
    chat_len: usize,
    version: u64,
}

/// A live show
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    id: SessionId,
    name: String,
    description: String,
    host_id: Option<ParticipantId>,
    #[serde(skip)]
    host_assigned: bool,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    is_active: bool,
    venue_id: VenueId,
    radius_meters: f64,
    participants: Vec<ParticipantId>,
    queue: VecDeque<ParticipantId>,
    current_performer_id: Option<ParticipantId>,
    chat_log: Vec<ChatMessage>,
    version: u64,
    updated_at_ms: i64,
}

impl Session {
    pub fn new(
        id: SessionId,
        name: impl Into<String>,
        venue_id: VenueId,
        start_time: DateTime<Utc>,
        radius_meters: f64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
            host_id: None,
            host_assigned: false,
            start_time,
            end_time: None,
            is_active: true,
            venue_id,
            radius_meters,
            participants: Vec::new(),
            queue: VecDeque::new(),
            current_performer_id: None,
            chat_log: Vec::new(),
            version: 0,
            updated_at_ms: epoch_ms(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Pre-configure the host before anyone joins
    pub fn with_host(mut self, host_id: ParticipantId) -> Self {
        self.host_id = Some(host_id);
        self.host_assigned = true;
        self
    }

    pub fn with_end_time(mut self, end_time: Option<DateTime<Utc>>) -> Self {
        self.end_time = end_time;
        self
    }

    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            host_id: self.host_id.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            is_active: self.is_active,
            venue_id: self.venue_id.clone(),
            radius_meters: self.radius_meters,
            participant_count: self.participants.len(),
            queue_length: self.queue.len(),
            current_performer_id: self.current_performer_id.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn host_id(&self) -> Option<&ParticipantId> {
        self.host_id.as_ref()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn venue_id(&self) -> &VenueId {
        &self.venue_id
    }

    pub fn radius_meters(&self) -> f64 {
        self.radius_meters
    }

    pub fn participants(&self) -> &[ParticipantId] {
        &self.participants
    }

    pub fn queue(&self) -> impl Iterator<Item = &ParticipantId> {
        self.queue.iter()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_snapshot(&self) -> Vec<ParticipantId> {
        self.queue.iter().cloned().collect()
    }

    pub fn current_performer_id(&self) -> Option<&ParticipantId> {
        self.current_performer_id.as_ref()
    }

    pub fn chat_log(&self) -> &[ChatMessage] {
        &self.chat_log
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_participant(&self, participant_id: &ParticipantId) -> bool {
        self.participants.contains(participant_id)
    }

    pub fn is_host(&self, participant_id: &ParticipantId) -> bool {
        self.host_id.as_ref() == Some(participant_id)
    }

    pub fn is_queued(&self, participant_id: &ParticipantId) -> bool {
        self.queue.contains(participant_id)
    }

    /// No host yet and the slot has never been used
    pub fn host_slot_open(&self) -> bool {
        self.host_id.is_none() && !self.host_assigned
    }

    /// Role of a current participant
    pub fn role_of(&self, participant_id: &ParticipantId) -> Option<Role> {
        if !self.is_participant(participant_id) {
            return None;
        }
        Some(if self.is_host(participant_id) { Role::Host } else { Role::Performer })
    }

    /// 1-based position in the queue
    pub fn queue_position(&self, participant_id: &ParticipantId) -> Option<usize> {
        self.queue.iter().position(|p| p == participant_id).map(|i| i + 1)
    }

    pub(crate) fn add_participant(&mut self, participant_id: ParticipantId) -> bool {
        if self.is_participant(&participant_id) {
            return false;
        }
        self.participants.push(participant_id);
        true
    }

    /// Claim the host slot. Fails if the slot is held by someone else.
    pub(crate) fn assign_host(&mut self, participant_id: &ParticipantId) -> Result<bool, SessionError> {
        match &self.host_id {
            Some(existing) if existing == participant_id => Ok(false),
            Some(existing) => Err(SessionError::InvariantViolation(format!(
                "host already assigned to {existing}"
            ))),
            None if self.host_assigned => Err(SessionError::InvariantViolation(
                "host slot was already used in this session".to_string(),
            )),
            None => {
                self.host_id = Some(participant_id.clone());
                self.host_assigned = true;
                Ok(true)
            }
        }
    }

    /// Append to the queue tail. Returns false for no-ops (host, already
    /// queued, currently performing).
    pub(crate) fn enqueue(&mut self, participant_id: &ParticipantId) -> Result<bool, SessionError> {
        if !self.is_participant(participant_id) {
            return Err(SessionError::NotAParticipant(participant_id.clone()));
        }
        if self.is_host(participant_id)
            || self.is_queued(participant_id)
            || self.current_performer_id.as_ref() == Some(participant_id)
        {
            return Ok(false);
        }
        self.queue.push_back(participant_id.clone());
        Ok(true)
    }

    pub(crate) fn dequeue_next(&mut self) -> Option<ParticipantId> {
        self.queue.pop_front()
    }

    /// Put a participant on stage, pulling them out of the queue.
    /// Returns the previous performer.
    pub(crate) fn set_current_performer(
        &mut self,
        participant_id: &ParticipantId,
    ) -> Result<Option<ParticipantId>, SessionError> {
        if !self.is_participant(participant_id) {
            return Err(SessionError::NotAParticipant(participant_id.clone()));
        }
        self.queue.retain(|p| p != participant_id);
        Ok(self.current_performer_id.replace(participant_id.clone()))
    }

    /// Take the current performer off stage
    pub(crate) fn clear_current_performer(&mut self) -> Option<ParticipantId> {
        self.current_performer_id.take()
    }

    pub(crate) fn remove_participant(&mut self, participant_id: &ParticipantId) -> LeaveEffect {
        let Some(idx) = self.participants.iter().position(|p| p == participant_id) else {
            return LeaveEffect::default();
        };
        self.participants.remove(idx);

        let queued_before = self.queue.len();
        self.queue.retain(|p| p != participant_id);

        let cleared_current = self.current_performer_id.as_ref() == Some(participant_id);
        if cleared_current {
            self.current_performer_id = None;
        }

        let ended_session = self.is_host(participant_id) && self.is_active;
        if ended_session {
            self.end();
        }

        LeaveEffect {
            was_member: true,
            was_queued: self.queue.len() != queued_before,
            cleared_current,
            ended_session,
        }
    }

    pub(crate) fn append_chat(
        &mut self,
        participant_id: &ParticipantId,
        text: &str,
    ) -> Result<ChatMessage, SessionError> {
        if !self.is_participant(participant_id) {
            return Err(SessionError::NotAParticipant(participant_id.clone()));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let message = ChatMessage {
            id: Uuid::now_v7().to_string(),
            participant_id: participant_id.clone(),
            text: text.to_string(),
            sent_at_ms: epoch_ms(),
        };
        self.chat_log.push(message.clone());
        Ok(message)
    }

    /// Deactivate the session. Idempotent.
    pub(crate) fn end(&mut self) {
        if self.is_active {
            self.is_active = false;
            self.end_time.get_or_insert_with(Utc::now);
        }
    }

    /// Stamp a committed mutation, returning its sequence number
    pub(crate) fn bump_version(&mut self) -> u64 {
        self.version += 1;
        self.updated_at_ms = epoch_ms();
        self.version
    }

    pub(crate) fn checkpoint(&self) -> SessionCheckpoint {
        SessionCheckpoint {
            host_id: self.host_id.clone(),
            host_assigned: self.host_assigned,
            is_active: self.is_active,
            end_time: self.end_time,
            participants: self.participants.clone(),
            queue: self.queue.clone(),
            current_performer_id: self.current_performer_id.clone(),
            chat_len: self.chat_log.len(),
            version: self.version,
        }
    }

    pub(crate) fn restore(&mut self, checkpoint: SessionCheckpoint) {
        self.host_id = checkpoint.host_id;
        self.host_assigned = checkpoint.host_assigned;
        self.is_active = checkpoint.is_active;
        self.end_time = checkpoint.end_time;
        self.participants = checkpoint.participants;
        self.queue = checkpoint.queue;
        self.current_performer_id = checkpoint.current_performer_id;
        self.chat_log.truncate(checkpoint.chat_len);
        self.version = checkpoint.version;
    }

    /// Set the performer without any checks, to exercise rollback paths
    #[cfg(test)]
    pub(crate) fn force_current_performer(&mut self, participant_id: ParticipantId) {
        self.current_performer_id = Some(participant_id);
    }

    /// Check the session invariants, describing the first violation found
    pub fn validate(&self) -> Result<(), String> {
        if let Some(current) = &self.current_performer_id {
            if !self.is_participant(current) {
                return Err(format!("current performer {current} is not a participant"));
            }
            if self.is_queued(current) {
                return Err(format!("current performer {current} is still queued"));
            }
        }

        for (i, queued) in self.queue.iter().enumerate() {
            if self.queue.iter().skip(i + 1).any(|other| other == queued) {
                return Err(format!("{queued} is queued twice"));
            }
            if self.is_host(queued) {
                return Err(format!("host {queued} is queued"));
            }
            if !self.is_participant(queued) {
                return Err(format!("queued {queued} is not a participant"));
            }
        }

        if self.host_id.is_some() && !self.host_assigned {
            return Err("host set without consuming the host slot".to_string());
        }

        for (i, participant) in self.participants.iter().enumerate() {
            if self.participants.iter().skip(i + 1).any(|other| other == participant) {
                return Err(format!("{participant} is listed twice"));
            }
        }

        Ok(())
    }
}
