//! Typed channel for session state deltas
//!
//! The coordinator never waits on delivery: deltas are pushed into a bounded
//! mpsc channel with `try_send` and dropped when the publisher falls behind.

use crate::domain::session::SessionStateDelta;
use crate::domain::types::{epoch_ms, SessionId};
use crate::infra::metrics::Metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Wire form of one state change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEnvelope {
    pub session_id: SessionId,
    /// Session mutation counter; strictly increasing per session
    pub seq: u64,
    /// Emission time (epoch ms)
    pub ts: i64,
    pub delta: SessionStateDelta,
}

/// Fire-and-forget sink for state deltas
///
/// Called while the session lock is held, so implementations must not block.
pub trait SessionBroadcaster: Send + Sync {
    fn publish(&self, session_id: &SessionId, seq: u64, delta: SessionStateDelta);
}

/// Sender half of the broadcast channel
#[derive(Clone)]
pub struct BroadcastSender {
    tx: mpsc::Sender<BroadcastEnvelope>,
    metrics: Arc<Metrics>,
}

impl BroadcastSender {
    pub fn new(tx: mpsc::Sender<BroadcastEnvelope>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }
}

impl SessionBroadcaster for BroadcastSender {
    fn publish(&self, session_id: &SessionId, seq: u64, delta: SessionStateDelta) {
        let kind = delta.kind();
        let envelope = BroadcastEnvelope { session_id: session_id.clone(), seq, ts: epoch_ms(), delta };
        // Drop if channel full
        let delivered = self.tx.try_send(envelope).is_ok();
        self.metrics.record_broadcast(delivered);
        if !delivered {
            debug!(session_id = %session_id, seq = %seq, kind = %kind, "broadcast_dropped");
        }
    }
}

/// Create a new broadcast channel pair
pub fn create_broadcast_channel(
    capacity: usize,
    metrics: Arc<Metrics>,
) -> (BroadcastSender, mpsc::Receiver<BroadcastEnvelope>) {
    let (tx, rx) = mpsc::channel(capacity);
    (BroadcastSender::new(tx, metrics), rx)
}

/// Broadcaster used when publishing is disabled
pub struct NoopBroadcaster;

impl SessionBroadcaster for NoopBroadcaster {
    fn publish(&self, _session_id: &SessionId, _seq: u64, _delta: SessionStateDelta) {}
}

/// Keeps every envelope in memory, in publish order
#[derive(Default)]
pub struct RecordingBroadcaster {
    envelopes: Mutex<Vec<BroadcastEnvelope>>,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> Vec<BroadcastEnvelope> {
        self.envelopes.lock().clone()
    }

    /// Envelopes for one session
    pub fn for_session(&self, session_id: &SessionId) -> Vec<BroadcastEnvelope> {
        self.envelopes.lock().iter().filter(|e| &e.session_id == session_id).cloned().collect()
    }
}

impl SessionBroadcaster for RecordingBroadcaster {
    fn publish(&self, session_id: &SessionId, seq: u64, delta: SessionStateDelta) {
        self.envelopes.lock().push(BroadcastEnvelope {
            session_id: session_id.clone(),
            seq,
            ts: epoch_ms(),
            delta,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::ParticipantId;

    fn left(id: &str) -> SessionStateDelta {
        SessionStateDelta::ParticipantLeft { participant_id: ParticipantId::from(id) }
    }

    #[tokio::test]
    async fn test_sender_delivers_in_order() {
        let metrics = Arc::new(Metrics::new());
        let (sender, mut rx) = create_broadcast_channel(8, metrics);
        let sid = SessionId::from("show-1");

        sender.publish(&sid, 1, left("a"));
        sender.publish(&sid, 2, left("b"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(second.delta, left("b"));
    }

    #[tokio::test]
    async fn test_sender_drops_when_full() {
        let metrics = Arc::new(Metrics::new());
        let (sender, mut rx) = create_broadcast_channel(1, metrics.clone());
        let sid = SessionId::from("show-1");

        sender.publish(&sid, 1, left("a"));
        sender.publish(&sid, 2, left("b"));

        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert!(rx.try_recv().is_err());
        let summary = metrics.report();
        assert_eq!(summary.broadcast_sent_total, 1);
        assert_eq!(summary.broadcast_dropped_total, 1);
    }

    #[test]
    fn test_envelope_json_shape() {
        let envelope = BroadcastEnvelope {
            session_id: SessionId::from("show-1"),
            seq: 7,
            ts: 1_700_000_000_000,
            delta: left("a"),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["sessionId"], "show-1");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["delta"]["type"], "participant_left");
        assert_eq!(json["delta"]["participantId"], "a");
    }

    #[test]
    fn test_recording_filters_by_session() {
        let recorder = RecordingBroadcaster::new();
        recorder.publish(&SessionId::from("a"), 1, left("x"));
        recorder.publish(&SessionId::from("b"), 1, left("y"));
        assert_eq!(recorder.envelopes().len(), 2);
        assert_eq!(recorder.for_session(&SessionId::from("b")).len(), 1);
    }
}
