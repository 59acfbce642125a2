//! MQTT publisher for session state deltas
//!
//! Drains the broadcast channel and publishes each envelope as JSON to
//! `<topic_prefix>/<sessionId>`:
//! - state deltas at QoS 0 (clients resync from `GET /live-shows/{id}`)
//! - `session_ended` at QoS 1 so late subscribers see the session close

use crate::domain::session::SessionStateDelta;
use crate::domain::types::SessionId;
use crate::infra::config::Config;
use crate::io::broadcast_channel::BroadcastEnvelope;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Topic carrying one session's deltas
pub fn session_topic(prefix: &str, session_id: &SessionId) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), session_id)
}

fn qos_for(delta: &SessionStateDelta) -> QoS {
    match delta {
        SessionStateDelta::SessionEnded { .. } => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

/// MQTT broadcaster actor
pub struct MqttBroadcaster {
    client: AsyncClient,
    rx: mpsc::Receiver<BroadcastEnvelope>,
    topic_prefix: String,
}

impl MqttBroadcaster {
    /// Connects to the broker at the configured MQTT host/port
    pub fn new(config: &Config, rx: mpsc::Receiver<BroadcastEnvelope>) -> Self {
        let client_id = format!("showgate-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_broadcast_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_broadcast_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_broadcast_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, rx, topic_prefix: config.broadcast_topic_prefix().to_string() }
    }

    /// Publish until shutdown, then drain what is already queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(topic_prefix = %self.topic_prefix, "mqtt_broadcast_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_broadcast_shutdown");
                        while let Ok(envelope) = self.rx.try_recv() {
                            self.publish(envelope).await;
                        }
                        return;
                    }
                }
                Some(envelope) = self.rx.recv() => {
                    self.publish(envelope).await;
                }
            }
        }
    }

    async fn publish(&self, envelope: BroadcastEnvelope) {
        let topic = session_topic(&self.topic_prefix, &envelope.session_id);
        let qos = qos_for(&envelope.delta);
        let json = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(e) => {
                error!(session_id = %envelope.session_id, error = %e, "mqtt_broadcast_serialize_failed");
                return;
            }
        };

        if let Err(e) = self.client.publish(&topic, qos, false, json.as_bytes()).await {
            debug!(topic = %topic, seq = %envelope.seq, error = %e, "mqtt_broadcast_publish_failed");
        }
    }
}
