//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `http_api` - JSON HTTP API for clients (hyper)
//! - `api_client` - reqwest client for the API and remote distance lookups
//! - `position_http` - Position source polling an HTTP positioning endpoint
//! - `broadcast_channel` - Typed channel for session state deltas
//! - `mqtt_broadcast` - MQTT publisher for session state deltas
//! - `session_journal` - Ended sessions to file (JSONL format) via a worker task
//! - `prometheus` - Prometheus metrics text exposition

pub mod api_client;
pub mod broadcast_channel;
pub mod http_api;
pub mod mqtt_broadcast;
pub mod position_http;
pub mod prometheus;
pub mod session_journal;

// Re-export commonly used types
pub use api_client::{HttpDistance, ShowApiClient};
pub use broadcast_channel::{create_broadcast_channel, BroadcastSender, NoopBroadcaster, SessionBroadcaster};
pub use http_api::{start_api_server, AppState};
pub use mqtt_broadcast::MqttBroadcaster;
pub use position_http::HttpPositionSource;
pub use session_journal::{create_journal_worker, JournalSender, JournalWorker, SessionJournal};
