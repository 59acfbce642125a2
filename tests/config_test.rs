//! Integration tests for configuration loading

use showgate::domain::types::{ParticipantId, SessionId, VenueId};
use showgate::infra::Config;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[server]
bind_address = "127.0.0.1"
port = 9090

[admission]
default_radius_meters = 40.0
nearby_radius_meters = 500.0

[distance]
remote_url = "http://distance.local"
timeout_ms = 800

[location]
max_attempts = 5
base_delay_ms = 250
max_delay_ms = 4000
backoff_factor = 3.0
source_url = "http://gps.local/position"

[broadcast]
enabled = false
mqtt_host = "test-host"
mqtt_port = 1884
username = "user"
password = "secret"
topic_prefix = "club/shows"

[journal]
file = "/tmp/showgate-test/sessions.jsonl"

[metrics]
interval_secs = 15

[[venues]]
id = "harpa"
name = "Harpa"
address = "Austurbakki 2"
latitude = 64.1503
longitude = -21.9326

[[shows]]
id = "open-mic"
name = "Open Mic"
venue_id = "harpa"
start_time = "2026-10-18T20:00:00Z"
end_time = "2026-10-18T23:00:00Z"
host_id = "mc"
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.bind_address(), "127.0.0.1");
    assert_eq!(config.port(), 9090);
    assert_eq!(config.default_radius_meters(), 40.0);
    assert_eq!(config.nearby_radius_meters(), 500.0);
    assert_eq!(config.distance_remote_url(), Some("http://distance.local"));
    assert_eq!(config.distance_timeout_ms(), 800);

    let policy = config.retry_policy();
    assert_eq!(policy.max_attempts, 5);
    assert_eq!(policy.base_delay_ms, 250);
    assert_eq!(policy.max_delay_ms, 4000);
    assert_eq!(policy.backoff_factor, 3.0);
    assert_eq!(config.location_source_url(), Some("http://gps.local/position"));

    assert!(!config.broadcast_enabled());
    assert_eq!(config.mqtt_host(), "test-host");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.mqtt_username(), Some("user"));
    assert_eq!(config.mqtt_password(), Some("secret"));
    assert_eq!(config.broadcast_topic_prefix(), "club/shows");
    assert_eq!(config.journal_file(), "/tmp/showgate-test/sessions.jsonl");
    assert_eq!(config.metrics_interval_secs(), 15);

    assert_eq!(config.venues().len(), 1);
    assert_eq!(config.venues()[0].id, VenueId::from("harpa"));

    let show = &config.shows()[0];
    assert_eq!(show.id, SessionId::from("open-mic"));
    assert_eq!(show.radius_meters, 40.0);
    assert_eq!(show.host_id, Some(ParticipantId::from("mc")));
    assert!(show.end_time.is_some());
    assert!(show.active);
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.mqtt_host(), "localhost");
    assert_eq!(config.mqtt_port(), 1883);
    assert_eq!(config.default_radius_meters(), 30.0);
    assert_eq!(config.config_file(), "default");
}

#[test]
fn test_malformed_file_is_an_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[server\nport = ").unwrap();
    temp_file.flush().unwrap();

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("Failed to parse config file"));
}

#[test]
fn test_shipped_dev_config_loads() {
    let config = Config::from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/config/dev.toml")).unwrap();
    assert!(!config.venues().is_empty());
    assert!(config.shows().iter().all(|s| config.venues().iter().any(|v| v.id == s.venue_id)));
}
