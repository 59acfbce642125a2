//! Configuration loading from TOML files
//!
//! The binary picks the path (`--config`, then `CONFIG_FILE`, then
//! `config/dev.toml`); this module reads and validates it.

use crate::domain::types::{Coordinate, ParticipantId, SessionId, Venue, VenueId};
use crate::services::location::RetryPolicy;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Radius approximating "physically at the venue"
pub const DEFAULT_RADIUS_METERS: f64 = 30.0;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), port: default_server_port() }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Radius used for sessions that do not configure their own
    #[serde(default = "default_radius")]
    pub default_radius_meters: f64,
    /// Default radius for nearby show searches
    #[serde(default = "default_radius")]
    pub nearby_radius_meters: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { default_radius_meters: default_radius(), nearby_radius_meters: default_radius() }
    }
}

fn default_radius() -> f64 {
    DEFAULT_RADIUS_METERS
}

#[derive(Debug, Clone, Deserialize)]
pub struct DistanceConfig {
    /// Authoritative distance service base URL (local formula only if unset)
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default = "default_distance_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self { remote_url: None, timeout_ms: default_distance_timeout_ms() }
    }
}

fn default_distance_timeout_ms() -> u64 {
    1500
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Position endpoint for `HttpPositionSource`
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default = "default_location_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            source_url: None,
            request_timeout_ms: default_location_timeout_ms(),
            watch_interval_ms: default_watch_interval_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_location_timeout_ms() -> u64 {
    10_000
}

fn default_watch_interval_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    /// Publish session deltas over MQTT
    #[serde(default = "default_broadcast_enabled")]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Deltas go to `<topic_prefix>/<session_id>`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            enabled: default_broadcast_enabled(),
            mqtt_host: default_mqtt_host(),
            mqtt_port: default_mqtt_port(),
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_broadcast_enabled() -> bool {
    true
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "showgate/sessions".to_string()
}

fn default_channel_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    /// File path for ended sessions (JSONL format)
    #[serde(default = "default_journal_file")]
    pub file: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self { file: default_journal_file() }
    }
}

fn default_journal_file() -> String {
    "sessions.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    30
}

/// Venue seed entry
#[derive(Debug, Clone, Deserialize)]
pub struct VenueEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Live show seed entry
#[derive(Debug, Clone, Deserialize)]
pub struct ShowEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub venue_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub radius_meters: Option<f64>,
    #[serde(default = "default_show_active")]
    pub active: bool,
}

fn default_show_active() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub distance: DistanceConfig,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub venues: Vec<VenueEntry>,
    #[serde(default)]
    pub shows: Vec<ShowEntry>,
}

/// Seed data for a live show, resolved against config defaults
#[derive(Debug, Clone, PartialEq)]
pub struct ShowSeed {
    pub id: SessionId,
    pub name: String,
    pub description: String,
    pub venue_id: VenueId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub host_id: Option<ParticipantId>,
    pub radius_meters: f64,
    pub active: bool,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    bind_address: String,
    port: u16,
    default_radius_meters: f64,
    nearby_radius_meters: f64,
    distance_remote_url: Option<String>,
    distance_timeout_ms: u64,
    retry_policy: RetryPolicy,
    location_source_url: Option<String>,
    location_request_timeout_ms: u64,
    location_watch_interval_ms: u64,
    broadcast_enabled: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    broadcast_topic_prefix: String,
    broadcast_channel_capacity: usize,
    journal_file: String,
    metrics_interval_secs: u64,
    venues: Vec<Venue>,
    shows: Vec<ShowSeed>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_server_port(),
            default_radius_meters: DEFAULT_RADIUS_METERS,
            nearby_radius_meters: DEFAULT_RADIUS_METERS,
            distance_remote_url: None,
            distance_timeout_ms: default_distance_timeout_ms(),
            retry_policy: RetryPolicy::default(),
            location_source_url: None,
            location_request_timeout_ms: default_location_timeout_ms(),
            location_watch_interval_ms: default_watch_interval_ms(),
            broadcast_enabled: default_broadcast_enabled(),
            mqtt_host: default_mqtt_host(),
            mqtt_port: default_mqtt_port(),
            mqtt_username: None,
            mqtt_password: None,
            broadcast_topic_prefix: default_topic_prefix(),
            broadcast_channel_capacity: default_channel_capacity(),
            journal_file: default_journal_file(),
            metrics_interval_secs: default_metrics_interval(),
            venues: Vec::new(),
            shows: Vec::new(),
            config_file: "default".to_string(),
        }
    }
}

fn ensure_radius(radius: f64, name: &str) -> anyhow::Result<()> {
    anyhow::ensure!(radius.is_finite() && radius >= 0.0, "{name} must be a finite non-negative number, got {radius}");
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Self::from_toml(toml_config, path.display().to_string())
    }

    fn from_toml(toml_config: TomlConfig, config_file: String) -> anyhow::Result<Self> {
        let location = toml_config.location;
        let retry_policy = RetryPolicy {
            max_attempts: location.max_attempts,
            base_delay_ms: location.base_delay_ms,
            max_delay_ms: location.max_delay_ms,
            backoff_factor: location.backoff_factor,
        };
        anyhow::ensure!(retry_policy.max_attempts > 0, "location.max_attempts must be at least 1");
        anyhow::ensure!(
            retry_policy.backoff_factor >= 1.0,
            "location.backoff_factor must be >= 1.0"
        );
        anyhow::ensure!(
            retry_policy.max_delay_ms >= retry_policy.base_delay_ms,
            "location.max_delay_ms must be >= location.base_delay_ms"
        );
        anyhow::ensure!(
            toml_config.broadcast.channel_capacity > 0,
            "broadcast.channel_capacity must be at least 1"
        );

        let default_radius = toml_config.admission.default_radius_meters;
        ensure_radius(default_radius, "admission.default_radius_meters")?;
        ensure_radius(toml_config.admission.nearby_radius_meters, "admission.nearby_radius_meters")?;

        let mut venues = Vec::with_capacity(toml_config.venues.len());
        for entry in toml_config.venues {
            let coordinate = Coordinate::new(entry.latitude, entry.longitude);
            anyhow::ensure!(coordinate.is_valid(), "venue {} has an invalid coordinate", entry.id);
            venues.push(Venue {
                id: VenueId(entry.id),
                name: entry.name,
                address: entry.address,
                coordinate,
            });
        }

        let mut shows = Vec::with_capacity(toml_config.shows.len());
        for entry in toml_config.shows {
            if let Some(radius) = entry.radius_meters {
                ensure_radius(radius, &format!("show {} radius_meters", entry.id))?;
            }
            shows.push(ShowSeed {
                id: SessionId(entry.id),
                name: entry.name,
                description: entry.description,
                venue_id: VenueId(entry.venue_id),
                start_time: entry.start_time,
                end_time: entry.end_time,
                host_id: entry.host_id.map(ParticipantId),
                radius_meters: entry.radius_meters.unwrap_or(default_radius),
                active: entry.active,
            });
        }

        Ok(Self {
            bind_address: toml_config.server.bind_address,
            port: toml_config.server.port,
            default_radius_meters: default_radius,
            nearby_radius_meters: toml_config.admission.nearby_radius_meters,
            distance_remote_url: toml_config.distance.remote_url,
            distance_timeout_ms: toml_config.distance.timeout_ms,
            retry_policy,
            location_source_url: location.source_url,
            location_request_timeout_ms: location.request_timeout_ms,
            location_watch_interval_ms: location.watch_interval_ms,
            broadcast_enabled: toml_config.broadcast.enabled,
            mqtt_host: toml_config.broadcast.mqtt_host,
            mqtt_port: toml_config.broadcast.mqtt_port,
            mqtt_username: toml_config.broadcast.username,
            mqtt_password: toml_config.broadcast.password,
            broadcast_topic_prefix: toml_config.broadcast.topic_prefix,
            broadcast_channel_capacity: toml_config.broadcast.channel_capacity,
            journal_file: toml_config.journal.file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            venues,
            shows,
            config_file,
        })
    }

    /// Load configuration from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn default_radius_meters(&self) -> f64 {
        self.default_radius_meters
    }

    pub fn nearby_radius_meters(&self) -> f64 {
        self.nearby_radius_meters
    }

    pub fn distance_remote_url(&self) -> Option<&str> {
        self.distance_remote_url.as_deref()
    }

    pub fn distance_timeout_ms(&self) -> u64 {
        self.distance_timeout_ms
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    pub fn location_source_url(&self) -> Option<&str> {
        self.location_source_url.as_deref()
    }

    pub fn location_request_timeout_ms(&self) -> u64 {
        self.location_request_timeout_ms
    }

    pub fn location_watch_interval_ms(&self) -> u64 {
        self.location_watch_interval_ms
    }

    pub fn broadcast_enabled(&self) -> bool {
        self.broadcast_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn broadcast_topic_prefix(&self) -> &str {
        &self.broadcast_topic_prefix
    }

    pub fn broadcast_channel_capacity(&self) -> usize {
        self.broadcast_channel_capacity
    }

    pub fn journal_file(&self) -> &str {
        &self.journal_file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn venues(&self) -> &[Venue] {
        &self.venues
    }

    pub fn shows(&self) -> &[ShowSeed] {
        &self.shows
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}
