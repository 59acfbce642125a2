//! Showgate - location-gated live show coordinator
//!
//! Module structure:
//! - `domain/` - Core business types (Session, Venue, deltas, errors)
//! - `io/` - External interfaces (HTTP API, MQTT broadcast, journal, clients)
//! - `services/` - Business logic (Registry, Admission, Queue, Distance, Location)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use showgate::infra::{Config, Metrics};
use showgate::io::{
    create_broadcast_channel, create_journal_worker, start_api_server, AppState, HttpDistance,
    MqttBroadcaster, NoopBroadcaster, SessionBroadcaster, SessionJournal,
};
use showgate::services::{DistanceEvaluator, SessionRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Showgate - live show session coordinator
#[derive(Parser, Debug)]
#[command(name = "showgate", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG overrides the default INFO level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = env!("GIT_HASH"), "showgate starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        bind_address = %config.bind_address(),
        port = %config.port(),
        default_radius_meters = %config.default_radius_meters(),
        nearby_radius_meters = %config.nearby_radius_meters(),
        distance_remote_url = ?config.distance_remote_url(),
        broadcast_enabled = %config.broadcast_enabled(),
        journal_file = %config.journal_file(),
        venues = %config.venues().len(),
        shows = %config.shows().len(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Session deltas go to MQTT when enabled, otherwise nowhere
    let broadcaster: Arc<dyn SessionBroadcaster> = if config.broadcast_enabled() {
        let (sender, rx) = create_broadcast_channel(config.broadcast_channel_capacity(), metrics.clone());
        let publisher = MqttBroadcaster::new(&config, rx);
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });
        Arc::new(sender)
    } else {
        Arc::new(NoopBroadcaster)
    };

    // Ended sessions are journaled off the request path
    let (journal_tx, journal_worker) = create_journal_worker(SessionJournal::new(config.journal_file()));
    tokio::spawn(journal_worker.run());

    let registry = Arc::new(
        SessionRegistry::from_config(&config, broadcaster, metrics.clone()).with_journal(journal_tx),
    );

    let distance_timeout = Duration::from_millis(config.distance_timeout_ms());
    let evaluator = match config.distance_remote_url() {
        Some(url) => match HttpDistance::new(url, distance_timeout) {
            Ok(remote) => DistanceEvaluator::with_remote(Arc::new(remote), distance_timeout),
            Err(e) => {
                warn!(url = %url, error = %e, "distance_remote_disabled");
                DistanceEvaluator::local()
            }
        },
        None => DistanceEvaluator::local(),
    };
    let distance = Arc::new(evaluator.with_metrics(metrics.clone()));

    let state = Arc::new(AppState::new(registry, distance, config.nearby_radius_meters()));
    let bind_address = config.bind_address().to_string();
    let port = config.port();
    let api_shutdown = shutdown_rx.clone();
    let api = tokio::spawn(async move {
        if let Err(e) = start_api_server(&bind_address, port, state, api_shutdown).await {
            error!(error = %e, "api_server_error");
        }
    });

    // Periodic metrics summary in the log
    let metrics_interval = config.metrics_interval_secs();
    if metrics_interval > 0 {
        let reporter_metrics = metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
            loop {
                interval.tick().await;
                reporter_metrics.report().log();
            }
        });
    }

    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // The API task returns on shutdown or a bind failure
    api.await?;

    // Let the broadcaster and journal drain before exit
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("showgate shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::ffi::OsStr;

    #[test]
    fn test_config_flag() {
        let args = Args::try_parse_from(["showgate", "--config", "config/prod.toml"]).unwrap();
        assert_eq!(args.config, "config/prod.toml");

        let args = Args::try_parse_from(["showgate", "-c", "club.toml"]).unwrap();
        assert_eq!(args.config, "club.toml");
    }

    #[test]
    fn test_config_path_falls_back_to_env_then_default() {
        let command = Args::command();
        let config = command.get_arguments().find(|a| a.get_id() == "config").unwrap();
        assert_eq!(config.get_env(), Some(OsStr::new("CONFIG_FILE")));
        assert!(config.get_default_values().iter().eq(["config/dev.toml"]));
    }
}
