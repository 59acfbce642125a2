//! Showgate client simulator
//!
//! Spawns N concurrent clients around a point. Each client acquires its
//! location, asks for nearby shows, joins the closest one and reports the
//! role it was given. Clients without a location never search; with
//! `--show` they attempt a degraded join of that show directly.
//!
//! Usage:
//!   cargo run --bin showgate-sim -- --clients 20 --lat 64.1466 --lng -21.9426
//!   cargo run --bin showgate-sim -- --no-location --show open-mic

use clap::Parser;
use showgate::domain::error::LocationError;
use showgate::domain::types::{Coordinate, ParticipantId, Role, SessionId, UserLocation};
use showgate::io::api_client::ClientError;
use showgate::infra::Config;
use showgate::io::{HttpPositionSource, ShowApiClient};
use showgate::services::location::{FixedPositionSource, PositionSource, UnsupportedPositionSource};
use showgate::services::LocationAcquirer;
use std::sync::Arc;
use std::time::{Duration, Instant};

const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

#[derive(Parser, Debug)]
#[command(name = "showgate-sim", about = "Concurrent join simulator for showgate")]
struct Args {
    /// Coordinator base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Number of concurrent clients
    #[arg(long, default_value = "10")]
    clients: usize,

    #[arg(long, default_value = "64.1466")]
    lat: f64,

    #[arg(long, default_value = "-21.9426")]
    lng: f64,

    /// Spacing between clients in meters, spread north of the start point
    #[arg(long, default_value = "2.0")]
    spacing: f64,

    /// Search radius in meters (server default when omitted)
    #[arg(long)]
    radius: Option<f64>,

    /// Simulate devices without location support
    #[arg(long)]
    no_location: bool,

    /// Show to join directly when the client has no location
    #[arg(long)]
    show: Option<String>,

    /// Leave the show after joining
    #[arg(long)]
    leave: bool,

    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Config file for the location retry policy and position endpoint
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Debug)]
enum Outcome {
    Joined { role: Role, degraded: bool, distance: Option<f64>, queue_position: Option<usize> },
    NoShows,
    Rejected(String),
    NoLocation(LocationError),
}

fn client_position(args: &Args, index: usize) -> UserLocation {
    let offset = args.spacing * index as f64 / METERS_PER_DEGREE_LAT;
    UserLocation::new(Coordinate::new(args.lat + offset, args.lng), Some(5.0))
}

fn position_source(args: &Args, config: &Config, index: usize) -> Arc<dyn PositionSource> {
    if args.no_location {
        return Arc::new(UnsupportedPositionSource);
    }
    if let Some(url) = config.location_source_url() {
        match HttpPositionSource::new(
            url,
            Duration::from_millis(config.location_request_timeout_ms()),
            Duration::from_millis(config.location_watch_interval_ms()),
        ) {
            Ok(source) => return Arc::new(source),
            Err(e) => println!("position endpoint unusable ({e}), using fixed positions"),
        }
    }
    Arc::new(FixedPositionSource::new(client_position(args, index)))
}

/// Show a client without a location may still join. There is no nearby
/// search without a position, so only an explicit `--show` qualifies.
fn degraded_target(args: &Args, error: LocationError) -> Result<SessionId, LocationError> {
    match &args.show {
        Some(show) if args.no_location => {
            println!("[{show}] joining without location: {}", error.guidance());
            Ok(SessionId::from(show.as_str()))
        }
        _ => Err(error),
    }
}

async fn run_client(
    args: Arc<Args>,
    config: Arc<Config>,
    api: ShowApiClient,
    index: usize,
) -> Result<Outcome, ClientError> {
    let participant = ParticipantId(format!("sim-{index:03}"));
    let acquirer = LocationAcquirer::new(position_source(&args, &config, index), config.retry_policy());

    let (show_id, location) = match acquirer.acquire().await {
        Ok(location) => {
            let shows = api.nearby(&location, args.radius).await?;
            let Some(closest) = shows.first() else {
                return Ok(Outcome::NoShows);
            };
            (closest.session.id.clone(), Some(location))
        }
        Err(e) => match degraded_target(&args, e) {
            Ok(show_id) => (show_id, None),
            Err(e) => return Ok(Outcome::NoLocation(e)),
        },
    };

    let reply = match api.join(&show_id, &participant, location.as_ref(), None).await {
        Ok(reply) => reply,
        Err(e @ ClientError::Api { .. }) => return Ok(Outcome::Rejected(e.to_string())),
        Err(e) => return Err(e),
    };

    if args.leave {
        let ended = api.leave(&show_id, &participant).await?;
        if ended {
            println!("[{participant}] left and ended {show_id}");
        }
    }

    Ok(Outcome::Joined {
        role: reply.user_role,
        degraded: reply.degraded,
        distance: reply.distance_meters,
        queue_position: reply.queue_position,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Arc::new(Args::parse());
    let config = Arc::new(match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    });
    let api = ShowApiClient::new(&args.url, Duration::from_millis(args.timeout_ms))?;

    println!("=== showgate-sim ===");
    println!("Target: {}", api.base_url());
    println!("Clients: {}  spacing: {} m", args.clients, args.spacing);
    println!();

    let started = Instant::now();
    let mut handles = Vec::with_capacity(args.clients);
    for index in 0..args.clients {
        let args = args.clone();
        let config = config.clone();
        let api = api.clone();
        handles.push(tokio::spawn(async move { (index, run_client(args, config, api, index).await) }));
    }

    let mut hosts = 0;
    let mut performers = 0;
    let mut failures = 0;
    for handle in handles {
        let (index, result) = handle.await?;
        match result {
            Ok(Outcome::Joined { role, degraded, distance, queue_position }) => {
                match role {
                    Role::Host => hosts += 1,
                    Role::Performer => performers += 1,
                }
                println!(
                    "[sim-{index:03}] {:<9} degraded={degraded} distance={} queue={}",
                    role.as_str(),
                    distance.map(|d| format!("{d:.1}m")).unwrap_or_else(|| "-".into()),
                    queue_position.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                );
            }
            Ok(Outcome::NoShows) => {
                failures += 1;
                println!("[sim-{index:03}] no shows nearby");
            }
            Ok(Outcome::Rejected(reason)) => {
                failures += 1;
                println!("[sim-{index:03}] rejected: {reason}");
            }
            Ok(Outcome::NoLocation(e)) => {
                failures += 1;
                println!("[sim-{index:03}] {} ({})", e.code(), e.guidance());
            }
            Err(e) => {
                failures += 1;
                println!("[sim-{index:03}] error: {e}");
            }
        }
    }

    println!();
    println!(
        "Done in {:?}: hosts={hosts} performers={performers} failures={failures}",
        started.elapsed()
    );
    Ok(())
}
