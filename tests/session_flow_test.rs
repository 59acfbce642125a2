//! End-to-end tests over a real socket: nearby search, proximity-gated join,
//! host departure and the session journal.

use chrono::Utc;
use showgate::domain::session::{Session, SessionStateDelta};
use showgate::domain::types::{Coordinate, ParticipantId, Role, SessionId, UserLocation, Venue, VenueId};
use showgate::infra::Metrics;
use showgate::io::api_client::{ClientError, HttpDistance};
use showgate::io::broadcast_channel::RecordingBroadcaster;
use showgate::io::http_api::{serve, AppState};
use showgate::io::{create_journal_worker, SessionJournal, ShowApiClient};
use showgate::services::distance::{haversine_meters, DistanceSource, EARTH_RADIUS_METERS};
use showgate::services::{DistanceEvaluator, SessionRegistry};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;

const HARPA: Coordinate = Coordinate::new(64.1503, -21.9326);

struct TestServer {
    client: ShowApiClient,
    broadcaster: Arc<RecordingBroadcaster>,
    journal_path: String,
    shutdown: watch::Sender<bool>,
    _dir: TempDir,
}

fn at_meters_north(m: f64) -> UserLocation {
    let latitude = HARPA.latitude + (m / EARTH_RADIUS_METERS).to_degrees();
    UserLocation::new(Coordinate::new(latitude, HARPA.longitude), Some(5.0))
}

async fn start_server() -> TestServer {
    let dir = TempDir::new().unwrap();
    let journal_path = dir.path().join("journal/sessions.jsonl").to_string_lossy().into_owned();

    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let (journal_tx, journal_worker) = create_journal_worker(SessionJournal::new(&journal_path));
    tokio::spawn(journal_worker.run());
    let registry =
        SessionRegistry::new(broadcaster.clone(), Arc::new(Metrics::new())).with_journal(journal_tx);
    registry.add_venue(Venue {
        id: VenueId::from("harpa"),
        name: "Harpa".to_string(),
        address: "Austurbakki 2".to_string(),
        coordinate: HARPA,
    });
    registry.open_session(Session::new(
        SessionId::from("open-mic"),
        "Open Mic",
        VenueId::from("harpa"),
        Utc::now(),
        30.0,
    ));

    let state = Arc::new(AppState::new(Arc::new(registry), Arc::new(DistanceEvaluator::local()), 30.0));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(serve(listener, state, shutdown_rx));

    let client = ShowApiClient::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap();
    TestServer { client, broadcaster, journal_path, shutdown, _dir: dir }
}

/// The journal is written by a background worker; wait for the first line
async fn first_journal_line(path: &str) -> serde_json::Value {
    for _ in 0..100 {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Some((line, _)) = content.split_once('\n') {
                return serde_json::from_str(line).unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("journal {path} was never written");
}

#[tokio::test]
async fn test_nearby_respects_radius() {
    let server = start_server().await;

    let shows = server.client.nearby(&at_meters_north(20.0), None).await.unwrap();
    assert_eq!(shows.len(), 1);
    assert_eq!(shows[0].session.id, SessionId::from("open-mic"));
    assert_eq!(shows[0].venue.id, VenueId::from("harpa"));
    assert!((shows[0].distance_meters - 20.0).abs() < 0.5);

    let shows = server.client.nearby(&at_meters_north(200.0), None).await.unwrap();
    assert!(shows.is_empty());

    let shows = server.client.nearby(&at_meters_north(200.0), Some(250.0)).await.unwrap();
    assert_eq!(shows.len(), 1);

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn test_join_flow_and_host_departure() {
    let server = start_server().await;
    let sid = SessionId::from("open-mic");
    let host = ParticipantId::from("host");
    let singer = ParticipantId::from("singer");

    let reply = server.client.join(&sid, &host, Some(&at_meters_north(5.0)), None).await.unwrap();
    assert_eq!(reply.user_role, Role::Host);
    assert!(!reply.degraded);

    let reply = server.client.join(&sid, &singer, Some(&at_meters_north(25.0)), None).await.unwrap();
    assert_eq!(reply.user_role, Role::Performer);
    assert_eq!(reply.queue_position, Some(1));

    // Rejoining is idempotent and keeps the role
    let reply = server.client.join(&sid, &singer, None, None).await.unwrap();
    assert!(reply.already_member);
    assert_eq!(reply.user_role, Role::Performer);

    let err = server
        .client
        .join(&sid, &ParticipantId::from("far"), Some(&at_meters_north(80.0)), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Api { status: 403, .. }));
    assert_eq!(err.code(), Some("OUT_OF_RANGE"));

    // No location at all still admits, flagged as degraded
    let reply = server.client.join(&sid, &ParticipantId::from("nogps"), None, None).await.unwrap();
    assert!(reply.degraded);

    assert!(server.client.leave(&sid, &host).await.unwrap());

    let err = server
        .client
        .join(&sid, &ParticipantId::from("late"), Some(&at_meters_north(1.0)), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("SESSION_INACTIVE"));

    let shows = server.client.nearby(&at_meters_north(1.0), None).await.unwrap();
    assert!(shows.is_empty());

    let line = first_journal_line(&server.journal_path).await;
    assert_eq!(line["id"], "open-mic");
    assert_eq!(line["isActive"], false);

    let envelopes = server.broadcaster.for_session(&sid);
    let seqs: Vec<u64> = envelopes.iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert!(matches!(
        envelopes.last().map(|e| &e.delta),
        Some(SessionStateDelta::SessionEnded { .. })
    ));

    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn test_unknown_show_is_not_found() {
    let server = start_server().await;
    let err = server
        .client
        .join(&SessionId::from("nope"), &ParticipantId::from("a"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Api { status: 404, .. }));
    assert_eq!(err.code(), Some("SESSION_NOT_FOUND"));
    let _ = server.shutdown.send(true);
}

#[tokio::test]
async fn test_remote_distance_over_http() {
    let server = start_server().await;
    let remote = HttpDistance::new(server.client.base_url(), Duration::from_secs(2)).unwrap();
    let evaluator = DistanceEvaluator::with_remote(Arc::new(remote), Duration::from_secs(2));

    let b = at_meters_north(100.0).coordinate;
    let reading = evaluator.evaluate(HARPA, b).await;
    assert_eq!(reading.source, DistanceSource::Remote);
    assert!((reading.meters - haversine_meters(HARPA, b)).abs() < 1e-6);

    let _ = server.shutdown.send(true);
}
