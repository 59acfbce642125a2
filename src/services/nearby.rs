//! Nearby show discovery

use crate::domain::error::NearbyError;
use crate::domain::session::SessionSummary;
use crate::domain::types::{UserLocation, Venue, VenueId};
use crate::services::distance::DistanceEvaluator;
use crate::services::registry::SessionRegistry;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// An active show within reach of the user. Computed per query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyShowResult {
    pub session: SessionSummary,
    pub venue: Venue,
    pub distance_meters: f64,
}

pub struct NearbyShowFinder {
    registry: Arc<SessionRegistry>,
    distance: Arc<DistanceEvaluator>,
    default_radius_meters: f64,
}

impl NearbyShowFinder {
    pub fn new(
        registry: Arc<SessionRegistry>,
        distance: Arc<DistanceEvaluator>,
        default_radius_meters: f64,
    ) -> Self {
        Self { registry, distance, default_radius_meters }
    }

    pub fn default_radius_meters(&self) -> f64 {
        self.default_radius_meters
    }

    /// Active shows whose venue is within `radius_meters` (inclusive),
    /// closest first, ties broken by start time.
    ///
    /// Works from a snapshot of the registry; sessions may change while the
    /// distances are being computed.
    pub async fn find_nearby(
        &self,
        location: Option<&UserLocation>,
        radius_meters: Option<f64>,
    ) -> Result<Vec<NearbyShowResult>, NearbyError> {
        let location = location.ok_or(NearbyError::LocationUnavailable)?;
        let origin = location.coordinate;
        if !origin.is_valid() {
            return Err(NearbyError::InvalidLocation {
                latitude: origin.latitude,
                longitude: origin.longitude,
            });
        }

        let radius = radius_meters.unwrap_or(self.default_radius_meters);
        if !radius.is_finite() || radius < 0.0 {
            return Err(NearbyError::InvalidRadius(radius));
        }

        let sessions = self.registry.list_active_sessions();
        let mut venue_distance: FxHashMap<VenueId, Option<(Venue, f64)>> = FxHashMap::default();
        let mut results = Vec::new();

        for session in sessions {
            let venue_id = session.venue_id().clone();
            if !venue_distance.contains_key(&venue_id) {
                let entry = match self.registry.get_venue(&venue_id) {
                    Some(venue) => {
                        let meters = self.distance.distance_meters(origin, venue.coordinate).await;
                        Some((venue, meters))
                    }
                    None => None,
                };
                venue_distance.insert(venue_id.clone(), entry);
            }

            let Some(Some((venue, meters))) = venue_distance.get(&venue_id) else {
                debug!(session_id = %session.id(), venue_id = %venue_id, "nearby_venue_missing");
                continue;
            };
            if *meters <= radius {
                results.push(NearbyShowResult {
                    session: session.summary(),
                    venue: venue.clone(),
                    distance_meters: *meters,
                });
            }
        }

        results.sort_by(|a, b| {
            a.distance_meters
                .total_cmp(&b.distance_meters)
                .then_with(|| a.session.start_time.cmp(&b.session.start_time))
        });

        debug!(
            latitude = %origin.latitude,
            longitude = %origin.longitude,
            radius_m = %radius,
            found = %results.len(),
            "nearby_shows"
        );
        Ok(results)
    }
}
