//! Great-circle distance between two coordinates
//!
//! The authoritative remote computation is preferred when configured. Any
//! remote failure (error, timeout, nonsense value) is absorbed and answered
//! with the local haversine formula.

use crate::domain::error::DistanceError;
use crate::domain::types::Coordinate;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Mean Earth radius (meters)
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Haversine distance in meters
pub fn haversine_meters(a: Coordinate, b: Coordinate) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push h marginally outside [0, 1] for antipodal points
    let h = h.clamp(0.0, 1.0);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_METERS * c
}

/// Authoritative distance service
#[async_trait]
pub trait RemoteDistance: Send + Sync {
    async fn distance_meters(&self, a: Coordinate, b: Coordinate) -> Result<f64, DistanceError>;
}

/// Which path produced a distance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceSource {
    Remote,
    /// No remote configured
    Local,
    /// Remote failed; local formula used instead
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceReading {
    pub meters: f64,
    pub source: DistanceSource,
}

pub struct DistanceEvaluator {
    remote: Option<Arc<dyn RemoteDistance>>,
    timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl DistanceEvaluator {
    /// Evaluator that only uses the local formula
    pub fn local() -> Self {
        Self { remote: None, timeout: Duration::ZERO, metrics: None }
    }

    /// Evaluator that asks `remote` first, bounded by `timeout`
    pub fn with_remote(remote: Arc<dyn RemoteDistance>, timeout: Duration) -> Self {
        Self { remote: Some(remote), timeout, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub async fn distance_meters(&self, a: Coordinate, b: Coordinate) -> f64 {
        self.evaluate(a, b).await.meters
    }

    pub async fn evaluate(&self, a: Coordinate, b: Coordinate) -> DistanceReading {
        if a == b {
            return DistanceReading { meters: 0.0, source: DistanceSource::Local };
        }

        let Some(remote) = &self.remote else {
            if let Some(m) = &self.metrics {
                m.record_distance_local();
            }
            return DistanceReading { meters: haversine_meters(a, b), source: DistanceSource::Local };
        };

        let error = match tokio::time::timeout(self.timeout, remote.distance_meters(a, b)).await {
            Ok(Ok(meters)) if meters.is_finite() && meters >= 0.0 => {
                if let Some(m) = &self.metrics {
                    m.record_distance_remote();
                }
                debug!(meters = %meters, "distance_remote");
                return DistanceReading { meters, source: DistanceSource::Remote };
            }
            Ok(Ok(meters)) => DistanceError::InvalidResponse(format!("distance {meters}")),
            Ok(Err(e)) => e,
            Err(_) => DistanceError::Timeout(self.timeout.as_millis() as u64),
        };

        let meters = haversine_meters(a, b);
        if let Some(m) = &self.metrics {
            m.record_distance_fallback();
        }
        warn!(error = %error, meters = %meters, "distance_remote_failed_using_haversine");
        DistanceReading { meters, source: DistanceSource::Fallback }
    }
}
