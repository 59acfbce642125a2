//! Location acquisition with bounded exponential-backoff retry
//!
//! `LocationAcquirer` wraps a platform `PositionSource`. A single-shot
//! `acquire()` retries transient failures per `RetryPolicy` and escalates to
//! `RetryExhausted`; a continuous watch forwards every platform update to the
//! subscribers without retrying. Dropping an `acquire()` future abandons any
//! pending backoff timer.

use crate::domain::error::LocationError;
use crate::domain::types::{epoch_ms, UserLocation};
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Retry configuration for single-shot acquisition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 1000, max_delay_ms: 10_000, backoff_factor: 2.0 }
    }
}

impl RetryPolicy {
    /// Delay after the failure of attempt `retry` (0-based):
    /// `min(base * factor^retry, max)`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.backoff_factor.powi(retry.min(i32::MAX as u32) as i32);
        let raw = self.base_delay_ms as f64 * exp;
        let capped = if raw.is_finite() { raw.min(self.max_delay_ms as f64) } else { self.max_delay_ms as f64 };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Platform location API
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Single-shot position request
    async fn current_position(&self) -> Result<UserLocation, LocationError>;

    /// Start platform-driven updates. The stream ends when the receiver is dropped.
    fn watch_position(
        &self,
    ) -> Result<mpsc::Receiver<Result<UserLocation, LocationError>>, LocationError> {
        Err(LocationError::unsupported("continuous location updates are not available"))
    }
}

/// Observable phase of the single-shot state machine
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireState {
    Idle,
    Requesting { attempt: u32 },
    Backoff { attempt: u32, delay_ms: u64, last_error: LocationError },
    Acquired { attempts: u32 },
    Failed { error: LocationError },
}

/// Handle returned by `subscribe_*`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type LocationCallback = Arc<dyn Fn(&UserLocation) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&LocationError) + Send + Sync>;

/// Callback list; notification runs on a snapshot so callbacks may
/// (un)subscribe without deadlocking
struct Observers<F: ?Sized> {
    entries: Mutex<Vec<(SubscriptionId, Arc<F>)>>,
}

impl<F: ?Sized> Observers<F> {
    fn new() -> Self {
        Self { entries: Mutex::new(Vec::new()) }
    }

    fn add(&self, id: SubscriptionId, callback: Arc<F>) {
        self.entries.lock().push((id, callback));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries.lock().iter().map(|(_, cb)| cb.clone()).collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Instance-scoped location service with location and error observers
pub struct LocationAcquirer {
    source: Arc<dyn PositionSource>,
    policy: RetryPolicy,
    metrics: Option<Arc<Metrics>>,
    location_observers: Observers<dyn Fn(&UserLocation) + Send + Sync>,
    error_observers: Observers<dyn Fn(&LocationError) + Send + Sync>,
    next_subscription: AtomicU64,
    last_location: Mutex<Option<UserLocation>>,
    state: Mutex<AcquireState>,
}

impl LocationAcquirer {
    pub fn new(source: Arc<dyn PositionSource>, policy: RetryPolicy) -> Self {
        Self {
            source,
            policy,
            metrics: None,
            location_observers: Observers::new(),
            error_observers: Observers::new(),
            next_subscription: AtomicU64::new(1),
            last_location: Mutex::new(None),
            state: Mutex::new(AcquireState::Idle),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn state(&self) -> AcquireState {
        self.state.lock().clone()
    }

    /// Most recent successful fix no older than `max_age`
    pub fn last_known(&self, max_age: Duration) -> Option<UserLocation> {
        let last = (*self.last_location.lock())?;
        (last.age_ms(epoch_ms()) as u128 <= max_age.as_millis()).then_some(last)
    }

    pub fn subscribe_location<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&UserLocation) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let callback: LocationCallback = Arc::new(callback);
        self.location_observers.add(id, callback);
        id
    }

    pub fn subscribe_errors<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&LocationError) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let callback: ErrorCallback = Arc::new(callback);
        self.error_observers.add(id, callback);
        id
    }

    /// Remove a subscription of either kind. Returns false if unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.location_observers.remove(id) || self.error_observers.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.location_observers.len() + self.error_observers.len()
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    /// Acquire the current position, retrying transient failures.
    ///
    /// Non-retryable errors fail immediately. After `max_attempts` retryable
    /// failures the result is `RetryExhausted` wrapping the last error.
    pub async fn acquire(&self) -> Result<UserLocation, LocationError> {
        let mut guard = StateGuard { state: &self.state, finished: false };
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.set_state(AcquireState::Requesting { attempt });
            if let Some(m) = &self.metrics {
                m.record_location_attempt();
            }

            let error = match self.source.current_position().await {
                Ok(location) => {
                    debug!(
                        attempt = %attempt,
                        latitude = %location.coordinate.latitude,
                        longitude = %location.coordinate.longitude,
                        accuracy_m = ?location.accuracy_meters,
                        "location_acquired"
                    );
                    guard.finished = true;
                    self.set_state(AcquireState::Acquired { attempts: attempt });
                    self.notify_location(&location);
                    return Ok(location);
                }
                Err(e) => e,
            };

            if !error.retryable() {
                info!(attempt = %attempt, code = %error.code(), error = %error, "location_failed");
                return Err(self.fail(&mut guard, error));
            }

            if attempt >= self.policy.max_attempts {
                let exhausted = LocationError::RetryExhausted { attempts: attempt, last: Box::new(error) };
                warn!(attempts = %attempt, error = %exhausted, "location_retry_exhausted");
                return Err(self.fail(&mut guard, exhausted));
            }

            let mut delay = self.policy.delay_for(attempt - 1);
            // A server hint may stretch the backoff but never past max_delay_ms
            if let Some(retry_after) = error.retry_after_ms() {
                delay = delay.max(Duration::from_millis(retry_after.min(self.policy.max_delay_ms)));
            }
            debug!(
                attempt = %attempt,
                delay_ms = %delay.as_millis(),
                code = %error.code(),
                "location_retry_scheduled"
            );
            if let Some(m) = &self.metrics {
                m.record_location_retry();
            }
            self.set_state(AcquireState::Backoff {
                attempt,
                delay_ms: delay.as_millis() as u64,
                last_error: error,
            });
            tokio::time::sleep(delay).await;
        }
    }

    fn fail(&self, guard: &mut StateGuard<'_>, error: LocationError) -> LocationError {
        guard.finished = true;
        if let Some(m) = &self.metrics {
            m.record_location_failure();
        }
        self.set_state(AcquireState::Failed { error: error.clone() });
        self.notify_error(&error);
        error
    }

    fn set_state(&self, state: AcquireState) {
        *self.state.lock() = state;
    }

    fn notify_location(&self, location: &UserLocation) {
        *self.last_location.lock() = Some(*location);
        for callback in self.location_observers.snapshot() {
            callback(location);
        }
    }

    fn notify_error(&self, error: &LocationError) {
        for callback in self.error_observers.snapshot() {
            callback(error);
        }
    }

    /// Start continuous watch mode.
    ///
    /// Every platform update goes straight to the observers; errors are not
    /// retried. Runs until `WatchHandle::stop` or the handle is dropped.
    pub fn start_watch(self: &Arc<Self>) -> Result<WatchHandle, LocationError> {
        let mut updates = self.source.watch_position()?;
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let acquirer = Arc::clone(self);

        let task = tokio::spawn(async move {
            info!("location_watch_started");
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                    update = updates.recv() => match update {
                        Some(Ok(location)) => acquirer.notify_location(&location),
                        Some(Err(error)) => {
                            debug!(code = %error.code(), error = %error, "location_watch_error");
                            acquirer.notify_error(&error);
                        }
                        None => break,
                    }
                }
            }
            info!("location_watch_stopped");
        });

        Ok(WatchHandle { stop_tx, task: Some(task) })
    }
}

/// Resets the observable state if an acquisition is abandoned mid-flight
struct StateGuard<'a> {
    state: &'a Mutex<AcquireState>,
    finished: bool,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.state.lock() = AcquireState::Idle;
        }
    }
}

/// Running watch; stops on `stop()` or drop
pub struct WatchHandle {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl WatchHandle {
    /// Stop the watch and wait for the forwarding task to finish
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Source that always reports the same position (kiosks, fixed installations)
pub struct FixedPositionSource {
    location: UserLocation,
}

impl FixedPositionSource {
    pub fn new(location: UserLocation) -> Self {
        Self { location }
    }
}

#[async_trait]
impl PositionSource for FixedPositionSource {
    async fn current_position(&self) -> Result<UserLocation, LocationError> {
        Ok(UserLocation { captured_at_ms: epoch_ms(), ..self.location })
    }
}

/// Source for devices without any location capability
pub struct UnsupportedPositionSource;

#[async_trait]
impl PositionSource for UnsupportedPositionSource {
    async fn current_position(&self) -> Result<UserLocation, LocationError> {
        Err(LocationError::unsupported("this device has no location provider"))
    }
}
