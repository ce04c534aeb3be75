//! Circuit breaker per destination service

use crate::metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Closed (normal operation)
    Closed,
    /// Open (rejecting requests)
    Open,
    /// Half-open (one trial call in flight)
    HalfOpen,
}

impl CircuitState {
    /// Gauge value (0=closed, 1=half-open, 2=open)
    pub fn as_metric_value(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure threshold (open after N consecutive failures)
    pub failure_threshold: u32,
    /// Cool-down before an open breaker admits a trial call
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: crate::DEFAULT_CB_FAILURE_THRESHOLD,
            cooldown: Duration::from_secs(crate::DEFAULT_CB_COOLDOWN_SECONDS),
        }
    }
}

/// Point-in-time view of one service's breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    /// Service name
    pub service_name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub failure_count: u32,
    /// Last failure time
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Last state change
    pub last_state_change: DateTime<Utc>,
}

impl CircuitBreakerStatus {
    fn closed(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            last_state_change: Utc::now(),
        }
    }
}

/// Error returned by [`CircuitBreakerManager::execute`]
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// Rejected without running the operation
    #[error("Circuit breaker open for service {service_name}, retry in {}s", retry_in.as_secs())]
    Open {
        /// Service name
        service_name: String,
        /// Cool-down left (zero while a half-open trial is in flight)
        retry_in: Duration,
    },

    /// The wrapped operation failed
    #[error("{0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    /// True for the fast-fail path
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

impl From<BreakerError<crate::Error>> for crate::Error {
    fn from(err: BreakerError<crate::Error>) -> Self {
        match err {
            BreakerError::Open {
                service_name,
                retry_in,
            } => crate::Error::CircuitOpen {
                service_name,
                retry_in_secs: retry_in.as_secs(),
            },
            BreakerError::Operation(e) => e,
        }
    }
}

/// How a call got through the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Closed breaker
    Normal,
    /// Single half-open trial
    Trial,
}

/// Breaker state for one service
#[derive(Debug, Clone)]
struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
    /// Monotonic time of the last transition to Open
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            last_state_change: Utc::now(),
            opened_at: None,
            trial_in_flight: false,
        }
    }

    /// Cool-down left while open; `None` once a trial may be admitted
    fn cooldown_remaining(&self, config: &CircuitBreakerConfig) -> Option<Duration> {
        let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or(config.cooldown);
        if elapsed >= config.cooldown {
            None
        } else {
            Some(config.cooldown - elapsed)
        }
    }

    fn try_acquire(
        &mut self,
        config: &CircuitBreakerConfig,
        service_name: &str,
    ) -> Result<Admission, Duration> {
        match self.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => match self.cooldown_remaining(config) {
                Some(remaining) => Err(remaining),
                None => {
                    info!("Circuit breaker half-opening for service {}", service_name);
                    self.transition(CircuitState::HalfOpen);
                    self.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            },
            CircuitState::HalfOpen if self.trial_in_flight => Err(Duration::ZERO),
            CircuitState::HalfOpen => {
                self.trial_in_flight = true;
                Ok(Admission::Trial)
            }
        }
    }

    fn record_success(&mut self, service_name: &str, admission: Admission) {
        match (admission, self.state) {
            (Admission::Trial, _) => {
                info!("Circuit breaker closing for service {}", service_name);
                self.trial_in_flight = false;
                self.failure_count = 0;
                self.opened_at = None;
                self.transition(CircuitState::Closed);
            }
            (Admission::Normal, CircuitState::Closed) => {
                self.failure_count = 0;
            }
            // A slow call finishing after another call tripped the breaker
            (Admission::Normal, _) => {}
        }
    }

    fn record_failure(
        &mut self,
        config: &CircuitBreakerConfig,
        service_name: &str,
        admission: Admission,
    ) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(Utc::now());

        match (admission, self.state) {
            (Admission::Trial, _) => {
                warn!("Circuit breaker re-opening for service {}", service_name);
                self.trial_in_flight = false;
                self.open();
            }
            (Admission::Normal, CircuitState::Closed)
                if self.failure_count >= config.failure_threshold =>
            {
                warn!(
                    "Circuit breaker opening for service {} after {} failures",
                    service_name, self.failure_count
                );
                self.open();
            }
            (Admission::Normal, _) => {}
        }
    }

    fn open(&mut self) {
        self.opened_at = Some(Instant::now());
        self.transition(CircuitState::Open);
    }

    fn transition(&mut self, state: CircuitState) {
        self.state = state;
        self.last_state_change = Utc::now();
    }

    fn status(&self, service_name: &str) -> CircuitBreakerStatus {
        CircuitBreakerStatus {
            service_name: service_name.to_string(),
            state: self.state,
            failure_count: self.failure_count,
            last_failure_at: self.last_failure_at,
            last_state_change: self.last_state_change,
        }
    }
}

/// Circuit breaker manager (one breaker per service name)
pub struct CircuitBreakerManager {
    /// Circuit breakers by service name
    breakers: DashMap<String, CircuitBreaker>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    /// Create new manager
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Policy in force
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` behind the breaker for `service_name`.
    ///
    /// An open breaker rejects with [`BreakerError::Open`] without polling the
    /// operation. Operation failures are recorded and handed back as
    /// [`BreakerError::Operation`]. Dropping the returned future mid-flight
    /// counts as a failure.
    pub async fn execute<T, E, F, Fut>(
        &self,
        service_name: &str,
        operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = match self.acquire(service_name) {
            Ok(admission) => admission,
            Err(retry_in) => {
                return Err(BreakerError::Open {
                    service_name: service_name.to_string(),
                    retry_in,
                })
            }
        };

        let mut guard = AttemptGuard {
            manager: self,
            service_name,
            admission,
            armed: true,
        };

        let result = operation().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.record_success(service_name, admission);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(service_name, admission);
                Err(BreakerError::Operation(e))
            }
        }
    }

    fn acquire(&self, service_name: &str) -> Result<Admission, Duration> {
        let mut breaker = self
            .breakers
            .entry(service_name.to_string())
            .or_insert_with(CircuitBreaker::new);
        let before = breaker.state;
        let admission = breaker.try_acquire(&self.config, service_name);
        if breaker.state != before {
            metrics::set_breaker_state(service_name, breaker.state);
        }
        if admission.is_err() {
            warn!("Circuit breaker for {} is open, rejecting call", service_name);
        }
        admission
    }

    fn record_success(&self, service_name: &str, admission: Admission) {
        if let Some(mut breaker) = self.breakers.get_mut(service_name) {
            breaker.record_success(service_name, admission);
            metrics::set_breaker_state(service_name, breaker.state);
        }
    }

    fn record_failure(&self, service_name: &str, admission: Admission) {
        if let Some(mut breaker) = self.breakers.get_mut(service_name) {
            breaker.record_failure(&self.config, service_name, admission);
            metrics::set_breaker_state(service_name, breaker.state);
        }
    }

    /// Status for `service_name`; unseen services report Closed with no
    /// failures. Never creates or mutates a record.
    pub fn status(&self, service_name: &str) -> CircuitBreakerStatus {
        self.breakers
            .get(service_name)
            .map(|b| b.status(service_name))
            .unwrap_or_else(|| CircuitBreakerStatus::closed(service_name))
    }

    /// Current state for `service_name`
    pub fn state(&self, service_name: &str) -> CircuitState {
        self.breakers
            .get(service_name)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// True when a call would be admitted: not open with cool-down still
    /// running, and no half-open trial already in flight
    pub fn is_available(&self, service_name: &str) -> bool {
        match self.breakers.get(service_name) {
            Some(breaker) => match breaker.state {
                CircuitState::Closed => true,
                CircuitState::Open => breaker.cooldown_remaining(&self.config).is_none(),
                CircuitState::HalfOpen => !breaker.trial_in_flight,
            },
            None => true,
        }
    }

    /// Reset circuit breaker (manual intervention)
    pub fn reset(&self, service_name: &str) {
        info!("Manually resetting circuit breaker for service {}", service_name);
        self.breakers
            .insert(service_name.to_string(), CircuitBreaker::new());
        metrics::set_breaker_state(service_name, CircuitState::Closed);
    }

    /// Trip the breaker open (manual intervention)
    pub fn force_open(&self, service_name: &str) {
        warn!("Manually opening circuit breaker for service {}", service_name);
        let mut breaker = self
            .breakers
            .entry(service_name.to_string())
            .or_insert_with(CircuitBreaker::new);
        breaker.failure_count = breaker.failure_count.max(self.config.failure_threshold);
        breaker.trial_in_flight = false;
        breaker.open();
        metrics::set_breaker_state(service_name, CircuitState::Open);
    }

    /// Status of every breaker seen so far, sorted by service name
    pub fn statuses(&self) -> Vec<CircuitBreakerStatus> {
        let mut statuses: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().status(entry.key()))
            .collect();
        statuses.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        statuses
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Records a failure if the attempt is dropped before it completes
struct AttemptGuard<'a> {
    manager: &'a CircuitBreakerManager,
    service_name: &'a str,
    admission: Admission,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                "Call to {} cancelled in flight, counting as failure",
                self.service_name
            );
            self.manager
                .record_failure(self.service_name, self.admission);
        }
    }
}
