//! Enterprise Service Bus (orchestrates registry, transformation, circuit
//! breaker and dead letter queue)

use crate::{
    circuit_breaker::*,
    config::EsbConfig,
    connector::{HttpConnector, ServiceConnector},
    dlq::*,
    metrics,
    registry::ServiceRegistry,
    transform::{TransformationEngine, TransformationMetrics},
    types::*,
    Error, Result,
};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Reason recorded when the target cannot be reached at all
pub const SERVICE_UNAVAILABLE_REASON: &str = "Service unavailable";

/// Route outcome label and dead-letter reason for a failed delivery.
///
/// A breaker that rejects the call (open, or a half-open trial already in
/// flight) counts as the target being unavailable.
fn dead_letter_reason(e: &Error) -> (&'static str, String) {
    match e {
        Error::ServiceUnavailable { .. } | Error::CircuitOpen { .. } => {
            ("unavailable", SERVICE_UNAVAILABLE_REASON.to_string())
        }
        Error::Transformation { .. } => ("transformation_failed", e.to_string()),
        _ => ("delivery_failed", e.to_string()),
    }
}

/// Enterprise service bus
pub struct EnterpriseServiceBus {
    /// Service registry
    registry: Arc<ServiceRegistry>,
    /// Transformation engine
    transformer: Arc<TransformationEngine>,
    /// Circuit breakers
    circuit_breakers: Arc<CircuitBreakerManager>,
    /// DLQ
    dlq: Arc<DeadLetterQueue>,
    /// Endpoint delivery
    connector: Arc<dyn ServiceConnector>,
    /// Per-attempt delivery timeout
    delivery_timeout: Duration,
}

impl EnterpriseServiceBus {
    /// Create a bus with fresh components built from `config`
    pub fn new(config: &EsbConfig, connector: Arc<dyn ServiceConnector>) -> Self {
        Self::from_parts(
            Arc::new(ServiceRegistry::new()),
            Arc::new(TransformationEngine::new(
                config.transform.xml_root_element.clone(),
            )),
            Arc::new(CircuitBreakerManager::new(config.breaker_config())),
            Arc::new(DeadLetterQueue::new(config.dead_letter_config())),
            connector,
            config.delivery_timeout(),
        )
    }

    /// Create a bus delivering over HTTP
    pub fn with_http(config: &EsbConfig) -> Result<Self> {
        let connector = HttpConnector::new(config.delivery_timeout())?;
        Ok(Self::new(config, Arc::new(connector)))
    }

    /// Assemble a bus from existing components
    pub fn from_parts(
        registry: Arc<ServiceRegistry>,
        transformer: Arc<TransformationEngine>,
        circuit_breakers: Arc<CircuitBreakerManager>,
        dlq: Arc<DeadLetterQueue>,
        connector: Arc<dyn ServiceConnector>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transformer,
            circuit_breakers,
            dlq,
            connector,
            delivery_timeout,
        }
    }

    /// Route a message to its target service.
    ///
    /// Returns `Ok(true)` once delivered. Unavailable targets, failed
    /// transformations and failed deliveries are dead-lettered and return
    /// `Ok(false)`. Only malformed messages (empty ID or target) are errors.
    pub async fn route_message(&self, message: ServiceBusMessage) -> Result<bool> {
        Self::check_message(&message)?;

        match self.attempt_delivery(&message).await {
            Ok(()) => {
                info!(
                    "Message {} delivered to {}",
                    message.id, message.target_service
                );
                metrics::record_route(&message.target_service, "delivered");
                Ok(true)
            }
            Err(e) => {
                let (outcome, reason) = dead_letter_reason(&e);
                metrics::record_route(&message.target_service, outcome);
                self.dlq.add(message, reason);
                Ok(false)
            }
        }
    }

    fn check_message(message: &ServiceBusMessage) -> Result<()> {
        if message.id.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "message id must not be empty".to_string(),
            ));
        }
        if message.target_service.trim().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "message {} has no target service",
                message.id
            )));
        }
        Ok(())
    }

    /// Registry + breaker check, transformation, breaker-wrapped delivery
    async fn attempt_delivery(&self, message: &ServiceBusMessage) -> Result<()> {
        let target = message.target_service.as_str();

        let endpoint = match self.registry.discover(target) {
            Some(entry) if entry.is_active => entry,
            _ => {
                return Err(Error::ServiceUnavailable {
                    service_name: target.to_string(),
                })
            }
        };
        if !self.circuit_breakers.is_available(target) {
            return Err(Error::ServiceUnavailable {
                service_name: target.to_string(),
            });
        }

        let outbound = self.prepare(message)?;

        let start = std::time::Instant::now();
        let result = self
            .circuit_breakers
            .execute(target, || self.send(&endpoint, &outbound))
            .await;
        metrics::ESB_DELIVERY_DURATION
            .with_label_values(&[target])
            .observe(start.elapsed().as_secs_f64());

        result.map_err(Error::from)
    }

    /// Apply the header-requested transformation, if any
    fn prepare(&self, message: &ServiceBusMessage) -> Result<ServiceBusMessage> {
        let mut outbound = message.clone();
        if let Some((source, target)) = message.format_pair() {
            if !source.eq_ignore_ascii_case(target) {
                outbound.payload = self
                    .transformer
                    .transform_str(&message.payload, source, target)?;
            }
        }
        Ok(outbound)
    }

    async fn send(&self, endpoint: &ServiceRegistryEntry, message: &ServiceBusMessage) -> Result<()> {
        match tokio::time::timeout(
            self.delivery_timeout,
            self.connector.deliver(endpoint, message),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                service_name: endpoint.service_name.clone(),
                seconds: self.delivery_timeout.as_secs(),
            }),
        }
    }

    /// True when the target is registered, active, and its breaker would
    /// admit a call
    pub fn is_service_available(&self, service_name: &str) -> bool {
        self.registry
            .discover(service_name)
            .is_some_and(|entry| entry.is_active)
            && self.circuit_breakers.is_available(service_name)
    }

    /// Transform a payload using header-style format names
    pub fn transform_message(&self, payload: &Payload, source: &str, target: &str) -> Result<Payload> {
        self.transformer.transform_str(payload, source, target)
    }

    /// Syntactic check; unknown format names are never valid
    pub fn validate_format(&self, payload: &Payload, format: &str) -> bool {
        format
            .parse::<MessageFormat>()
            .is_ok_and(|format| self.transformer.validate_format(payload, format))
    }

    /// Run arbitrary work behind the breaker for `service_name`
    pub async fn execute_with_circuit_breaker<T, E, F, Fut>(
        &self,
        service_name: &str,
        operation: F,
    ) -> std::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.circuit_breakers.execute(service_name, operation).await
    }

    /// Register (or replace) a service
    pub fn register_service(&self, entry: ServiceRegistryEntry) -> Result<bool> {
        self.registry.register(entry)
    }

    /// Look up a service
    pub fn discover_service(&self, service_name: &str) -> Option<ServiceRegistryEntry> {
        self.registry.discover(service_name)
    }

    /// Dead-letter a message directly
    pub fn handle_dead_letter(&self, message: ServiceBusMessage, reason: impl Into<String>) -> bool {
        self.dlq.add(message, reason)
    }

    /// Dead-lettered messages for a service, most recent first
    pub fn get_dead_letter_messages(&self, service_name: &str) -> Vec<ServiceBusMessage> {
        self.dlq.messages_for(service_name)
    }

    /// Retry a dead-lettered message with the configured attempt limit
    pub async fn retry_message(&self, message_id: &str) -> bool {
        let max_attempts = self.dlq.config().max_retry_attempts;
        self.retry_message_with_limit(message_id, max_attempts).await
    }

    /// Retry a dead-lettered message through the routing path.
    ///
    /// A failed retry updates the existing entry instead of adding a new one.
    pub async fn retry_message_with_limit(&self, message_id: &str, max_attempts: u32) -> bool {
        let outcome = self
            .dlq
            .retry(message_id, max_attempts, |message| async move {
                self.attempt_delivery(&message).await
            })
            .await;

        match outcome {
            Ok(RetryOutcome::Delivered) => {
                metrics::record_route("retry", "delivered");
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("Retry of message {} refused: {}", message_id, e);
                false
            }
        }
    }

    /// Administrative delete from the DLQ
    pub fn remove_from_dead_letter(&self, message_id: &str) -> bool {
        self.dlq.remove(message_id)
    }

    /// Dead-letter counts for a service
    pub fn get_dead_letter_metrics(&self, service_name: &str) -> DeadLetterMetrics {
        self.dlq.metrics(service_name)
    }

    /// Archive dead letters older than the configured age
    pub fn archive_expired_dead_letters(&self) -> usize {
        self.dlq.archive_expired()
    }

    /// Breaker status for a service
    pub fn get_circuit_breaker_status(&self, service_name: &str) -> CircuitBreakerStatus {
        self.circuit_breakers.status(service_name)
    }

    /// Force a breaker closed
    pub fn reset_circuit_breaker(&self, service_name: &str) {
        self.circuit_breakers.reset(service_name)
    }

    /// Force a breaker open
    pub fn force_open_circuit(&self, service_name: &str) {
        self.circuit_breakers.force_open(service_name)
    }

    /// Transformation counters
    pub fn get_transformation_metrics(&self) -> TransformationMetrics {
        self.transformer.metrics()
    }

    /// Combined view of one destination
    pub fn get_service_health(&self, service_name: &str) -> ServiceHealth {
        let entry = self.registry.discover(service_name);
        let circuit_state = self.circuit_breakers.state(service_name);
        let dead_letters_pending = self.dlq.metrics(service_name).pending;
        let is_active = entry.as_ref().is_some_and(|e| e.is_active);

        let status = if !is_active || circuit_state == CircuitState::Open {
            HealthStatus::Unhealthy
        } else if circuit_state == CircuitState::HalfOpen || dead_letters_pending > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ServiceHealth {
            service_name: service_name.to_string(),
            status,
            registered: entry.is_some(),
            is_active,
            circuit_state,
            dead_letters_pending,
            last_check: Utc::now(),
        }
    }

    /// Service registry
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Dead letter queue
    pub fn dead_letter_queue(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    /// Circuit breakers
    pub fn circuit_breakers(&self) -> &CircuitBreakerManager {
        &self.circuit_breakers
    }

    /// Connector in use
    pub fn connector_name(&self) -> &str {
        self.connector.name()
    }
}
